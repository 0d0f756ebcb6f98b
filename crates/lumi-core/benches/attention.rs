//! Attention tier and full-model benchmarks.
//!
//! Compares the fused-primitive tier against the manual reference tier
//! across sequence lengths and GQA ratios, and times a full forward pass of
//! the `tiny` preset.

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lumi_core::attention::{AttentionBackend, AttentionConfig};
use lumi_core::model::{DecoderStack, ModelConfig, Precision};
use lumi_core::{ForwardCtx, SeededRng};

fn normal(rng: &mut SeededRng, dims: &[usize]) -> Tensor {
    let n = dims.iter().product();
    Tensor::from_vec(rng.normal_vec(n, 0.0, 1.0).unwrap(), dims, &Device::Cpu).unwrap()
}

/// Benchmark: tiers at increasing sequence length.
fn bench_tiers_by_seq_len(c: &mut Criterion) {
    let mut group = c.benchmark_group("attention_seq_len");
    let config = AttentionConfig::new(8, 8, 64);
    let mut rng = SeededRng::new(0);

    for seq_len in [64usize, 256, 512] {
        let q = normal(&mut rng, &[1, 8, seq_len, 64]);
        let k = normal(&mut rng, &[1, 8, seq_len, 64]);
        let v = normal(&mut rng, &[1, 8, seq_len, 64]);
        group.throughput(Throughput::Elements(seq_len as u64));

        for backend in [AttentionBackend::Manual, AttentionBackend::FusedPrimitive] {
            group.bench_with_input(BenchmarkId::new(backend.name(), seq_len), &seq_len, |b, _| {
                b.iter(|| {
                    let out = backend
                        .compute(black_box(&q), &k, &v, &config, &mut ForwardCtx::inference())
                        .unwrap();
                    black_box(out)
                })
            });
        }
    }

    group.finish();
}

/// Benchmark: grouped KV heads avoid materializing repeated keys/values.
fn bench_tiers_by_gqa_ratio(c: &mut Criterion) {
    let mut group = c.benchmark_group("attention_gqa");
    let mut rng = SeededRng::new(1);
    let seq_len = 256;

    for num_kv_heads in [12usize, 4, 1] {
        let config = AttentionConfig::new(12, num_kv_heads, 64);
        let q = normal(&mut rng, &[1, 12, seq_len, 64]);
        let k = normal(&mut rng, &[1, num_kv_heads, seq_len, 64]);
        let v = normal(&mut rng, &[1, num_kv_heads, seq_len, 64]);

        for backend in [AttentionBackend::Manual, AttentionBackend::FusedPrimitive] {
            group.bench_with_input(
                BenchmarkId::new(backend.name(), format!("kv{num_kv_heads}")),
                &num_kv_heads,
                |b, _| {
                    b.iter(|| {
                        let out = backend
                            .compute(black_box(&q), &k, &v, &config, &mut ForwardCtx::inference())
                            .unwrap();
                        black_box(out)
                    })
                },
            );
        }
    }

    group.finish();
}

/// Benchmark: full `tiny` forward pass.
fn bench_tiny_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiny_forward");
    group.sample_size(10);

    let model = DecoderStack::new(
        ModelConfig::tiny(),
        &Device::Cpu,
        Precision::full(),
        &mut SeededRng::new(2),
    )
    .unwrap();
    let rows: Vec<Vec<u32>> = (0..2).map(|b| (0..64).map(|i| (b * 131 + i * 17) % 32768).collect()).collect();
    let ids = DecoderStack::ids_tensor(&rows, &Device::Cpu).unwrap();

    group.throughput(Throughput::Elements(128));
    group.bench_function("batch2_seq64", |b| {
        b.iter(|| {
            let logits = model.forward(black_box(&ids), &mut ForwardCtx::inference()).unwrap();
            black_box(logits)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_tiers_by_seq_len,
    bench_tiers_by_gqa_ratio,
    bench_tiny_forward,
);

criterion_main!(benches);
