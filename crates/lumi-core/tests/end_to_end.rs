//! End-to-end behavior of the decoder stack.

use candle_core::{DType, Device, Tensor};
use lumi_core::attention::{AttentionBackend, AttentionConfig, BackendPreference};
use lumi_core::model::{DecoderStack, DropoutConfig, ModelConfig, Precision};
use lumi_core::{ForwardCtx, LumiError, SeededRng};

fn random_ids(batch: usize, seq_len: usize, vocab: usize, seed: u64) -> Tensor {
    let mut rng = SeededRng::new(seed);
    let rows: Vec<Vec<u32>> = (0..batch)
        .map(|_| {
            (0..seq_len)
                .map(|_| ((rng.uniform() * vocab as f32) as u32).min(vocab as u32 - 1))
                .collect()
        })
        .collect();
    DecoderStack::ids_tensor(&rows, &Device::Cpu).unwrap()
}

fn build(config: ModelConfig, precision: Precision, seed: u64) -> DecoderStack {
    DecoderStack::new(config, &Device::Cpu, precision, &mut SeededRng::new(seed)).unwrap()
}

fn small_config() -> ModelConfig {
    ModelConfig::tiny()
        .with_vocab_size(128)
        .with_num_layers(2)
        .with_max_position_embeddings(64)
        .with_dropout(DropoutConfig::disabled())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let a = a.to_dtype(DType::F32).unwrap();
    let b = b.to_dtype(DType::F32).unwrap();
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

fn all_finite(t: &Tensor) -> bool {
    t.to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .iter()
        .all(|v| v.is_finite())
}

#[test]
fn tiny_preset_produces_finite_logits() {
    let model = build(ModelConfig::tiny(), Precision::full(), 0);
    let ids = random_ids(2, 16, 32768, 1);

    let logits = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();

    assert_eq!(logits.dims(), &[2, 16, 32768]);
    assert!(all_finite(&logits));
}

#[test]
fn inference_is_bit_identical() {
    let model = build(small_config(), Precision::full(), 3);
    let ids = random_ids(2, 10, 128, 4);

    let a = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    let b = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    assert_eq!(max_abs_diff(&a, &b), 0.0);
}

#[test]
fn training_dropout_is_reproducible_per_seed() {
    let config = small_config().with_dropout(DropoutConfig::uniform(0.1));
    let model = build(config, Precision::full(), 3);
    let ids = random_ids(1, 12, 128, 5);

    let run = |seed| {
        let mut rng = SeededRng::new(seed);
        model.forward(&ids, &mut ForwardCtx::training(&mut rng)).unwrap()
    };
    assert_eq!(max_abs_diff(&run(9), &run(9)), 0.0);
    assert!(max_abs_diff(&run(9), &run(10)) > 0.0);

    // Dropout is off in inference even though the config enables it.
    let a = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    let b = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    assert_eq!(max_abs_diff(&a, &b), 0.0);
}

#[test]
fn depth_changes_only_internals() {
    let ids = random_ids(2, 8, 128, 6);
    for layers in [1, 2, 5] {
        let model = build(small_config().with_num_layers(layers), Precision::full(), 7);
        let logits = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();
        assert_eq!(logits.dims(), &[2, 8, 128]);
        assert_eq!(model.layers().len(), layers);
    }
}

#[test]
fn future_tokens_do_not_affect_past_logits() {
    let model = build(small_config(), Precision::full(), 11);
    let ids = random_ids(1, 16, 128, 12);
    let mut perturbed: Vec<u32> = ids.flatten_all().unwrap().to_vec1().unwrap();
    for t in perturbed.iter_mut().skip(10) {
        *t = (*t + 17) % 128;
    }
    let perturbed = DecoderStack::ids_tensor(&[perturbed], &Device::Cpu).unwrap();

    let a = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    let b = model.forward(&perturbed, &mut ForwardCtx::inference()).unwrap();

    let past = max_abs_diff(&a.narrow(1, 0, 10).unwrap(), &b.narrow(1, 0, 10).unwrap());
    assert!(past < 1e-6, "past logits moved by {past}");
    let future = max_abs_diff(&a.narrow(1, 10, 6).unwrap(), &b.narrow(1, 10, 6).unwrap());
    assert!(future > 0.0);
}

#[test]
fn backend_tiers_agree_in_full_precision() {
    let ids = random_ids(2, 20, 128, 13);
    let config = small_config().with_num_key_value_heads(2);

    let manual = build(config.clone().with_attention_backend(BackendPreference::Manual), Precision::full(), 14);
    let fused = build(config.with_attention_backend(BackendPreference::FusedPrimitive), Precision::full(), 14);
    assert_eq!(manual.backend(), AttentionBackend::Manual);
    assert_eq!(fused.backend(), AttentionBackend::FusedPrimitive);

    let a = manual.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    let b = fused.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-5);
}

#[test]
fn backend_tiers_agree_in_mixed_precision() {
    let ids = random_ids(1, 12, 128, 15);
    let precision = Precision::mixed(DType::F16);

    let manual = build(small_config().with_attention_backend(BackendPreference::Manual), precision, 16);
    let fused = build(small_config().with_attention_backend(BackendPreference::FusedPrimitive), precision, 16);

    let a = manual.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    let b = fused.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    assert_eq!(a.dtype(), DType::F16);
    assert!(all_finite(&a));
    assert!(max_abs_diff(&a, &b) < 1e-3);

    // Parameters stay in full precision.
    assert_eq!(manual.params().dtype(), DType::F32);
}

#[test]
fn auto_selection_on_cpu() {
    let model = build(small_config(), Precision::full(), 0);
    assert_eq!(model.backend(), AttentionBackend::FusedPrimitive);

    let f64_model = build(small_config(), Precision { param_dtype: DType::F64, compute_dtype: DType::F64 }, 0);
    assert_eq!(f64_model.backend(), AttentionBackend::Manual);
}

#[test]
fn grouped_query_heads_share_key_value_heads() {
    // 12 query heads over 4 KV heads: groups {0,1,2}, {3,4,5}, ...
    let config = AttentionConfig::new(12, 4, 16);
    let mut rng = SeededRng::new(17);
    let normal = |rng: &mut SeededRng, dims: &[usize]| {
        let n = dims.iter().product();
        Tensor::from_vec(rng.normal_vec(n, 0.0, 1.0).unwrap(), dims, &Device::Cpu).unwrap()
    };

    // Every query head carries the same query vectors.
    let q_head = normal(&mut rng, &[1, 1, 6, 16]);
    let q = q_head.repeat((1, 12, 1, 1)).unwrap();
    let k = normal(&mut rng, &[1, 4, 6, 16]);
    let v = normal(&mut rng, &[1, 4, 6, 16]);

    for backend in [AttentionBackend::Manual, AttentionBackend::FusedPrimitive] {
        let out = backend.compute(&q, &k, &v, &config, &mut ForwardCtx::inference()).unwrap();
        let head = |h: usize| out.narrow(1, h, 1).unwrap();

        for group in 0..4 {
            for member in 1..3 {
                assert!(max_abs_diff(&head(group * 3), &head(group * 3 + member)) < 1e-6);
            }
        }
        assert!(max_abs_diff(&head(0), &head(3)) > 0.0);

        // Perturb KV head 1: only query heads 3, 4, 5 move, and identically.
        let delta = Tensor::cat(
            &[
                Tensor::zeros((1, 1, 6, 16), DType::F32, &Device::Cpu).unwrap(),
                Tensor::ones((1, 1, 6, 16), DType::F32, &Device::Cpu).unwrap(),
                Tensor::zeros((1, 2, 6, 16), DType::F32, &Device::Cpu).unwrap(),
            ],
            1,
        )
        .unwrap();
        let v2 = (&v + &delta).unwrap();
        let out2 = backend.compute(&q, &k, &v2, &config, &mut ForwardCtx::inference()).unwrap();
        let changed = (&out2 - &out).unwrap();
        let change = |h: usize| changed.narrow(1, h, 1).unwrap();

        for h in 0..12 {
            let moved = max_abs_diff(&change(h), &change(h).zeros_like().unwrap());
            if (3..6).contains(&h) {
                assert!(moved > 0.5, "head {h} should follow KV head 1");
                assert!(max_abs_diff(&change(h), &change(3)) < 1e-6);
            } else {
                assert_eq!(moved, 0.0, "head {h} must not see KV head 1");
            }
        }
    }
}

#[test]
fn causal_weights_are_zero_in_every_head() {
    let config = AttentionConfig::new(4, 2, 16);
    let mut rng = SeededRng::new(19);
    let mut normal = |dims: &[usize]| {
        let n = dims.iter().product();
        Tensor::from_vec(rng.normal_vec(n, 0.0, 1.0).unwrap(), dims, &Device::Cpu).unwrap()
    };
    let q = normal(&[3, 4, 9, 16]);
    let k = normal(&[3, 2, 9, 16]);

    let probs = AttentionBackend::FusedPrimitive.probabilities(&q, &k, &config).unwrap();
    let probs: Vec<Vec<Vec<Vec<f32>>>> = (0..3)
        .map(|b| probs.get(b).unwrap().to_vec3::<f32>().unwrap())
        .collect();
    for batch in &probs {
        for head in batch {
            for (i, row) in head.iter().enumerate() {
                let total: f32 = row.iter().sum();
                assert!((total - 1.0).abs() < 1e-5);
                for (j, p) in row.iter().enumerate() {
                    if j > i {
                        assert_eq!(*p, 0.0);
                    }
                }
            }
        }
    }
}

#[test]
fn incremental_decoding_matches_full_forward() {
    let model = build(small_config().with_num_key_value_heads(2), Precision::full(), 21);
    let ids = random_ids(1, 9, 128, 22);
    let full = model.forward(&ids, &mut ForwardCtx::inference()).unwrap();

    let mut cache = model.new_cache();
    let mut ctx = ForwardCtx::inference();
    model.forward_with_cache(&ids.narrow(1, 0, 4).unwrap(), &mut cache, &mut ctx).unwrap();
    let mut last = None;
    for pos in 4..9 {
        let step = model
            .forward_with_cache(&ids.narrow(1, pos, 1).unwrap(), &mut cache, &mut ctx)
            .unwrap();
        let want = full.narrow(1, pos, 1).unwrap();
        assert!(max_abs_diff(&step.logits, &want) < 1e-4, "position {pos}");
        last = Some(step);
    }
    assert_eq!(cache.seq_len(), 9);
    assert!(last.is_some());
}

#[test]
fn snapshot_reconstructs_identical_model() {
    let source = build(small_config(), Precision::full(), 23);
    let target = build(small_config(), Precision::full(), 24);
    let ids = random_ids(2, 6, 128, 25);

    let want = source.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    let before = target.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    assert!(max_abs_diff(&want, &before) > 0.0);

    let path = std::env::temp_dir().join(format!("lumi_e2e_{}.safetensors", std::process::id()));
    source.params().save(&path).unwrap();
    target.params().load(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    let got = target.forward(&ids, &mut ForwardCtx::inference()).unwrap();
    assert_eq!(max_abs_diff(&want, &got), 0.0);
}

#[test]
fn snapshot_from_other_shape_is_rejected() {
    let source = build(small_config().with_vocab_size(100), Precision::full(), 0);
    let target = build(small_config(), Precision::full(), 0);
    let snapshot = source.params().snapshot().unwrap();
    assert!(matches!(target.params().restore(&snapshot), Err(LumiError::ShapeMismatch(_))));
}

#[test]
fn sequence_length_limit() {
    let model = build(small_config(), Precision::full(), 0);
    let ok = random_ids(1, 64, 128, 1);
    assert!(model.forward(&ok, &mut ForwardCtx::inference()).is_ok());

    let too_long = random_ids(1, 65, 128, 1);
    assert!(matches!(
        model.forward(&too_long, &mut ForwardCtx::inference()),
        Err(LumiError::SequenceTooLong { len: 65, max: 64 })
    ));
}

#[test]
fn invalid_configurations_abort_construction() {
    let mut not_divisible = small_config();
    not_divisible.hidden_size = 250;

    let bad_groups = small_config().with_num_key_value_heads(3);

    let mut no_ffn = small_config();
    no_ffn.intermediate_size = 0;

    for config in [not_divisible, bad_groups, no_ffn] {
        let result = DecoderStack::new(config, &Device::Cpu, Precision::full(), &mut SeededRng::new(0));
        assert!(matches!(result, Err(LumiError::Config(_))));
    }
}

#[test]
fn presets_share_head_dim_and_vocab() {
    for config in [ModelConfig::tiny(), ModelConfig::small(), ModelConfig::base()] {
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.vocab_size, 32768);
        assert_eq!(config.intermediate_size, 4 * config.hidden_size);
        config.validate().unwrap();
    }
}
