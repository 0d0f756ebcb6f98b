//! Build each preset and run one forward pass.
//!
//! Run with:
//! ```bash
//! RUST_LOG=lumi_core=info cargo run -p lumi-core --example forward_presets -- tiny small
//! ```

use candle_core::{DType, Device};
use lumi_core::model::{DecoderStack, ModelConfig, Precision};
use lumi_core::{ForwardCtx, SeededRng};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let presets: Vec<&str> = if args.is_empty() {
        vec!["tiny"]
    } else {
        args.iter().map(|s| s.as_str()).collect()
    };

    #[cfg(feature = "cuda")]
    let (device, precision) = (Device::new_cuda(0)?, Precision::mixed(DType::BF16));
    #[cfg(not(feature = "cuda"))]
    let (device, precision) = (Device::Cpu, Precision::full());

    println!("Forward Presets");
    println!("===============\n");

    for name in presets {
        let config = ModelConfig::from_preset(name)?;
        let start = Instant::now();
        let model = DecoderStack::new(config, &device, precision, &mut SeededRng::new(42))?;
        println!(
            "{name}: {} layers, hidden {}, {:.1}M parameters, backend {} (built in {:?})",
            model.config().num_hidden_layers,
            model.config().hidden_size,
            model.params().num_parameters() as f64 / 1e6,
            model.backend().name(),
            start.elapsed()
        );

        let rows: Vec<Vec<u32>> = (0..2)
            .map(|b| (0..16).map(|i| (b * 1000 + i * 37) % 32768).collect())
            .collect();
        let ids = DecoderStack::ids_tensor(&rows, &device)?;

        let start = Instant::now();
        let logits = model.forward(&ids, &mut ForwardCtx::inference())?;
        let mean = logits.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?;
        println!(
            "  logits {:?} {:?}, mean {mean:.5}, forward {:?}\n",
            logits.dims(),
            logits.dtype(),
            start.elapsed()
        );
    }

    Ok(())
}
