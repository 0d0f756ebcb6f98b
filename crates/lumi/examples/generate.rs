//! Greedy and sampled generation from a freshly initialized model.
//!
//! There is no tokenizer here, so prompts are token ids and the output is
//! printed as ids. The prompt template is shown for reference.
//!
//! Run with:
//! ```bash
//! RUST_LOG=lumi=debug cargo run -p lumi --example generate -- chatml
//! ```

use lumi::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let template: PromptTemplate = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("chatml")
        .parse()?;
    println!("Template {template}:\n{}", template.format("Bonjour, qui es-tu ?"));

    let generator = Generator::builder()
        .model_config(ModelConfig::tiny().with_num_layers(2))
        .seed(7)
        .build()?;

    let prompt: Vec<u32> = vec![1, 415, 2936, 9060, 285, 264];

    let greedy = generator.generate_with(
        &prompt,
        &GenerationConfig {
            max_new_tokens: 16,
            ..GenerationConfig::greedy()
        },
    )?;
    println!("greedy : {:?} ({:?})", greedy.new_tokens, greedy.finish_reason);

    let sampled = generator.generate_with(
        &prompt,
        &GenerationConfig {
            max_new_tokens: 16,
            ..GenerationConfig::default()
        },
    )?;
    println!("sampled: {:?} ({:?})", sampled.new_tokens, sampled.finish_reason);

    Ok(())
}
