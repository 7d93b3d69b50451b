//! Hyperbolic LoRA example.
//!
//! This example demonstrates:
//! - Building plain, hyperbolic and hyperbolic-rotation adapters
//! - Checking that a fresh adapter leaves the base output unchanged
//! - One SGD step that updates only the adapter factors

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{Optimizer, SGD};
use hylora::{
    mark_only_lora_as_trainable, trainable_vars, Adapter, BaseLinear, BiasPolicy, LoraConfig,
    LoraLinear, LoraVariant,
};
use tracing_subscriber::EnvFilter;

fn max_abs(t: &Tensor) -> Result<f32> {
    Ok(t.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hylora=info".parse()?))
        .init();

    println!("=== Hyperbolic LoRA Example ===\n");

    let device = Device::Cpu;
    let (in_features, out_features) = (64, 32);
    let input = Tensor::randn(0f32, 1f32, (2, 10, in_features), &device)?;

    for variant in ["std", "hyperbolic", "hyperbolic_rot-0.5"] {
        let lora_type: LoraVariant = variant.parse()?;
        let base = BaseLinear::init(in_features, out_features, true, &device)?;
        let config = LoraConfig {
            r: 4,
            lora_alpha: 8.0,
            lora_type,
            ..Default::default()
        };
        let layer = LoraLinear::new(base, &config)?;

        let output = layer.forward(&input)?;
        let drift = max_abs(&(&output - layer.base().forward(&input)?)?)?;
        println!(
            "{variant:>20}: output {:?}, {} adapter parameters, drift at init {drift}",
            output.dims(),
            layer.num_parameters()
        );

        let params = layer.named_parameters("proj");
        mark_only_lora_as_trainable(&params, BiasPolicy::None);
        let mut sgd = SGD::new(trainable_vars(&params), 0.05)?;
        let target = Tensor::randn(0f32, 1f32, output.dims(), &device)?;
        let loss = (layer.forward(&input)? - &target)?.sqr()?.mean_all()?;
        sgd.backward_step(&loss)?;
        let after = (layer.forward(&input)? - &target)?.sqr()?.mean_all()?;
        println!(
            "{:>20}  loss {:.5} -> {:.5}",
            "",
            loss.to_scalar::<f32>()?,
            after.to_scalar::<f32>()?
        );
    }

    Ok(())
}
