//! Merge-on-eval example.
//!
//! Switching a plain adapter to eval folds `B·A·α/r` into the frozen weight,
//! so inference costs a single matmul; switching back to training restores
//! the original weight.

use anyhow::Result;
use candle_core::{Device, Tensor};
use hylora::{Adapter, BaseLinear, LoraConfig, LoraLinear, Mergeable};
use tracing_subscriber::EnvFilter;

fn max_abs(t: &Tensor) -> Result<f32> {
    Ok(t.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hylora=debug".parse()?))
        .init();

    let device = Device::Cpu;
    let base = BaseLinear::init(128, 128, true, &device)?;
    let original = base.weight().as_tensor().copy()?;

    let config = LoraConfig {
        r: 8,
        lora_alpha: 16.0,
        merge_weights: true,
        ..Default::default()
    };
    let mut layer = LoraLinear::new(base, &config)?;

    // pretend the adapter was trained
    if let Some(b) = layer.lora_b() {
        let dims = b.as_tensor().dims().to_vec();
        b.set(&Tensor::randn(0f32, 0.1, dims, &device)?)?;
    }

    let x = Tensor::randn(0f32, 1f32, (4, 128), &device)?;
    let training_output = layer.forward(&x)?;

    layer.eval()?;
    println!("merged after eval: {}", layer.is_merged());
    let eval_output = layer.forward(&x)?;
    println!(
        "max |train - eval| output difference: {:.2e}",
        max_abs(&(&training_output - &eval_output)?)?
    );

    layer.train(true)?;
    println!("merged after train: {}", layer.is_merged());
    println!(
        "max |W - W0| after unmerge: {:.2e}",
        max_abs(&(layer.base().weight().as_tensor() - &original)?)?
    );

    Ok(())
}
