//! Grouped LoRA on a fused `qkv` projection.
//!
//! Only the query and value thirds of the output receive a correction; the
//! key third is exactly the base output.

use anyhow::Result;
use candle_core::{Device, Tensor};
use hylora::{lora_factory, LoraConfig, LoraModel, TargetModules};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hylora=info".parse()?))
        .init();

    let device = Device::Cpu;
    let hidden = 96;

    let config = LoraConfig {
        r: 4,
        lora_alpha: 8.0,
        enable_lora: Some(vec![true, false, true]),
        target_modules: TargetModules::Pattern(r"blocks\.\d+\.attn\.qkv".into()),
        ..Default::default()
    };
    println!("{}", serde_json::to_string_pretty(&config)?);

    let mut model = LoraModel::new(config)?;
    let layers = (0..2).flat_map(|i| {
        [
            (format!("blocks.{i}.attn.qkv"), hidden, 3 * hidden),
            (format!("blocks.{i}.attn.out"), hidden, hidden),
        ]
    });
    let layers = layers
        .map(|(name, i, o)| Ok((name, hylora::BaseLinear::init(i, o, true, &device)?)))
        .collect::<hylora::Result<Vec<_>>>()?;
    let adapted = model.inject(layers, lora_factory)?;
    println!("adapted {adapted} of {} layers", model.module_names().len());

    model.mark_only_lora_as_trainable();

    for p in model.named_parameters() {
        if p.name.ends_with("lora_b.weight") {
            let dims = p.param.as_tensor().dims().to_vec();
            p.param.set(&Tensor::randn(0f32, 0.1, dims, &device)?)?;
        }
    }

    let x = Tensor::randn(0f32, 1f32, (2, 5, hidden), &device)?;
    let with_adapter = model.forward("blocks.0.attn.qkv", &x)?;
    model.disable_adapter_layers()?;
    let without = model.forward("blocks.0.attn.qkv", &x)?;

    let diff = (with_adapter - without)?.abs()?;
    for (i, part) in ["q", "k", "v"].iter().enumerate() {
        let m = diff
            .narrow(2, i * hidden, hidden)?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        println!("{part}: max correction {m:.4}");
    }

    Ok(())
}
