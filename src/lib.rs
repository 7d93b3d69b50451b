//! # hylora
//!
//! Low-rank adaptation (LoRA) layers for candle, with hyperbolic variants.
//!
//! This crate provides:
//! - **Dense `LoRA`**: `W x + B(A x) · α/r`, mergeable into the base weight
//! - **Hyperbolic `LoRA`**: the correction is computed on the Lorentz hyperboloid
//!   through the exponential and logarithmic maps at the origin
//! - **Grouped `LoRA`**: selective corrections for fused projections such as `qkv`
//! - **Quantized shims**: the same corrections over a quantized base weight
//! - Trainable-parameter selection and model-level injection
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hylora::{Adapter, BaseLinear, LoraConfig, LoraLinear, LoraVariant};
//! use candle_core::{Device, Tensor};
//!
//! let base = BaseLinear::init(768, 768, true, &Device::Cpu)?;
//! let config = LoraConfig {
//!     r: 8,
//!     lora_alpha: 16.0,
//!     lora_type: LoraVariant::Hyperbolic { curvature: -1.0 },
//!     ..Default::default()
//! };
//! let layer = LoraLinear::new(base, &config)?;
//!
//! let input = Tensor::zeros(&[1, 10, 768], candle_core::DType::F32, &Device::Cpu)?;
//! let output = layer.forward(&input)?;
//! ```
//!
//! ## Architecture
//!
//! All adapters implement the [`Adapter`] trait, which provides a common interface
//! for forward passes, train/eval switching and parameter listing. Adapters with a
//! closed-form weight delta also implement [`Mergeable`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod linear;
pub mod lorentz;
pub mod model;
pub mod param;
pub mod training;
pub mod traits;

pub use adapters::lora::LoraLinear;
pub use adapters::merged::MergedLoraLinear;
pub use adapters::quantized::{QMatMulBackend, QuantizedLoraLinear, QuantizedMergedLoraLinear};
pub use adapters::{AdapterState, ADAPTER_DTYPE};
pub use config::{
    load_config, save_config, BiasPolicy, LoraConfig, LoraVariant, TargetModules,
    DEFAULT_CURVATURE,
};
pub use error::{PeftError, Result};
pub use linear::BaseLinear;
pub use model::{lora_factory, LoraModel, TargetMatcher};
pub use param::{NamedParameter, Parameter};
pub use training::{
    count_parameters, count_trainable_parameters, format_parameter_count,
    mark_only_lora_as_trainable, trainable_vars,
};
pub use traits::{Adapter, AdapterConfig, Mergeable, QuantizedBackend};
