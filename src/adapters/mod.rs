//! LoRA adapter layers.

pub mod lora;
pub mod merged;
pub mod quantized;
pub mod state;

pub use state::AdapterState;

use candle_core::{DType, Module, Tensor};
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::{Init, Linear};

use crate::error::Result;
use crate::param::Parameter;

/// Dtype the low-rank factors are kept and evaluated in.
pub const ADAPTER_DTYPE: DType = DType::F32;

/// Kaiming-uniform with `a = √5`, i.e. `U(-1/√fan_in, 1/√fan_in)`.
pub(crate) fn kaiming_uniform() -> Init {
    Init::Kaiming {
        dist: NormalOrUniform::Uniform,
        fan: FanInOut::FanIn,
        non_linearity: NonLinearity::ExplicitGain((1.0f64 / 3.0).sqrt()),
    }
}

/// Apply a factor stored in `(out, in)` layout to the last dimension of `x`.
pub(crate) fn project(factor: &Parameter, x: &Tensor) -> Result<Tensor> {
    Ok(Linear::new(factor.as_tensor().clone(), None).forward(x)?)
}
