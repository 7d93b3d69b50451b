//! The frozen linear transform that adapters wrap.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Init, Linear};

use crate::error::{PeftError, Result};
use crate::param::{NamedParameter, Parameter};

/// A dense linear transform `y = x Wᵀ + b`.
///
/// The weight is a shared [`Parameter`]: cloning a `BaseLinear` or handing its
/// weight to another holder never copies storage, so a merge performed through
/// an adapter is visible to the original layer.
#[derive(Clone, Debug)]
pub struct BaseLinear {
    weight: Parameter,
    bias: Option<Parameter>,
    in_features: usize,
    out_features: usize,
    /// Weight stored as `(in, out)` instead of `(out, in)`.
    fan_in_fan_out: bool,
}

impl BaseLinear {
    /// Wrap existing parameters.
    ///
    /// # Errors
    /// Returns an error if the weight is not 2-D or the bias width differs
    /// from the output width.
    pub fn new(weight: Parameter, bias: Option<Parameter>, fan_in_fan_out: bool) -> Result<Self> {
        let (rows, cols) = weight.as_tensor().dims2()?;
        let (in_features, out_features) = if fan_in_fan_out {
            (rows, cols)
        } else {
            (cols, rows)
        };

        if let Some(bias) = &bias {
            let dims = bias.as_tensor().dims();
            if dims != [out_features] {
                return Err(PeftError::ShapeMismatch {
                    expected: vec![out_features],
                    actual: dims.to_vec(),
                });
            }
        }

        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
            fan_in_fan_out,
        })
    }

    /// Copy plain tensors into fresh parameters.
    ///
    /// # Errors
    /// Same as [`BaseLinear::new`].
    pub fn from_tensors(weight: &Tensor, bias: Option<&Tensor>, fan_in_fan_out: bool) -> Result<Self> {
        let weight = Parameter::from_tensor(weight)?;
        let bias = bias.map(Parameter::from_tensor).transpose()?;
        Self::new(weight, bias, fan_in_fan_out)
    }

    /// Randomly initialised layer in `(out, in)` layout, `U(-1/√in, 1/√in)`.
    ///
    /// # Errors
    /// Returns an error if allocation fails.
    pub fn init(in_features: usize, out_features: usize, bias: bool, device: &Device) -> Result<Self> {
        #[allow(clippy::cast_precision_loss)]
        let bound = 1.0 / (in_features as f64).sqrt();
        let uniform = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = Parameter::init(uniform, (out_features, in_features), DType::F32, device)?;
        let bias = if bias {
            Some(Parameter::init(uniform, out_features, DType::F32, device)?)
        } else {
            None
        };
        Self::new(weight, bias, false)
    }

    /// Apply the transform. The input is cast to the weight dtype.
    ///
    /// # Errors
    /// Returns an error if the matmul fails.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = self.weight.as_tensor();
        let input = input.to_dtype(weight.dtype())?;
        let weight = if self.fan_in_fan_out {
            weight.t()?
        } else {
            weight.clone()
        };
        let bias = self.bias.as_ref().map(|b| b.as_tensor().clone());
        Ok(Linear::new(weight, bias).forward(&input)?)
    }

    /// Freeze the weight (the bias keeps its flag).
    pub fn freeze_weight(&self) {
        self.weight.set_requires_grad(false);
    }

    /// Shared handle to the weight.
    #[must_use]
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Shared handle to the bias, if any.
    #[must_use]
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Whether the weight is stored as `(in, out)`.
    #[must_use]
    pub fn fan_in_fan_out(&self) -> bool {
        self.fan_in_fan_out
    }

    /// Add `delta` (in `(out, in)` layout) into the weight in place.
    pub(crate) fn add_to_weight(&self, delta: &Tensor) -> Result<()> {
        self.update_weight(delta, false)
    }

    /// Subtract `delta` (in `(out, in)` layout) from the weight in place.
    pub(crate) fn sub_from_weight(&self, delta: &Tensor) -> Result<()> {
        self.update_weight(delta, true)
    }

    fn update_weight(&self, delta: &Tensor, subtract: bool) -> Result<()> {
        let weight = self.weight.as_tensor();
        let delta = if self.fan_in_fan_out { delta.t()? } else { delta.clone() };
        let delta = delta.to_dtype(weight.dtype())?;
        let updated = if subtract {
            (weight - delta)?
        } else {
            (weight + delta)?
        };
        self.weight.set(&updated.contiguous()?)
    }

    /// Weight and bias as named entries.
    #[must_use]
    pub fn named_parameters(&self, prefix: &str, in_adapter: bool) -> Vec<NamedParameter> {
        let mut params = vec![NamedParameter::new(prefix, "weight", &self.weight, in_adapter)];
        if let Some(bias) = &self.bias {
            params.push(NamedParameter::new(prefix, "bias", bias, in_adapter));
        }
        params
    }
}
