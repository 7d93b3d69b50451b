//! Named, shareable parameters with a requires-grad flag.
//!
//! candle decides what an optimizer updates by the list of [`Var`]s it is
//! given, not by a per-tensor flag. [`Parameter`] pairs a `Var` with a shared
//! flag, so freezing a weight is visible to every holder of the same parameter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::Init;

use crate::error::Result;

/// A trainable or frozen tensor buffer.
///
/// Clones share both the storage and the requires-grad flag.
#[derive(Clone, Debug)]
pub struct Parameter {
    var: Var,
    requires_grad: Arc<AtomicBool>,
}

impl Parameter {
    /// Wrap an existing tensor as a new trainable parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be copied into a variable.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self::from_var(Var::from_tensor(tensor)?))
    }

    /// Wrap a variable as a trainable parameter.
    #[must_use]
    pub fn from_var(var: Var) -> Self {
        Self {
            var,
            requires_grad: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Allocate a parameter with the given initializer.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn init<S: Into<Shape>>(init: Init, shape: S, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self::from_var(init.var(shape, dtype, device)?))
    }

    /// Allocate a trainable 0-d parameter holding `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn scalar(value: f64, dtype: DType, device: &Device) -> Result<Self> {
        let tensor = Tensor::new(value, device)?.to_dtype(dtype)?;
        Self::from_tensor(&tensor)
    }

    /// The underlying variable.
    #[must_use]
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// The variable viewed as a tensor (tracked for backprop).
    #[must_use]
    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Overwrite the buffer in place; every clone observes the new values.
    ///
    /// # Errors
    ///
    /// Returns an error on a shape or dtype mismatch.
    pub fn set(&self, value: &Tensor) -> Result<()> {
        Ok(self.var.set(value)?)
    }

    /// Whether an optimizer should update this parameter.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad.load(Ordering::Relaxed)
    }

    /// Enable or disable gradient updates for this parameter.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.requires_grad.store(requires_grad, Ordering::Relaxed);
    }

    /// Number of scalar elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }
}

/// A parameter together with its dotted path inside a model.
#[derive(Clone, Debug)]
pub struct NamedParameter {
    /// Dotted path, e.g. `layers.0.attn.lora_a.weight`.
    pub name: String,
    /// Shared handle to the parameter.
    pub param: Parameter,
    /// Whether the parameter is owned by a layer that carries an adapter.
    pub in_adapter: bool,
}

impl NamedParameter {
    /// Build an entry, prefixing `name` with `prefix` when it is non-empty.
    #[must_use]
    pub fn new(prefix: &str, name: &str, param: &Parameter, in_adapter: bool) -> Self {
        let name = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        };
        Self {
            name,
            param: param.clone(),
            in_adapter,
        }
    }
}
