//! Core traits for LoRA adapters.

use candle_core::Tensor;

use crate::adapters::AdapterState;
use crate::param::NamedParameter;
use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// A linear layer augmented with a low-rank correction.
///
/// Adapters wrap their base transform instead of extending it: the base
/// weight is reached through the adapter, and the adapter decides when that
/// weight is mutated.
pub trait Adapter: Send + Sync {
    /// Forward pass: base transform plus the correction, in the input's dtype.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Switch between training (`true`) and evaluation (`false`) mode.
    ///
    /// Drives merge-on-eval and unmerge-on-train.
    ///
    /// # Errors
    ///
    /// Returns an error if merging or unmerging fails.
    fn train(&mut self, mode: bool) -> Result<()>;

    /// Switch to evaluation mode.
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn eval(&mut self) -> Result<()> {
        self.train(false)
    }

    /// Shared adapter state.
    fn state(&self) -> &AdapterState;

    /// Bypass (`true`) or restore (`false`) the correction.
    ///
    /// Disabling an adapter whose correction is merged subtracts it first.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn set_disabled(&mut self, disabled: bool) -> Result<()>;

    /// All parameters reachable from this layer, base weight included.
    fn named_parameters(&self, prefix: &str) -> Vec<NamedParameter>;

    /// Number of adapter-owned scalar parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;
}

/// Adapters whose correction is a linear map that can live inside the base weight.
pub trait Mergeable: Adapter {
    /// The scaled correction `ΔW * scaling` in the base weight's layout.
    ///
    /// Returns `None` when the adapter has no factors (`r == 0`).
    ///
    /// # Errors
    ///
    /// Returns an error if the product cannot be formed.
    fn delta_weight(&self) -> Result<Option<Tensor>>;

    /// Add the correction into the base weight. A no-op when already merged.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter cannot be merged or the update fails.
    fn merge(&mut self) -> Result<()>;

    /// Subtract the correction from the base weight. A no-op when not merged.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn unmerge(&mut self) -> Result<()>;

    /// Whether the correction currently lives in the base weight.
    #[must_use]
    fn is_merged(&self) -> bool {
        self.state().merged()
    }
}

/// A quantized linear forward primitive supplied by an external backend.
pub trait QuantizedBackend: Send + Sync {
    /// Compute the quantized linear transform of `input`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend kernel fails.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Declared input width.
    fn in_features(&self) -> usize;

    /// Declared output width.
    fn out_features(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Trait object safety check
    fn _assert_adapter_object_safe(_: &dyn Adapter) {}
    fn _assert_mergeable_object_safe(_: &dyn Mergeable) {}
    fn _assert_backend_object_safe(_: &dyn QuantizedBackend) {}
}
