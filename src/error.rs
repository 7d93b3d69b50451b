//! Error types for hylora.

use thiserror::Error;

/// Result type alias for hylora operations.
pub type Result<T> = std::result::Result<T, PeftError>;

/// Errors that can occur while building or running adapters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PeftError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// Adapter variant that has no forward implementation.
    #[error("unimplemented adapter variant: {0}")]
    UnsupportedVariant(String),

    /// Bias policy string that is not `none`, `all` or `lora_only`.
    #[error("unknown bias policy: {0}")]
    UnknownBiasPolicy(String),

    /// Merge requested on an adapter whose correction has no closed form.
    #[error("adapter cannot be merged: {0}")]
    NotMergeable(String),

    /// None of the configured target modules exist in the model.
    #[error("target modules {targets} not found in the base model")]
    TargetNotFound {
        /// Rendered target specification
        targets: String,
    },

    /// Module lookup by name failed.
    #[error("module not found: {name}")]
    ModuleNotFound {
        /// Dotted module path
        name: String,
    },

    /// Configuration file I/O or (de)serialization failure.
    #[error("io error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
