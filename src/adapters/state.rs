//! State shared by every adapter variant.

use candle_core::Tensor;
use candle_nn::Dropout;

use crate::config::LoraConfig;
use crate::error::Result;

/// What a train/eval switch must do to the base weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModeTransition {
    /// Fold the correction into the base weight.
    Merge,
    /// Take the correction back out of the base weight.
    Unmerge,
    /// Leave the base weight alone.
    Keep,
}

/// Rank, scaling, dropout and the merge/disable flags of one adapter.
///
/// Invariant: `merged` implies `!training && merge_weights`.
#[derive(Debug, Clone)]
pub struct AdapterState {
    r: usize,
    lora_alpha: f64,
    scaling: f64,
    dropout_p: f32,
    dropout: Dropout,
    merged: bool,
    merge_weights: bool,
    disabled: bool,
    training: bool,
}

impl AdapterState {
    /// Build the state for a freshly constructed adapter (training mode, unmerged).
    #[must_use]
    pub fn new(config: &LoraConfig, merge_weights: bool) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let scaling = if config.r > 0 {
            config.lora_alpha / config.r as f64
        } else {
            0.0
        };
        #[allow(clippy::cast_possible_truncation)]
        let dropout_p = config.lora_dropout as f32;

        Self {
            r: config.r,
            lora_alpha: config.lora_alpha,
            scaling,
            dropout_p,
            dropout: Dropout::new(dropout_p),
            merged: false,
            merge_weights,
            disabled: false,
            training: true,
        }
    }

    /// Rank of the decomposition.
    #[must_use]
    pub fn r(&self) -> usize {
        self.r
    }

    /// Scaling numerator.
    #[must_use]
    pub fn lora_alpha(&self) -> f64 {
        self.lora_alpha
    }

    /// `lora_alpha / r`, or `0.0` when `r == 0`.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Dropout probability.
    #[must_use]
    pub fn dropout(&self) -> f32 {
        self.dropout_p
    }

    /// Whether the correction currently lives in the base weight.
    #[must_use]
    pub fn merged(&self) -> bool {
        self.merged
    }

    /// Merge-on-eval policy.
    #[must_use]
    pub fn merge_weights(&self) -> bool {
        self.merge_weights
    }

    /// Whether the correction is bypassed.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Training (`true`) or evaluation (`false`) mode.
    #[must_use]
    pub fn training(&self) -> bool {
        self.training
    }

    /// Apply dropout; identity in eval mode or when the probability is zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the dropout mask cannot be drawn.
    pub fn apply_dropout(&self, x: &Tensor) -> Result<Tensor> {
        if self.training && self.dropout_p > 0.0 {
            Ok(self.dropout.forward(x, true)?)
        } else {
            Ok(x.clone())
        }
    }

    /// Decide what switching to `training` must do. Disabled adapters never merge.
    pub(crate) fn transition(&self, training: bool) -> ModeTransition {
        if training {
            if self.merged {
                ModeTransition::Unmerge
            } else {
                ModeTransition::Keep
            }
        } else if self.merge_weights && !self.merged && !self.disabled {
            ModeTransition::Merge
        } else {
            ModeTransition::Keep
        }
    }

    pub(crate) fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub(crate) fn set_merged(&mut self, merged: bool) {
        self.merged = merged;
    }

    pub(crate) fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub(crate) fn disable_merge_policy(&mut self) {
        self.merge_weights = false;
    }
}
