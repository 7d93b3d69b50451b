//! Trainable-parameter selection for adapter fine-tuning.
//!
//! Freezing is expressed through the shared requires-grad flag of each
//! [`Parameter`](crate::param::Parameter); [`trainable_vars`] turns the result
//! into the variable list a candle optimizer consumes.

// Parameter counts are reported as percentages
#![allow(clippy::cast_precision_loss)]

use candle_core::Var;

use crate::config::BiasPolicy;
use crate::param::NamedParameter;

/// Substring that marks a parameter as part of a LoRA adapter.
pub const LORA_MARKER: &str = "lora_";

/// Freeze everything except adapter factors, then apply the bias policy.
///
/// - `None`: biases stay frozen.
/// - `All`: every parameter whose name contains `bias` is unfrozen.
/// - `LoraOnly`: only biases owned by an adapter-wrapped layer are unfrozen.
pub fn mark_only_lora_as_trainable(params: &[NamedParameter], bias: BiasPolicy) {
    for p in params {
        if !p.name.contains(LORA_MARKER) {
            p.param.set_requires_grad(false);
        }
    }

    match bias {
        BiasPolicy::None => {}
        BiasPolicy::All => {
            for p in params.iter().filter(|p| p.name.contains("bias")) {
                p.param.set_requires_grad(true);
            }
        }
        BiasPolicy::LoraOnly => {
            for p in params
                .iter()
                .filter(|p| p.in_adapter && p.name.contains("bias"))
            {
                p.param.set_requires_grad(true);
            }
        }
    }

    let trainable = count_trainable_parameters(params);
    let total = count_parameters(params);
    tracing::info!(
        trainable = %format_parameter_count(trainable),
        total = %format_parameter_count(total),
        percent = percent(trainable, total),
        bias = ?bias,
        "selected trainable parameters"
    );
}

/// Variables with requires-grad set, ready for an optimizer.
#[must_use]
pub fn trainable_vars(params: &[NamedParameter]) -> Vec<Var> {
    params
        .iter()
        .filter(|p| p.param.requires_grad())
        .map(|p| p.param.var().clone())
        .collect()
}

/// Number of scalar weights with requires-grad set.
#[must_use]
pub fn count_trainable_parameters(params: &[NamedParameter]) -> usize {
    params
        .iter()
        .filter(|p| p.param.requires_grad())
        .map(|p| p.param.elem_count())
        .sum()
}

/// Number of scalar weights overall.
#[must_use]
pub fn count_parameters(params: &[NamedParameter]) -> usize {
    params.iter().map(|p| p.param.elem_count()).sum()
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

/// Format parameter count with appropriate units.
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
