//! Configuration types for hyperbolic LoRA adapters.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{PeftError, Result};
use crate::traits::AdapterConfig;

/// Curvature used when a hyperbolic variant carries no literal.
pub const DEFAULT_CURVATURE: f64 = -1.0;

/// Forward strategy of a dense adapter.
///
/// Parsed from `std` (alias `plain`), `hyperbolic` and `hyperbolic_rot`
/// (alias `hyperbolic_rotation`), each optionally followed by `-<curvature>`,
/// e.g. `hyperbolic-2.0` or `hyperbolic_rot--0.5`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LoraVariant {
    /// Euclidean low-rank correction `B(A(x))`.
    #[default]
    Standard,
    /// `exp → A → re-project → B → re-project → log` on the hyperboloid.
    Hyperbolic {
        /// Curvature of the hyperboloid (only `|k|` is used).
        curvature: f64,
    },
    /// `exp → A → B → re-project → log`, one fewer manifold re-projection.
    HyperbolicRotation {
        /// Curvature of the hyperboloid (only `|k|` is used).
        curvature: f64,
    },
}

impl LoraVariant {
    /// Whether the correction is a linear map that can be folded into the base weight.
    #[must_use]
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Standard)
    }

    /// Curvature literal of a hyperbolic variant.
    #[must_use]
    pub fn curvature(&self) -> Option<f64> {
        match self {
            Self::Standard => None,
            Self::Hyperbolic { curvature } | Self::HyperbolicRotation { curvature } => {
                Some(*curvature)
            }
        }
    }
}

impl FromStr for LoraVariant {
    type Err = PeftError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, literal) = match s.split_once('-') {
            Some((name, literal)) => (name, Some(literal)),
            None => (s, None),
        };

        let curvature = match literal {
            Some(literal) => {
                let k: f64 = literal.parse().map_err(|_| {
                    PeftError::InvalidConfig(format!("invalid curvature literal '{literal}' in '{s}'"))
                })?;
                if k == 0.0 || !k.is_finite() {
                    return Err(PeftError::InvalidConfig(format!(
                        "curvature must be finite and non-zero, got {k}"
                    )));
                }
                k
            }
            None => DEFAULT_CURVATURE,
        };

        match name {
            "std" | "plain" => Ok(Self::Standard),
            "hyperbolic" => Ok(Self::Hyperbolic { curvature }),
            "hyperbolic_rot" | "hyperbolic_rotation" => Ok(Self::HyperbolicRotation { curvature }),
            other => Err(PeftError::UnsupportedVariant(other.to_string())),
        }
    }
}

impl TryFrom<String> for LoraVariant {
    type Error = PeftError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LoraVariant> for String {
    fn from(value: LoraVariant) -> Self {
        value.to_string()
    }
}

impl fmt::Display for LoraVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, curvature) = match self {
            Self::Standard => return f.write_str("std"),
            Self::Hyperbolic { curvature } => ("hyperbolic", *curvature),
            Self::HyperbolicRotation { curvature } => ("hyperbolic_rot", *curvature),
        };
        if (curvature - DEFAULT_CURVATURE).abs() < f64::EPSILON {
            f.write_str(name)
        } else {
            write!(f, "{name}-{curvature}")
        }
    }
}

/// Which bias parameters stay trainable after freezing the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasPolicy {
    /// No bias is trained.
    #[default]
    None,
    /// Every parameter named as a bias is trained.
    All,
    /// Only biases of layers wrapped by an adapter are trained.
    LoraOnly,
}

impl FromStr for BiasPolicy {
    type Err = PeftError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            "lora_only" => Ok(Self::LoraOnly),
            other => Err(PeftError::UnknownBiasPolicy(other.to_string())),
        }
    }
}

/// Module names (suffix match) or a regular expression (full match) selecting
/// the layers to adapt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    /// A module is targeted when its dotted path ends with one of these names.
    Names(Vec<String>),
    /// A module is targeted when its dotted path fully matches this regex.
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        Self::Names(vec!["q_proj".into(), "v_proj".into()])
    }
}

impl fmt::Display for TargetModules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Names(names) => write!(f, "{names:?}"),
            Self::Pattern(pattern) => write!(f, "'{pattern}'"),
        }
    }
}

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition. `0` turns the adapter off.
    pub r: usize,

    /// Scaling numerator; the correction is multiplied by `lora_alpha / r`.
    #[serde(default = "default_alpha")]
    pub lora_alpha: f64,

    /// Dropout probability applied to the adapter input while training.
    #[serde(default)]
    pub lora_dropout: f64,

    /// Fold the correction into the base weight when switching to eval mode.
    #[serde(default)]
    pub merge_weights: bool,

    /// The base layer stores its weight as `(in, out)` instead of `(out, in)`.
    #[serde(default)]
    pub fan_in_fan_out: bool,

    /// Output groups to adapt, for fused projections such as `qkv`.
    #[serde(default)]
    pub enable_lora: Option<Vec<bool>>,

    /// Bias training policy.
    #[serde(default)]
    pub bias: BiasPolicy,

    /// Forward strategy of dense adapters.
    #[serde(default)]
    pub lora_type: LoraVariant,

    /// Normalise the input before rescaling it into the hyperboloid.
    #[serde(default = "default_true")]
    pub normalize_input: bool,

    /// Layers to adapt.
    #[serde(default)]
    pub target_modules: TargetModules,

    /// Extra modules kept trainable and saved alongside the adapter.
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,

    /// Build adapters for inference; implies merging on eval.
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_alpha() -> f64 {
    16.0
}

fn default_true() -> bool {
    true
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            lora_alpha: default_alpha(),
            lora_dropout: 0.0,
            merge_weights: false,
            fan_in_fan_out: false,
            enable_lora: None,
            bias: BiasPolicy::None,
            lora_type: LoraVariant::Standard,
            normalize_input: true,
            target_modules: TargetModules::default(),
            modules_to_save: None,
            inference_mode: false,
        }
    }
}

impl LoraConfig {
    /// Effective merge-on-eval policy.
    #[must_use]
    pub fn merge_on_eval(&self) -> bool {
        self.merge_weights || self.inference_mode
    }

    /// Render the configuration as pretty JSON.
    ///
    /// With `inference` set, `inference_mode` is forced on in the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self, inference: bool) -> Result<String> {
        let mut config = self.clone();
        if inference {
            config.inference_mode = true;
        }
        serde_json::to_string_pretty(&config)
            .map_err(|e| PeftError::Io(format!("Failed to serialize config: {e}")))
    }
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r > 0 && !(self.lora_alpha > 0.0 && self.lora_alpha.is_finite()) {
            return Err(PeftError::InvalidConfig("lora_alpha must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(PeftError::InvalidConfig(
                "lora_dropout must be in [0, 1)".into(),
            ));
        }
        if let Some(groups) = &self.enable_lora {
            if groups.is_empty() {
                return Err(PeftError::InvalidConfig("enable_lora cannot be empty".into()));
            }
        }
        if self.merge_on_eval() && !self.lora_type.is_linear() {
            return Err(PeftError::InvalidConfig(format!(
                "merge on eval is not available for the non-linear '{}' variant",
                self.lora_type
            )));
        }
        Ok(())
    }
}

/// Save a configuration to a JSON file.
///
/// # Errors
/// Returns an error if serialization or file writing fails
pub fn save_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| PeftError::Io(format!("Failed to serialize config: {e}")))?;

    fs::write(path, json).map_err(|e| PeftError::Io(format!("Failed to write config file: {e}")))?;

    Ok(())
}

/// Load a configuration from a JSON file.
///
/// # Errors
/// Returns an error if file reading or deserialization fails
pub fn load_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)
        .map_err(|e| PeftError::Io(format!("Failed to read config file: {e}")))?;

    serde_json::from_str(&json).map_err(|e| PeftError::Io(format!("Failed to parse config: {e}")))
}
