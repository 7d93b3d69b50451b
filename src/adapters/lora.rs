//! Dense LoRA layer with Euclidean and hyperbolic corrections.
//!
//! The plain variant adds `B(A(x)) · α/r` to a frozen linear transform, with
//! `ΔW = BA` foldable into the base weight. The hyperbolic variants push the
//! input through the Lorentz hyperboloid instead:
//!
//! ```text
//! hyperbolic:      x → pad → exp₀ → A → lift → B → lift → log₀ → drop time
//! hyperbolic_rot:  x → pad → exp₀ → A → B → lift → log₀ → drop time
//! ```
//!
//! where `lift` re-solves the time coordinate from the hyperboloid constraint.
//! Both are non-linear and never merge.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use candle_core::{Tensor, D};
use candle_nn::Init;

use crate::adapters::state::{AdapterState, ModeTransition};
use crate::adapters::{kaiming_uniform, project, ADAPTER_DTYPE};
use crate::config::{LoraConfig, LoraVariant};
use crate::error::{PeftError, Result};
use crate::linear::BaseLinear;
use crate::lorentz;
use crate::param::{NamedParameter, Parameter};
use crate::traits::{Adapter, AdapterConfig, Mergeable};

/// Upper clamp of the learned input scale `exp(norm_scale)`.
pub const MAX_NORM_SCALE: f64 = 10.0;

/// Lower clamp of the input norm used for normalisation.
const MIN_INPUT_NORM: f64 = 1e-8;

/// Trainable scalars of the hyperbolic variants.
#[derive(Debug, Clone)]
struct ManifoldParams {
    /// Curvature `k`; only `|k|` enters the maps.
    k: Parameter,
    /// Log-scale applied to the input before the exponential map.
    norm_scale: Parameter,
}

/// Factors that exist only when `r > 0`.
#[derive(Debug, Clone)]
struct LowRankFactors {
    lora_a: Parameter,
    lora_b: Parameter,
    manifold: Option<ManifoldParams>,
}

/// LoRA layer wrapping one [`BaseLinear`].
///
/// Computes `output = base(x) + correction(x)` where the correction depends on
/// the [`LoraVariant`].
#[derive(Debug)]
pub struct LoraLinear {
    base: BaseLinear,
    state: AdapterState,
    variant: LoraVariant,
    normalize_input: bool,
    factors: Option<LowRankFactors>,
}

impl LoraLinear {
    /// Wrap `base` with a LoRA correction.
    ///
    /// A is Kaiming-uniform and B is zero, so the new layer reproduces `base`
    /// exactly. With `r > 0` the base weight is frozen.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid (including merge-on-eval
    /// for a hyperbolic variant) or allocation fails.
    pub fn new(base: BaseLinear, config: &LoraConfig) -> Result<Self> {
        config.validate()?;

        let variant = config.lora_type;
        let factors = if config.r > 0 {
            Some(Self::init_factors(&base, config.r, variant)?)
        } else {
            None
        };
        if factors.is_some() {
            base.freeze_weight();
        }

        tracing::debug!(
            in_features = base.in_features(),
            out_features = base.out_features(),
            r = config.r,
            variant = %variant,
            "built LoRA layer"
        );

        Ok(Self {
            base,
            state: AdapterState::new(config, config.merge_on_eval()),
            variant,
            normalize_input: config.normalize_input,
            factors,
        })
    }

    fn init_factors(base: &BaseLinear, r: usize, variant: LoraVariant) -> Result<LowRankFactors> {
        let device = base.weight().as_tensor().device().clone();
        let (in_features, out_features) = (base.in_features(), base.out_features());

        // shapes are (out, in) per projection
        let (a_shape, b_shape) = match variant {
            LoraVariant::Standard => ((r, in_features), (out_features, r)),
            LoraVariant::Hyperbolic { .. } => ((r, in_features + 1), (out_features, r + 1)),
            LoraVariant::HyperbolicRotation { .. } => ((r, in_features + 1), (out_features, r)),
        };

        let lora_a = Parameter::init(kaiming_uniform(), a_shape, ADAPTER_DTYPE, &device)?;
        let lora_b = Parameter::init(Init::Const(0.0), b_shape, ADAPTER_DTYPE, &device)?;

        let manifold = match variant.curvature() {
            Some(curvature) => Some(ManifoldParams {
                k: Parameter::scalar(curvature, ADAPTER_DTYPE, &device)?,
                norm_scale: Parameter::scalar(0.0, ADAPTER_DTYPE, &device)?,
            }),
            None => None,
        };

        Ok(LowRankFactors {
            lora_a,
            lora_b,
            manifold,
        })
    }

    /// The wrapped base transform.
    #[must_use]
    pub fn base(&self) -> &BaseLinear {
        &self.base
    }

    /// Forward strategy.
    #[must_use]
    pub fn variant(&self) -> LoraVariant {
        self.variant
    }

    /// Down projection `A`, stored `(r, in)` or `(r, in + 1)`.
    #[must_use]
    pub fn lora_a(&self) -> Option<&Parameter> {
        self.factors.as_ref().map(|f| &f.lora_a)
    }

    /// Up projection `B`, stored `(out, r)` or `(out, r + 1)`.
    #[must_use]
    pub fn lora_b(&self) -> Option<&Parameter> {
        self.factors.as_ref().map(|f| &f.lora_b)
    }

    /// Curvature parameter of the hyperbolic variants.
    #[must_use]
    pub fn curvature(&self) -> Option<&Parameter> {
        self.manifold().map(|m| &m.k)
    }

    /// Input log-scale of the hyperbolic variants.
    #[must_use]
    pub fn norm_scale(&self) -> Option<&Parameter> {
        self.manifold().map(|m| &m.norm_scale)
    }

    fn manifold(&self) -> Option<&ManifoldParams> {
        self.factors.as_ref().and_then(|f| f.manifold.as_ref())
    }

    /// The low-rank correction alone, in the factors' dtype.
    ///
    /// Returns `None` when `r == 0`.
    ///
    /// # Errors
    /// Returns an error if a tensor operation fails.
    pub fn correction(&self, input: &Tensor) -> Result<Option<Tensor>> {
        let Some(factors) = &self.factors else {
            return Ok(None);
        };

        let x = input.to_dtype(factors.lora_a.as_tensor().dtype())?;
        let x = self.state.apply_dropout(&x)?;

        let out = match (self.variant, &factors.manifold) {
            (LoraVariant::Standard, _) => {
                project(&factors.lora_b, &project(&factors.lora_a, &x)?)?
            }
            (LoraVariant::Hyperbolic { .. }, Some(manifold)) => {
                let k = manifold.k.as_tensor();
                let x = lorentz::expmap0(&self.rescale_input(&x, manifold)?, k)?;

                let x = lorentz::project_time(&project(&factors.lora_a, &x)?, k)?;
                let x = lorentz::project_time(&project(&factors.lora_b, &x)?, k)?;

                drop_time(&lorentz::logmap0(&x, k)?)?
            }
            (LoraVariant::HyperbolicRotation { .. }, Some(manifold)) => {
                let k = manifold.k.as_tensor();
                let x = lorentz::expmap0(&self.rescale_input(&x, manifold)?, k)?;

                let space = project(&factors.lora_b, &project(&factors.lora_a, &x)?)?;
                let x = lorentz::project_time(&space, k)?;

                drop_time(&lorentz::logmap0(&x, k)?)?
            }
            (variant, None) => return Err(PeftError::UnsupportedVariant(variant.to_string())),
        };

        Ok(Some((out * self.state.scaling())?))
    }

    /// Scale by `min(exp(norm_scale), 10)`, optionally after normalising to
    /// unit norm, then prepend the zero time coordinate.
    fn rescale_input(&self, x: &Tensor, manifold: &ManifoldParams) -> Result<Tensor> {
        let scale = manifold.norm_scale.as_tensor().exp()?.minimum(MAX_NORM_SCALE)?;
        let x = if self.normalize_input {
            let norm = lorentz::clamped_norm(x, MIN_INPUT_NORM, f64::INFINITY)?;
            x.broadcast_div(&norm)?
        } else {
            x.clone()
        };
        lorentz::pad_time_axis(&x.broadcast_mul(&scale)?)
    }
}

/// Drop coordinate 0 of the last dimension.
fn drop_time(x: &Tensor) -> Result<Tensor> {
    let dim = x.dim(D::Minus1)?;
    Ok(x.narrow(D::Minus1, 1, dim - 1)?)
}

impl Adapter for LoraLinear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let previous_dtype = input.dtype();
        let mut result = self.base.forward(input)?;

        if !self.state.disabled() && !self.state.merged() {
            if let Some(correction) = self.correction(input)? {
                result = (result + correction.to_dtype(self.base.weight().as_tensor().dtype())?)?;
            }
        }

        Ok(result.to_dtype(previous_dtype)?)
    }

    fn train(&mut self, mode: bool) -> Result<()> {
        match self.state.transition(mode) {
            ModeTransition::Merge => self.merge()?,
            ModeTransition::Unmerge => self.unmerge()?,
            ModeTransition::Keep => {}
        }
        self.state.set_training(mode);
        Ok(())
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    fn set_disabled(&mut self, disabled: bool) -> Result<()> {
        if disabled && self.state.merged() {
            self.unmerge()?;
        }
        self.state.set_disabled(disabled);
        tracing::debug!(disabled, "toggled LoRA layer");
        Ok(())
    }

    fn named_parameters(&self, prefix: &str) -> Vec<NamedParameter> {
        let mut params = self.base.named_parameters(prefix, true);
        if let Some(factors) = &self.factors {
            params.push(NamedParameter::new(prefix, "lora_a.weight", &factors.lora_a, true));
            params.push(NamedParameter::new(prefix, "lora_b.weight", &factors.lora_b, true));
            if let Some(manifold) = &factors.manifold {
                params.push(NamedParameter::new(prefix, "lora_k", &manifold.k, true));
                params.push(NamedParameter::new(
                    prefix,
                    "lora_norm_scale",
                    &manifold.norm_scale,
                    true,
                ));
            }
        }
        params
    }

    fn num_parameters(&self) -> usize {
        self.factors.as_ref().map_or(0, |f| {
            let manifold = f.manifold.as_ref().map_or(0, |m| {
                m.k.elem_count() + m.norm_scale.elem_count()
            });
            f.lora_a.elem_count() + f.lora_b.elem_count() + manifold
        })
    }
}

impl Mergeable for LoraLinear {
    fn delta_weight(&self) -> Result<Option<Tensor>> {
        if !self.variant.is_linear() {
            return Err(PeftError::NotMergeable(format!(
                "the '{}' correction is not a linear map",
                self.variant
            )));
        }
        let Some(factors) = &self.factors else {
            return Ok(None);
        };

        // ΔW = B @ A, (out, r) @ (r, in)
        let delta = factors
            .lora_b
            .as_tensor()
            .matmul(factors.lora_a.as_tensor())?;
        Ok(Some((delta * self.state.scaling())?))
    }

    fn merge(&mut self) -> Result<()> {
        if self.state.disabled() {
            return Err(PeftError::NotMergeable("adapter is disabled".into()));
        }
        if self.state.merged() {
            tracing::debug!("LoRA delta already merged, skipping");
            return Ok(());
        }
        if let Some(delta) = self.delta_weight()? {
            self.base.add_to_weight(&delta)?;
        }
        self.state.set_merged(true);
        tracing::debug!(r = self.state.r(), scaling = self.state.scaling(), "merged LoRA delta");
        Ok(())
    }

    fn unmerge(&mut self) -> Result<()> {
        if !self.state.merged() {
            tracing::debug!("LoRA delta not merged, skipping");
            return Ok(());
        }
        if let Some(delta) = self.delta_weight()? {
            self.base.sub_from_weight(&delta)?;
        }
        self.state.set_merged(false);
        tracing::debug!(r = self.state.r(), scaling = self.state.scaling(), "unmerged LoRA delta");
        Ok(())
    }
}
