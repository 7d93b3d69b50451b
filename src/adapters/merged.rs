//! Grouped LoRA for fused projections.
//!
//! A fused layer such as `qkv` produces several logical outputs from one
//! weight. `enable_lora` splits the output into equal-width groups and picks
//! the ones that receive a correction. Each enabled group owns a rank-`r` slice
//! of `A` and an independent block of `B`, so the correction of one group never
//! depends on another group's slice. The group corrections are scattered into
//! the full output width through a mask fixed at construction.

use candle_core::{Tensor, D};
use candle_nn::Init;

use crate::adapters::state::{AdapterState, ModeTransition};
use crate::adapters::{kaiming_uniform, project, ADAPTER_DTYPE};
use crate::config::LoraConfig;
use crate::error::{PeftError, Result};
use crate::linear::BaseLinear;
use crate::param::{NamedParameter, Parameter};
use crate::traits::{Adapter, AdapterConfig, Mergeable};

#[derive(Debug, Clone)]
struct GroupedFactors {
    /// `(r * n_enabled, in)`
    lora_a: Parameter,
    /// `(group_width * n_enabled, r)`, one `(group_width, r)` block per group
    lora_b: Parameter,
}

/// Output mask of a grouped adapter.
#[derive(Debug, Clone)]
pub(crate) struct GroupLayout {
    enable_lora: Vec<bool>,
    group_width: usize,
    n_enabled: usize,
    mask: Vec<bool>,
    /// For every output position, the correction column it reads; disabled
    /// positions read the trailing zero column.
    gather_ind: Tensor,
}

impl GroupLayout {
    pub(crate) fn new(
        enable_lora: &[bool],
        out_features: usize,
        device: &candle_core::Device,
    ) -> Result<Self> {
        if enable_lora.is_empty() {
            return Err(PeftError::InvalidConfig("enable_lora cannot be empty".into()));
        }
        if out_features % enable_lora.len() != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "the length of enable_lora ({}) must divide out_features ({out_features})",
                enable_lora.len()
            )));
        }

        let group_width = out_features / enable_lora.len();
        let mask: Vec<bool> = enable_lora
            .iter()
            .flat_map(|&enabled| std::iter::repeat(enabled).take(group_width))
            .collect();
        let n_enabled = count_enabled(enable_lora);
        let zero_column = group_width * n_enabled;
        let mut next = 0;
        #[allow(clippy::cast_possible_truncation)]
        let indices: Vec<u32> = mask
            .iter()
            .map(|&m| {
                if m {
                    next += 1;
                    (next - 1) as u32
                } else {
                    zero_column as u32
                }
            })
            .collect();
        let gather_ind = Tensor::from_vec(indices, out_features, device)?;

        Ok(Self {
            enable_lora: enable_lora.to_vec(),
            group_width,
            n_enabled,
            mask,
            gather_ind,
        })
    }

    pub(crate) fn n_enabled(&self) -> usize {
        self.n_enabled
    }

    pub(crate) fn group_width(&self) -> usize {
        self.group_width
    }

    pub(crate) fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub(crate) fn enable_lora(&self) -> &[bool] {
        &self.enable_lora
    }

    /// Spread `x` (last dim `group_width * n_enabled`) over the masked
    /// positions of a last dim of `out_features`, zero elsewhere.
    pub(crate) fn zero_pad(&self, x: &Tensor) -> Result<Tensor> {
        let mut dims = x.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = 1;
        }
        let zero = Tensor::zeros(dims, x.dtype(), x.device())?;
        let padded = Tensor::cat(&[x, &zero], D::Minus1)?;
        Ok(padded.index_select(&self.gather_ind, D::Minus1)?)
    }

    /// Apply the block-diagonal `B`: group `g` maps its rank slice of `h`
    /// through its own `(group_width, r)` block.
    pub(crate) fn grouped_projection(&self, h: &Tensor, lora_b: &Tensor, r: usize) -> Result<Tensor> {
        let outputs = (0..self.n_enabled)
            .map(|g| {
                let h_g = h.narrow(D::Minus1, g * r, r)?;
                let b_g = lora_b.narrow(0, g * self.group_width, self.group_width)?;
                h_g.broadcast_matmul(&b_g.t()?)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outputs, D::Minus1)?)
    }
}

/// Grouped factors shared by the dense grouped layer and its quantized shim.
#[derive(Debug, Clone)]
pub(crate) struct GroupedLora {
    layout: GroupLayout,
    factors: Option<GroupedFactors>,
    r: usize,
}

impl GroupedLora {
    pub(crate) fn new(
        in_features: usize,
        out_features: usize,
        config: &LoraConfig,
        device: &candle_core::Device,
    ) -> Result<Self> {
        if !config.lora_type.is_linear() {
            return Err(PeftError::UnsupportedVariant(format!(
                "grouped adapters only implement 'std', got '{}'",
                config.lora_type
            )));
        }
        let enable_lora = config.enable_lora.as_deref().ok_or_else(|| {
            PeftError::InvalidConfig("grouped adapters need enable_lora".into())
        })?;
        let layout = GroupLayout::new(enable_lora, out_features, device)?;

        let r = config.r;
        let factors = if r > 0 && layout.n_enabled() > 0 {
            let n = layout.n_enabled();
            Some(GroupedFactors {
                lora_a: Parameter::init(kaiming_uniform(), (r * n, in_features), ADAPTER_DTYPE, device)?,
                lora_b: Parameter::init(
                    Init::Const(0.0),
                    (layout.group_width() * n, r),
                    ADAPTER_DTYPE,
                    device,
                )?,
            })
        } else {
            None
        };

        Ok(Self { layout, factors, r })
    }

    pub(crate) fn has_factors(&self) -> bool {
        self.factors.is_some()
    }

    /// Unscaled, zero-padded correction; `None` without factors.
    pub(crate) fn correction(&self, x: &Tensor) -> Result<Option<Tensor>> {
        let Some(factors) = &self.factors else {
            return Ok(None);
        };
        let after_a = project(&factors.lora_a, x)?;
        let after_b = self
            .layout
            .grouped_projection(&after_a, factors.lora_b.as_tensor(), self.r)?;
        Ok(Some(self.layout.zero_pad(&after_b)?))
    }

    /// Unscaled `(out, in)` delta with disabled groups left at zero.
    pub(crate) fn delta(&self) -> Result<Option<Tensor>> {
        let Some(factors) = &self.factors else {
            return Ok(None);
        };
        // (in, r*n) -> (in, gw*n) -> (in, out)
        let a_t = factors.lora_a.as_tensor().t()?.contiguous()?;
        let per_group = self
            .layout
            .grouped_projection(&a_t, factors.lora_b.as_tensor(), self.r)?;
        Ok(Some(self.layout.zero_pad(&per_group)?.t()?.contiguous()?))
    }

    pub(crate) fn lora_a(&self) -> Option<&Parameter> {
        self.factors.as_ref().map(|f| &f.lora_a)
    }

    pub(crate) fn lora_b(&self) -> Option<&Parameter> {
        self.factors.as_ref().map(|f| &f.lora_b)
    }

    pub(crate) fn layout(&self) -> &GroupLayout {
        &self.layout
    }

    pub(crate) fn named_parameters(&self, prefix: &str) -> Vec<NamedParameter> {
        self.factors.as_ref().map_or_else(Vec::new, |f| {
            vec![
                NamedParameter::new(prefix, "lora_a.weight", &f.lora_a, true),
                NamedParameter::new(prefix, "lora_b.weight", &f.lora_b, true),
            ]
        })
    }

    pub(crate) fn num_parameters(&self) -> usize {
        self.factors
            .as_ref()
            .map_or(0, |f| f.lora_a.elem_count() + f.lora_b.elem_count())
    }
}

/// LoRA layer that corrects only the enabled output groups of a fused projection.
#[derive(Debug)]
pub struct MergedLoraLinear {
    base: BaseLinear,
    state: AdapterState,
    lora: GroupedLora,
}

impl MergedLoraLinear {
    /// Wrap `base`, correcting the groups selected by `config.enable_lora`.
    ///
    /// # Errors
    /// Returns an error if `enable_lora` is missing, empty or does not divide
    /// the output width, if the variant is not `std`, or if allocation fails.
    pub fn new(base: BaseLinear, config: &LoraConfig) -> Result<Self> {
        config.validate()?;

        let device = base.weight().as_tensor().device().clone();
        let lora = GroupedLora::new(base.in_features(), base.out_features(), config, &device)?;
        if lora.has_factors() {
            base.freeze_weight();
        }

        tracing::debug!(
            in_features = base.in_features(),
            out_features = base.out_features(),
            r = config.r,
            enabled_groups = lora.layout().n_enabled(),
            "built grouped LoRA layer"
        );

        Ok(Self {
            base,
            state: AdapterState::new(config, config.merge_on_eval()),
            lora,
        })
    }

    /// The wrapped base transform.
    #[must_use]
    pub fn base(&self) -> &BaseLinear {
        &self.base
    }

    /// Which output groups carry a correction.
    #[must_use]
    pub fn enable_lora(&self) -> &[bool] {
        self.lora.layout().enable_lora()
    }

    /// Per-position output mask, length `out_features`.
    #[must_use]
    pub fn lora_mask(&self) -> &[bool] {
        self.lora.layout().mask()
    }

    /// Down projection `A`, `(r * n_enabled, in)`.
    #[must_use]
    pub fn lora_a(&self) -> Option<&Parameter> {
        self.lora.lora_a()
    }

    /// Grouped up projection `B`, `(group_width * n_enabled, r)`.
    #[must_use]
    pub fn lora_b(&self) -> Option<&Parameter> {
        self.lora.lora_b()
    }

    /// The scaled correction alone, zero outside enabled groups.
    ///
    /// # Errors
    /// Returns an error if a tensor operation fails.
    pub fn correction(&self, input: &Tensor) -> Result<Option<Tensor>> {
        let x = input.to_dtype(ADAPTER_DTYPE)?;
        let x = self.state.apply_dropout(&x)?;
        match self.lora.correction(&x)? {
            Some(c) => Ok(Some((c * self.state.scaling())?)),
            None => Ok(None),
        }
    }
}

impl Adapter for MergedLoraLinear {
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
        tracing::debug!(disabled, "toggled grouped LoRA layer");
        Ok(())
    }

    fn named_parameters(&self, prefix: &str) -> Vec<NamedParameter> {
        let mut params = self.base.named_parameters(prefix, true);
        params.extend(self.lora.named_parameters(prefix));
        params
    }

    fn num_parameters(&self) -> usize {
        self.lora.num_parameters()
    }
}

impl Mergeable for MergedLoraLinear {
    fn delta_weight(&self) -> Result<Option<Tensor>> {
        match self.lora.delta()? {
            Some(delta) => Ok(Some((delta * self.state.scaling())?)),
            None => Ok(None),
        }
    }

    fn merge(&mut self) -> Result<()> {
        if self.state.disabled() {
            return Err(PeftError::NotMergeable("adapter is disabled".into()));
        }
        if self.state.merged() {
            tracing::debug!("grouped LoRA delta already merged, skipping");
            return Ok(());
        }
        if let Some(delta) = self.delta_weight()? {
            self.base.add_to_weight(&delta)?;
        }
        self.state.set_merged(true);
        tracing::debug!(r = self.state.r(), scaling = self.state.scaling(), "merged grouped LoRA delta");
        Ok(())
    }

    fn unmerge(&mut self) -> Result<()> {
        if !self.state.merged() {
            tracing::debug!("grouped LoRA delta not merged, skipping");
            return Ok(());
        }
        if let Some(delta) = self.delta_weight()? {
            self.base.sub_from_weight(&delta)?;
        }
        self.state.set_merged(false);
        tracing::debug!(r = self.state.r(), scaling = self.state.scaling(), "unmerged grouped LoRA delta");
        Ok(())
    }
}

/// Number of `true` entries, as the group count of a layout.
#[must_use]
pub fn count_enabled(enable_lora: &[bool]) -> usize {
    enable_lora.iter().filter(|e| **e).count()
}
