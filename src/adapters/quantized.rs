//! LoRA over quantized base weights.
//!
//! The base transform stays quantized and opaque behind [`QuantizedBackend`];
//! only the low-rank factors are kept in full precision. The correction can
//! never be folded into a quantized weight, so these layers do not merge.

use std::fmt;

use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Module, Tensor, D};
use candle_nn::Init;

use crate::adapters::merged::GroupedLora;
use crate::adapters::state::AdapterState;
use crate::adapters::{kaiming_uniform, project, ADAPTER_DTYPE};
use crate::config::LoraConfig;
use crate::error::{PeftError, Result};
use crate::param::{NamedParameter, Parameter};
use crate::traits::{Adapter, AdapterConfig, Mergeable, QuantizedBackend};

/// A GGML-quantized linear transform with an optional full-precision bias.
pub struct QMatMulBackend {
    matmul: QMatMul,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
}

impl QMatMulBackend {
    /// Wrap an already quantized `(out, in)` weight.
    ///
    /// # Errors
    /// Returns an error if the weight is not 2-D or the bias length differs
    /// from the output width.
    pub fn new(weight: QTensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.shape().dims2()?;
        if let Some(b) = &bias {
            if b.dims() != [out_features] {
                return Err(PeftError::ShapeMismatch {
                    expected: vec![out_features],
                    actual: b.dims().to_vec(),
                });
            }
        }
        Ok(Self {
            matmul: QMatMul::from_qtensor(weight)?,
            bias,
            in_features,
            out_features,
        })
    }

    /// Quantize a dense `(out, in)` weight to `dtype`.
    ///
    /// # Errors
    /// Returns an error if `in` is not a multiple of the block size of `dtype`.
    pub fn quantize(weight: &Tensor, bias: Option<Tensor>, dtype: GgmlDType) -> Result<Self> {
        Self::new(QTensor::quantize(weight, dtype)?, bias)
    }
}

impl fmt::Debug for QMatMulBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QMatMulBackend")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("bias", &self.bias.is_some())
            .finish_non_exhaustive()
    }
}

impl QuantizedBackend for QMatMulBackend {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        // QMatMul only takes f32 activations.
        let dtype = input.dtype();
        let out = self.matmul.forward(&input.to_dtype(DType::F32)?)?;
        let out = match &self.bias {
            Some(bias) => out.broadcast_add(&bias.to_dtype(DType::F32)?)?,
            None => out,
        };
        Ok(out.to_dtype(dtype)?)
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }
}

fn check_backend<Q: QuantizedBackend>(backend: &Q) -> Result<()> {
    if backend.in_features() == 0 || backend.out_features() == 0 {
        return Err(PeftError::InvalidConfig(format!(
            "quantized backend has degenerate shape ({}, {})",
            backend.out_features(),
            backend.in_features()
        )));
    }
    Ok(())
}

fn check_input<Q: QuantizedBackend>(backend: &Q, input: &Tensor) -> Result<()> {
    let last = input.dim(D::Minus1)?;
    if last != backend.in_features() {
        return Err(PeftError::ShapeMismatch {
            expected: vec![backend.in_features()],
            actual: vec![last],
        });
    }
    Ok(())
}

fn no_merge_state(config: &LoraConfig) -> AdapterState {
    let mut state = AdapterState::new(config, config.merge_on_eval());
    if state.merge_weights() {
        tracing::warn!("merge_weights is not supported over quantized weights, disabling it");
        state.disable_merge_policy();
    }
    state
}

fn add_correction(result: Tensor, correction: Option<Tensor>) -> Result<Tensor> {
    match correction {
        Some(c) => {
            let dtype = result.dtype();
            let sum = (result.to_dtype(ADAPTER_DTYPE)? + c.to_dtype(ADAPTER_DTYPE)?)?;
            Ok(sum.to_dtype(dtype)?)
        }
        None => Ok(result),
    }
}

#[derive(Debug, Clone)]
struct PlainFactors {
    lora_a: Parameter,
    lora_b: Parameter,
}

/// Plain LoRA on top of a quantized transform.
#[derive(Debug)]
pub struct QuantizedLoraLinear<Q: QuantizedBackend> {
    backend: Q,
    state: AdapterState,
    factors: Option<PlainFactors>,
}

impl<Q: QuantizedBackend> QuantizedLoraLinear<Q> {
    /// Attach rank-`config.r` factors to `backend`.
    ///
    /// # Errors
    /// Returns an error for a non-`std` variant, an invalid configuration or a
    /// degenerate backend shape.
    pub fn new(backend: Q, config: &LoraConfig, device: &candle_core::Device) -> Result<Self> {
        if !config.lora_type.is_linear() {
            return Err(PeftError::UnsupportedVariant(format!(
                "quantized adapters only implement 'std', got '{}'",
                config.lora_type
            )));
        }
        config.validate()?;
        check_backend(&backend)?;

        let factors = if config.r > 0 {
            Some(PlainFactors {
                lora_a: Parameter::init(
                    kaiming_uniform(),
                    (config.r, backend.in_features()),
                    ADAPTER_DTYPE,
                    device,
                )?,
                lora_b: Parameter::init(
                    Init::Const(0.0),
                    (backend.out_features(), config.r),
                    ADAPTER_DTYPE,
                    device,
                )?,
            })
        } else {
            None
        };

        Ok(Self {
            state: no_merge_state(config),
            backend,
            factors,
        })
    }

    /// The quantized base transform.
    pub fn backend(&self) -> &Q {
        &self.backend
    }

    /// Down projection `A`, `(r, in)`.
    pub fn lora_a(&self) -> Option<&Parameter> {
        self.factors.as_ref().map(|f| &f.lora_a)
    }

    /// Up projection `B`, `(out, r)`.
    pub fn lora_b(&self) -> Option<&Parameter> {
        self.factors.as_ref().map(|f| &f.lora_b)
    }
}

impl<Q: QuantizedBackend> Adapter for QuantizedLoraLinear<Q> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_input(&self.backend, input)?;
        let result = self.backend.forward(input)?;
        let Some(factors) = self.factors.as_ref().filter(|_| !self.state.disabled()) else {
            return Ok(result);
        };

        let x = self.state.apply_dropout(&input.to_dtype(ADAPTER_DTYPE)?)?;
        let after_b = project(&factors.lora_b, &project(&factors.lora_a, &x)?)?;
        add_correction(result, Some((after_b * self.state.scaling())?))
    }

    fn train(&mut self, mode: bool) -> Result<()> {
        self.state.set_training(mode);
        Ok(())
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    fn set_disabled(&mut self, disabled: bool) -> Result<()> {
        self.state.set_disabled(disabled);
        Ok(())
    }

    fn named_parameters(&self, prefix: &str) -> Vec<NamedParameter> {
        self.factors.as_ref().map_or_else(Vec::new, |f| {
            vec![
                NamedParameter::new(prefix, "lora_a.weight", &f.lora_a, true),
                NamedParameter::new(prefix, "lora_b.weight", &f.lora_b, true),
            ]
        })
    }

    fn num_parameters(&self) -> usize {
        self.factors
            .as_ref()
            .map_or(0, |f| f.lora_a.elem_count() + f.lora_b.elem_count())
    }
}

impl<Q: QuantizedBackend> Mergeable for QuantizedLoraLinear<Q> {
    fn delta_weight(&self) -> Result<Option<Tensor>> {
        match &self.factors {
            Some(f) => {
                let delta = f.lora_b.as_tensor().matmul(f.lora_a.as_tensor())?;
                Ok(Some((delta * self.state.scaling())?))
            }
            None => Ok(None),
        }
    }

    fn merge(&mut self) -> Result<()> {
        Err(PeftError::NotMergeable("base weight is quantized".into()))
    }

    fn unmerge(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Grouped LoRA on top of a quantized fused projection.
#[derive(Debug)]
pub struct QuantizedMergedLoraLinear<Q: QuantizedBackend> {
    backend: Q,
    state: AdapterState,
    lora: GroupedLora,
}

impl<Q: QuantizedBackend> QuantizedMergedLoraLinear<Q> {
    /// Attach grouped factors selected by `config.enable_lora` to `backend`.
    ///
    /// # Errors
    /// Returns an error if `enable_lora` is missing or does not divide the
    /// backend's output width, or for a non-`std` variant.
    pub fn new(backend: Q, config: &LoraConfig, device: &candle_core::Device) -> Result<Self> {
        config.validate()?;
        check_backend(&backend)?;
        let lora = GroupedLora::new(backend.in_features(), backend.out_features(), config, device)?;
        Ok(Self {
            state: no_merge_state(config),
            backend,
            lora,
        })
    }

    /// The quantized base transform.
    pub fn backend(&self) -> &Q {
        &self.backend
    }

    /// Per-position output mask.
    pub fn lora_mask(&self) -> &[bool] {
        self.lora.layout().mask()
    }

    /// Down projection `A`, `(r * n_enabled, in)`.
    pub fn lora_a(&self) -> Option<&Parameter> {
        self.lora.lora_a()
    }

    /// Grouped up projection `B`, `(group_width * n_enabled, r)`.
    pub fn lora_b(&self) -> Option<&Parameter> {
        self.lora.lora_b()
    }
}

impl<Q: QuantizedBackend> Adapter for QuantizedMergedLoraLinear<Q> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_input(&self.backend, input)?;
        let result = self.backend.forward(input)?;
        if self.state.disabled() || !self.lora.has_factors() {
            return Ok(result);
        }

        let x = self.state.apply_dropout(&input.to_dtype(ADAPTER_DTYPE)?)?;
        let correction = match self.lora.correction(&x)? {
            Some(c) => Some((c * self.state.scaling())?),
            None => None,
        };
        add_correction(result, correction)
    }

    fn train(&mut self, mode: bool) -> Result<()> {
        self.state.set_training(mode);
        Ok(())
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    fn set_disabled(&mut self, disabled: bool) -> Result<()> {
        self.state.set_disabled(disabled);
        Ok(())
    }

    fn named_parameters(&self, prefix: &str) -> Vec<NamedParameter> {
        self.lora.named_parameters(prefix)
    }

    fn num_parameters(&self) -> usize {
        self.lora.num_parameters()
    }
}

impl<Q: QuantizedBackend> Mergeable for QuantizedMergedLoraLinear<Q> {
    fn delta_weight(&self) -> Result<Option<Tensor>> {
        match self.lora.delta()? {
            Some(delta) => Ok(Some((delta * self.state.scaling())?)),
            None => Ok(None),
        }
    }

    fn merge(&mut self) -> Result<()> {
        Err(PeftError::NotMergeable("base weight is quantized".into()))
    }

    fn unmerge(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoraVariant;
    use candle_core::Device;

    const IN: usize = 64;
    const OUT: usize = 32;

    fn backend() -> QMatMulBackend {
        let weight = Tensor::randn(0f32, 0.1, (OUT, IN), &Device::Cpu).unwrap();
        let bias = Tensor::randn(0f32, 0.1, OUT, &Device::Cpu).unwrap();
        QMatMulBackend::quantize(&weight, Some(bias), GgmlDType::Q8_0).unwrap()
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.to_dtype(DType::F32)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn randomize(param: &Parameter) {
        let dims = param.as_tensor().dims().to_vec();
        param
            .set(&Tensor::randn(0f32, 0.5, dims, &Device::Cpu).unwrap())
            .unwrap();
    }

    #[test]
    fn test_backend_shape() {
        let backend = backend();
        assert_eq!(backend.in_features(), IN);
        assert_eq!(backend.out_features(), OUT);
        let x = Tensor::randn(0f32, 1.0, (3, IN), &Device::Cpu).unwrap();
        assert_eq!(backend.forward(&x).unwrap().dims(), &[3, OUT]);
    }

    #[test]
    fn test_backend_bias_shape_checked() {
        let weight = Tensor::zeros((OUT, IN), candle_core::DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::zeros(OUT + 1, candle_core::DType::F32, &Device::Cpu).unwrap();
        let result = QMatMulBackend::quantize(&weight, Some(bias), GgmlDType::Q8_0);
        assert!(matches!(result, Err(PeftError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_plain_identity_then_correction() {
        let config = LoraConfig {
            r: 4,
            lora_alpha: 8.0,
            ..Default::default()
        };
        let layer = QuantizedLoraLinear::new(backend(), &config, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, IN), &Device::Cpu).unwrap();
        let base = layer.backend().forward(&x).unwrap();
        assert_eq!(max_abs(&(layer.forward(&x).unwrap() - &base).unwrap()), 0.0);

        randomize(layer.lora_b().unwrap());
        let delta = layer.delta_weight().unwrap().unwrap();
        let expected = (base + x.matmul(&delta.t().unwrap()).unwrap()).unwrap();
        assert!(max_abs(&(layer.forward(&x).unwrap() - expected).unwrap()) < 1e-4);
    }

    fn assert_matches_f32<F: Fn(&Tensor) -> Result<Tensor>>(forward: F) {
        let x = Tensor::randn(0f32, 1.0, (3, IN), &Device::Cpu).unwrap();
        for dtype in [DType::F16, DType::BF16] {
            let x = x.to_dtype(dtype).unwrap();
            let out = forward(&x).unwrap();
            assert_eq!(out.dtype(), dtype);
            let reference = forward(&x.to_dtype(DType::F32).unwrap()).unwrap();
            let diff = (out.to_dtype(DType::F32).unwrap() - &reference).unwrap();
            assert!(max_abs(&diff) <= 1e-2 * max_abs(&reference) + 1e-3, "{dtype:?}");
        }
    }

    #[test]
    fn test_reduced_precision_inputs() {
        let config = LoraConfig {
            r: 4,
            lora_alpha: 8.0,
            ..Default::default()
        };
        let plain = QuantizedLoraLinear::new(backend(), &config, &Device::Cpu).unwrap();
        randomize(plain.lora_b().unwrap());
        assert_matches_f32(|x| plain.forward(x));

        let config = LoraConfig {
            enable_lora: Some(vec![true, false]),
            ..config
        };
        let grouped = QuantizedMergedLoraLinear::new(backend(), &config, &Device::Cpu).unwrap();
        randomize(grouped.lora_b().unwrap());
        assert_matches_f32(|x| grouped.forward(x));
    }

    #[test]
    fn test_merge_policy_forced_off() {
        let config = LoraConfig {
            r: 4,
            merge_weights: true,
            ..Default::default()
        };
        let mut layer = QuantizedLoraLinear::new(backend(), &config, &Device::Cpu).unwrap();
        assert!(!layer.state().merge_weights());
        layer.eval().unwrap();
        assert!(!layer.is_merged());
        assert!(matches!(layer.merge(), Err(PeftError::NotMergeable(_))));
    }

    #[test]
    fn test_plain_rejects_hyperbolic() {
        let config = LoraConfig {
            lora_type: LoraVariant::Hyperbolic { curvature: -1.0 },
            ..Default::default()
        };
        let result = QuantizedLoraLinear::new(backend(), &config, &Device::Cpu);
        assert!(matches!(result, Err(PeftError::UnsupportedVariant(_))));
    }

    #[test]
    fn test_input_width_checked() {
        let layer = QuantizedLoraLinear::new(backend(), &LoraConfig::default(), &Device::Cpu).unwrap();
        let x = Tensor::zeros((2, IN / 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(layer.forward(&x), Err(PeftError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_disable_bypasses_correction() {
        let mut layer = QuantizedLoraLinear::new(backend(), &LoraConfig::default(), &Device::Cpu).unwrap();
        randomize(layer.lora_b().unwrap());
        layer.set_disabled(true).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, IN), &Device::Cpu).unwrap();
        let diff = (layer.forward(&x).unwrap() - layer.backend().forward(&x).unwrap()).unwrap();
        assert_eq!(max_abs(&diff), 0.0);
    }

    #[test]
    fn test_grouped_masks_disabled_groups() {
        let config = LoraConfig {
            r: 2,
            enable_lora: Some(vec![true, false, false, true]),
            ..Default::default()
        };
        let layer = QuantizedMergedLoraLinear::new(backend(), &config, &Device::Cpu).unwrap();
        assert_eq!(layer.lora_b().unwrap().as_tensor().dims2().unwrap(), (16, 2));
        randomize(layer.lora_b().unwrap());

        let x = Tensor::randn(0f32, 1.0, (3, IN), &Device::Cpu).unwrap();
        let diff = (layer.forward(&x).unwrap() - layer.backend().forward(&x).unwrap()).unwrap();
        assert_eq!(max_abs(&diff.narrow(1, 8, 16).unwrap()), 0.0);
        assert!(max_abs(&diff.narrow(1, 0, 8).unwrap()) > 0.0);
        assert_eq!(layer.named_parameters("qkv").len(), 2);
    }

    #[test]
    fn test_grouped_divisibility() {
        let config = LoraConfig {
            enable_lora: Some(vec![true, false, true]),
            ..Default::default()
        };
        let result = QuantizedMergedLoraLinear::new(backend(), &config, &Device::Cpu);
        assert!(matches!(result, Err(PeftError::InvalidConfig(_))));
    }
}
