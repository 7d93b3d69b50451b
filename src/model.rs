//! Model-level adapter injection.
//!
//! This module provides functionality for:
//! - Matching layer names against the configured target modules
//! - Replacing matching linear layers with adapters
//! - Sweeping train/eval and enable/disable over every adapter

use std::collections::HashMap;

use candle_core::Tensor;
use regex::Regex;

use crate::adapters::lora::LoraLinear;
use crate::adapters::merged::MergedLoraLinear;
use crate::config::{LoraConfig, TargetModules};
use crate::error::{PeftError, Result};
use crate::linear::BaseLinear;
use crate::param::NamedParameter;
use crate::traits::{Adapter, AdapterConfig};
use crate::training;

/// Compiled form of [`TargetModules`].
#[derive(Debug, Clone)]
pub enum TargetMatcher {
    /// Match modules whose name ends with one of these strings.
    Suffix(Vec<String>),
    /// Match modules whose whole name matches the regex.
    Regex(Regex),
}

impl TargetMatcher {
    /// Compile a target specification.
    ///
    /// # Errors
    /// Returns an error if the pattern is not a valid regex.
    pub fn new(targets: &TargetModules) -> Result<Self> {
        match targets {
            TargetModules::Names(names) => Ok(Self::Suffix(names.clone())),
            TargetModules::Pattern(pattern) => Regex::new(&format!("^(?:{pattern})$"))
                .map(Self::Regex)
                .map_err(|e| PeftError::InvalidConfig(format!("invalid target pattern: {e}"))),
        }
    }

    /// Check if a module name is targeted.
    #[must_use]
    pub fn matches(&self, module_name: &str) -> bool {
        match self {
            Self::Suffix(names) => names.iter().any(|n| module_name.ends_with(n.as_str())),
            Self::Regex(re) => re.is_match(module_name),
        }
    }
}

/// One linear slot of the model.
enum Module {
    Plain(BaseLinear),
    Adapted(Box<dyn Adapter>),
}

impl Module {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::Plain(base) => base.forward(input),
            Self::Adapted(adapter) => adapter.forward(input),
        }
    }
}

/// Build the adapter matching `config`: grouped when `enable_lora` is set,
/// dense otherwise.
///
/// # Errors
/// Returns an error if the adapter cannot be constructed.
pub fn lora_factory(_name: &str, base: BaseLinear, config: &LoraConfig) -> Result<Box<dyn Adapter>> {
    if config.enable_lora.is_some() {
        Ok(Box::new(MergedLoraLinear::new(base, config)?))
    } else {
        Ok(Box::new(LoraLinear::new(base, config)?))
    }
}

/// A set of named linear layers, some of them wrapped by adapters.
pub struct LoraModel {
    config: LoraConfig,
    matcher: TargetMatcher,
    /// Insertion order is kept for parameter listing.
    modules: Vec<(String, Module)>,
    index: HashMap<String, usize>,
}

impl LoraModel {
    /// Create an empty model for `config`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: LoraConfig) -> Result<Self> {
        config.validate()?;
        let matcher = TargetMatcher::new(&config.target_modules)?;
        Ok(Self {
            config,
            matcher,
            modules: Vec::new(),
            index: HashMap::new(),
        })
    }

    /// Add `layers`, wrapping every targeted one with `factory`.
    ///
    /// # Returns
    /// Number of layers that received an adapter.
    ///
    /// # Errors
    /// Returns [`PeftError::TargetNotFound`] if no layer is targeted, or the
    /// factory's error. Nothing is added on failure, and the requires-grad
    /// flags of the layers handed to the factory are restored.
    pub fn inject<I, F>(&mut self, layers: I, mut factory: F) -> Result<usize>
    where
        I: IntoIterator<Item = (String, BaseLinear)>,
        F: FnMut(&str, BaseLinear, &LoraConfig) -> Result<Box<dyn Adapter>>,
    {
        let layers: Vec<_> = layers.into_iter().collect();
        if !layers.iter().any(|(name, _)| self.matcher.matches(name)) {
            return Err(PeftError::TargetNotFound {
                targets: self.config.target_modules.to_string(),
            });
        }

        let mut built = Vec::with_capacity(layers.len());
        let mut flags = Vec::new();
        let mut count = 0;
        for (name, base) in layers {
            let module = if self.matcher.matches(&name) {
                count += 1;
                tracing::debug!(module = %name, "injecting adapter");
                flags.extend(
                    std::iter::once(base.weight())
                        .chain(base.bias())
                        .map(|p| (p.clone(), p.requires_grad())),
                );
                match factory(&name, base, &self.config) {
                    Ok(adapter) => Module::Adapted(adapter),
                    Err(e) => {
                        for (param, requires_grad) in flags {
                            param.set_requires_grad(requires_grad);
                        }
                        tracing::warn!(module = %name, error = %e, "adapter injection failed");
                        return Err(e);
                    }
                }
            } else {
                Module::Plain(base)
            };
            built.push((name, module));
        }

        for (name, module) in built {
            match self.index.get(&name) {
                Some(&i) => self.modules[i].1 = module,
                None => {
                    self.index.insert(name.clone(), self.modules.len());
                    self.modules.push((name, module));
                }
            }
        }

        tracing::info!(adapted = count, targets = %self.config.target_modules, "injected adapters");
        Ok(count)
    }

    /// The configuration adapters are built from.
    #[must_use]
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    fn module(&self, name: &str) -> Result<&Module> {
        self.index
            .get(name)
            .map(|&i| &self.modules[i].1)
            .ok_or_else(|| PeftError::ModuleNotFound { name: name.to_string() })
    }

    /// Forward pass for a specific module.
    ///
    /// # Errors
    /// Returns an error if the module does not exist or the forward fails.
    pub fn forward(&self, name: &str, input: &Tensor) -> Result<Tensor> {
        self.module(name)?.forward(input)
    }

    /// Adapter wrapping `name`, if it was targeted.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&dyn Adapter> {
        match self.module(name) {
            Ok(Module::Adapted(adapter)) => Some(adapter.as_ref()),
            _ => None,
        }
    }

    /// Mutable access to the adapter wrapping `name`.
    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut (dyn Adapter + 'static)> {
        let &i = self.index.get(name)?;
        match &mut self.modules[i].1 {
            Module::Adapted(adapter) => Some(adapter.as_mut()),
            Module::Plain(_) => None,
        }
    }

    /// All module names, in insertion order.
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Names of modules wrapped by an adapter.
    #[must_use]
    pub fn adapted_module_names(&self) -> Vec<&str> {
        self.modules
            .iter()
            .filter(|(_, m)| matches!(m, Module::Adapted(_)))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn adapters_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Adapter>> {
        self.modules.iter_mut().filter_map(|(_, m)| match m {
            Module::Adapted(adapter) => Some(adapter),
            Module::Plain(_) => None,
        })
    }

    /// Switch every adapter to training (`true`) or eval (`false`) mode.
    ///
    /// # Errors
    /// Returns the first merge or unmerge failure.
    pub fn train(&mut self, mode: bool) -> Result<()> {
        for adapter in self.adapters_mut() {
            adapter.train(mode)?;
        }
        Ok(())
    }

    /// Equivalent to `train(false)`.
    ///
    /// # Errors
    /// Returns the first merge failure.
    pub fn eval(&mut self) -> Result<()> {
        self.train(false)
    }

    /// Re-enable every adapter.
    ///
    /// # Errors
    /// Returns an error if an adapter cannot be toggled.
    pub fn enable_adapter_layers(&mut self) -> Result<()> {
        self.set_adapter_layers(false)
    }

    /// Bypass every adapter, unmerging merged ones first.
    ///
    /// # Errors
    /// Returns an error if an adapter cannot be unmerged.
    pub fn disable_adapter_layers(&mut self) -> Result<()> {
        self.set_adapter_layers(true)
    }

    fn set_adapter_layers(&mut self, disabled: bool) -> Result<()> {
        for adapter in self.adapters_mut() {
            adapter.set_disabled(disabled)?;
        }
        tracing::debug!(disabled, "toggled adapter layers");
        Ok(())
    }

    /// Every parameter, prefixed with its module name.
    #[must_use]
    pub fn named_parameters(&self) -> Vec<NamedParameter> {
        self.modules
            .iter()
            .flat_map(|(name, module)| match module {
                Module::Plain(base) => base.named_parameters(name, false),
                Module::Adapted(adapter) => adapter.named_parameters(name),
            })
            .collect()
    }

    /// Freeze everything but the adapters, following `config.bias`, then
    /// unfreeze `config.modules_to_save`.
    pub fn mark_only_lora_as_trainable(&self) {
        let params = self.named_parameters();
        training::mark_only_lora_as_trainable(&params, self.config.bias);

        if let Some(saved) = &self.config.modules_to_save {
            for (name, module) in &self.modules {
                if !saved.iter().any(|s| name.ends_with(s.as_str())) {
                    continue;
                }
                let params = match module {
                    Module::Plain(base) => base.named_parameters(name, false),
                    Module::Adapted(adapter) => adapter.named_parameters(name),
                };
                for p in params {
                    p.param.set_requires_grad(true);
                }
            }
        }
    }

    /// Total number of adapter parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.modules
            .iter()
            .map(|(_, m)| match m {
                Module::Adapted(adapter) => adapter.num_parameters(),
                Module::Plain(_) => 0,
            })
            .sum()
    }

    /// The adapter configuration as pretty JSON.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn peft_config_as_json(&self, inference: bool) -> Result<String> {
        self.config.to_json(inference)
    }
}

impl std::fmt::Debug for LoraModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraModel")
            .field("config", &self.config)
            .field("modules", &self.module_names())
            .field("adapted", &self.adapted_module_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BiasPolicy, LoraVariant};
    use candle_core::Device;

    fn layers() -> Vec<(String, BaseLinear)> {
        [
            "layers.0.attn.q_proj",
            "layers.0.attn.k_proj",
            "layers.0.attn.v_proj",
            "layers.0.mlp.fc",
            "lm_head",
        ]
        .iter()
        .map(|name| (name.to_string(), BaseLinear::init(8, 8, true, &Device::Cpu).unwrap()))
        .collect()
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    fn randomize_all(model: &LoraModel) {
        for p in model.named_parameters() {
            if p.name.ends_with("lora_b.weight") {
                let dims = p.param.as_tensor().dims().to_vec();
                p.param
                    .set(&Tensor::randn(0f32, 0.5, dims, &Device::Cpu).unwrap())
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_suffix_targets() -> Result<()> {
        let mut model = LoraModel::new(LoraConfig::default())?;
        let count = model.inject(layers(), lora_factory)?;
        assert_eq!(count, 2);
        assert_eq!(
            model.adapted_module_names(),
            vec!["layers.0.attn.q_proj", "layers.0.attn.v_proj"]
        );
        assert_eq!(model.module_names().len(), 5);
        assert!(model.adapter("lm_head").is_none());
        Ok(())
    }

    #[test]
    fn test_regex_targets_full_match() -> Result<()> {
        let config = LoraConfig {
            target_modules: TargetModules::Pattern(r"layers\.\d+\.attn\.(k|v)_proj".into()),
            ..Default::default()
        };
        let mut model = LoraModel::new(config)?;
        model.inject(layers(), lora_factory)?;
        assert_eq!(
            model.adapted_module_names(),
            vec!["layers.0.attn.k_proj", "layers.0.attn.v_proj"]
        );

        // a partial match is not enough
        let matcher = TargetMatcher::new(&TargetModules::Pattern("attn".into()))?;
        assert!(!matcher.matches("layers.0.attn.q_proj"));
        Ok(())
    }

    #[test]
    fn test_invalid_regex() {
        let config = LoraConfig {
            target_modules: TargetModules::Pattern("layers.(".into()),
            ..Default::default()
        };
        assert!(matches!(LoraModel::new(config), Err(PeftError::InvalidConfig(_))));
    }

    #[test]
    fn test_no_target_found() -> Result<()> {
        let config = LoraConfig {
            target_modules: TargetModules::Names(vec!["c_attn".into()]),
            ..Default::default()
        };
        let mut model = LoraModel::new(config)?;
        let result = model.inject(layers(), lora_factory);
        assert!(matches!(result, Err(PeftError::TargetNotFound { .. })));
        assert!(model.module_names().is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_factory_restores_frozen_layers() -> Result<()> {
        let mut model = LoraModel::new(LoraConfig::default())?;
        let layers = layers();
        let q = layers[0].1.clone();
        let result = model.inject(layers, |name, base, config| {
            if name.ends_with("v_proj") {
                Err(PeftError::InvalidConfig("rejected".into()))
            } else {
                lora_factory(name, base, config)
            }
        });
        assert!(matches!(result, Err(PeftError::InvalidConfig(_))));
        assert!(model.module_names().is_empty());
        assert!(q.weight().requires_grad());
        Ok(())
    }

    #[test]
    fn test_forward_and_unknown_module() -> Result<()> {
        let mut model = LoraModel::new(LoraConfig::default())?;
        model.inject(layers(), lora_factory)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &Device::Cpu)?;
        assert_eq!(model.forward("layers.0.attn.q_proj", &x)?.dims(), &[2, 3, 8]);
        assert_eq!(model.forward("lm_head", &x)?.dims(), &[2, 3, 8]);
        assert!(matches!(
            model.forward("missing", &x),
            Err(PeftError::ModuleNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_eval_sweep_merges() -> Result<()> {
        let config = LoraConfig {
            merge_weights: true,
            ..Default::default()
        };
        let mut model = LoraModel::new(config)?;
        model.inject(layers(), lora_factory)?;
        randomize_all(&model);

        let x = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu)?;
        let before = model.forward("layers.0.attn.v_proj", &x)?;
        model.eval()?;
        for name in model.adapted_module_names() {
            assert!(model.adapter(name).unwrap().state().merged());
        }
        let after = model.forward("layers.0.attn.v_proj", &x)?;
        assert!(max_abs(&(after - before)?) < 1e-4);

        model.train(true)?;
        assert!(!model.adapter("layers.0.attn.q_proj").unwrap().state().merged());
        Ok(())
    }

    #[test]
    fn test_disable_sweep() -> Result<()> {
        let config = LoraConfig {
            lora_type: LoraVariant::Hyperbolic { curvature: -1.0 },
            ..Default::default()
        };
        let mut model = LoraModel::new(config)?;
        model.inject(layers(), lora_factory)?;
        randomize_all(&model);

        let x = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu)?;
        model.disable_adapter_layers()?;
        assert!(model.adapter_mut("layers.0.attn.q_proj").unwrap().state().disabled());
        let disabled = model.forward("layers.0.attn.q_proj", &x)?;
        model.enable_adapter_layers()?;
        let enabled = model.forward("layers.0.attn.q_proj", &x)?;
        assert!(max_abs(&(enabled - &disabled)?) > 0.0);
        Ok(())
    }

    #[test]
    fn test_parameters_and_selection() -> Result<()> {
        let config = LoraConfig {
            r: 2,
            bias: BiasPolicy::LoraOnly,
            modules_to_save: Some(vec!["lm_head".into()]),
            ..Default::default()
        };
        let mut model = LoraModel::new(config)?;
        model.inject(layers(), lora_factory)?;
        assert_eq!(model.num_parameters(), 2 * (2 * 8 + 8 * 2));

        model.mark_only_lora_as_trainable();
        let trainable: Vec<_> = model
            .named_parameters()
            .into_iter()
            .filter(|p| p.param.requires_grad())
            .map(|p| p.name)
            .collect();
        assert_eq!(
            trainable,
            vec![
                "layers.0.attn.q_proj.bias",
                "layers.0.attn.q_proj.lora_a.weight",
                "layers.0.attn.q_proj.lora_b.weight",
                "layers.0.attn.v_proj.bias",
                "layers.0.attn.v_proj.lora_a.weight",
                "layers.0.attn.v_proj.lora_b.weight",
                "lm_head.weight",
                "lm_head.bias",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_grouped_factory() -> Result<()> {
        let config = LoraConfig {
            target_modules: TargetModules::Names(vec!["qkv".into()]),
            enable_lora: Some(vec![true, false, true]),
            r: 2,
            ..Default::default()
        };
        let mut model = LoraModel::new(config)?;
        let qkv = BaseLinear::init(4, 12, false, &Device::Cpu)?;
        model.inject([("attn.qkv".to_string(), qkv)], lora_factory)?;
        assert_eq!(model.num_parameters(), 4 * 4 + 8 * 2);
        Ok(())
    }

    #[test]
    fn test_config_json() -> Result<()> {
        let model = LoraModel::new(LoraConfig::default())?;
        let json = model.peft_config_as_json(true)?;
        let parsed: LoraConfig = serde_json::from_str(&json).unwrap();
        assert!(parsed.inference_mode);
        assert!(!model.config().inference_mode);
        Ok(())
    }
}
