//! Expert policies for behavior cloning.

use crate::training::BehaviorCloningConfig;
use crate::{ExtPpoError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tch::{CModule, Device, Kind, Tensor};
use tracing::info;

/// A frozen policy providing cloning targets.
pub trait Expert {
    /// Deterministic action for `observations`
    fn act_inference(&self, observations: &Tensor) -> Result<Tensor>;

    /// Spread target for the given expert actions
    fn actions_log_prob(&self, actions: &Tensor) -> Result<Tensor>;
}

/// Expert exported as a TorchScript module.
///
/// `forward` gives the action; a `get_actions_log_prob` method, when the
/// module exports one, gives the spread target.
pub struct TorchScriptExpert {
    module: CModule,
    device: Device,
}

impl TorchScriptExpert {
    pub fn load(path: &str, device: Device) -> Result<Self> {
        let mut module =
            CModule::load_on_device(path, device).map_err(|source| ExtPpoError::ExpertLoad {
                path: path.to_string(),
                source,
            })?;
        module.set_eval();
        Ok(Self { module, device })
    }
}

impl Expert for TorchScriptExpert {
    fn act_inference(&self, observations: &Tensor) -> Result<Tensor> {
        let obs = observations.to_device(self.device);
        Ok(self.module.forward_ts(&[obs])?)
    }

    fn actions_log_prob(&self, actions: &Tensor) -> Result<Tensor> {
        let actions = actions.to_device(self.device);
        Ok(self.module.method_ts("get_actions_log_prob", &[actions])?)
    }
}

/// Builds an expert from a path.
pub type ExpertLoader = Arc<dyn Fn(&str, Device) -> Result<Box<dyn Expert>>>;

/// Expert loaders by name. `"torchscript"` is always registered.
#[derive(Clone)]
pub struct ExpertLoaderRegistry {
    loaders: HashMap<String, ExpertLoader>,
}

impl Default for ExpertLoaderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            loaders: HashMap::new(),
        };
        registry.register("torchscript", |path: &str, device: Device| {
            let expert: Box<dyn Expert> = Box::new(TorchScriptExpert::load(path, device)?);
            Ok(expert)
        });
        registry
    }
}

impl ExpertLoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, loader: F)
    where
        F: Fn(&str, Device) -> Result<Box<dyn Expert>> + 'static,
    {
        self.loaders.insert(name.into(), Arc::new(loader));
    }

    pub fn with<F>(mut self, name: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&str, Device) -> Result<Box<dyn Expert>> + 'static,
    {
        self.register(name, loader);
        self
    }

    pub fn load(&self, name: &str, path: &str, device: Device) -> Result<Box<dyn Expert>> {
        let loader = self
            .loaders
            .get(name)
            .ok_or_else(|| ExtPpoError::UnknownExpertLoader(name.to_string()))?;
        loader(path, device)
    }
}

impl fmt::Debug for ExpertLoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.loaders.keys()).finish()
    }
}

/// Which instances each expert is responsible for.
#[derive(Clone, Default)]
pub enum ExpertEnvMapping {
    /// A single expert covers every instance
    #[default]
    All,
    /// Expert index to the `Int64` indices of its instances
    Partition(Arc<dyn Fn(usize) -> Tensor>),
}

impl ExpertEnvMapping {
    pub fn partition(f: impl Fn(usize) -> Tensor + 'static) -> Self {
        ExpertEnvMapping::Partition(Arc::new(f))
    }

    fn indices(&self, expert: usize) -> Option<Tensor> {
        match self {
            ExpertEnvMapping::All => None,
            ExpertEnvMapping::Partition(f) => Some(f(expert)),
        }
    }
}

/// Maps student observations to what the experts observe.
pub type ExpertObservationFn = Arc<dyn Fn(&Tensor) -> Tensor>;

/// Experts of one cloning stage plus how to query them.
pub struct ExpertEnsemble {
    experts: Vec<Box<dyn Expert>>,
    mapping: ExpertEnvMapping,
    observation_fn: Option<ExpertObservationFn>,
    learn_std: bool,
}

fn scatter_rows(target: &mut Option<Tensor>, indices: Option<&Tensor>, values: Tensor, num_envs: i64) {
    match indices {
        None => *target = Some(values),
        Some(indices) => {
            let full = target.get_or_insert_with(|| {
                let mut shape = values.size();
                shape[0] = num_envs;
                Tensor::zeros(shape.as_slice(), (Kind::Float, values.device()))
            });
            let _ = full.index_copy_(0, &indices.to_device(values.device()), &values.to_kind(Kind::Float));
        }
    }
}

impl ExpertEnsemble {
    /// Group loaded experts. Several experts need a partition mapping.
    pub fn new(
        stage: &'static str,
        experts: Vec<Box<dyn Expert>>,
        mapping: Option<ExpertEnvMapping>,
        observation_fn: Option<ExpertObservationFn>,
        learn_std: bool,
    ) -> Result<Self> {
        let mapping = match mapping {
            Some(mapping) => mapping,
            None if experts.len() > 1 => {
                return Err(ExtPpoError::MissingExpertMapping {
                    stage,
                    num_experts: experts.len(),
                })
            }
            None => ExpertEnvMapping::All,
        };
        Ok(Self {
            experts,
            mapping,
            observation_fn,
            learn_std,
        })
    }

    /// Load every expert named by `config` through `loaders`.
    pub fn load(
        stage: &'static str,
        config: &BehaviorCloningConfig,
        loaders: &ExpertLoaderRegistry,
        mapping: Option<ExpertEnvMapping>,
        observation_fn: Option<ExpertObservationFn>,
        device: Device,
    ) -> Result<Self> {
        if config.experts_path.len() > 1 && mapping.is_none() {
            return Err(ExtPpoError::MissingExpertMapping {
                stage,
                num_experts: config.experts_path.len(),
            });
        }
        let experts = config
            .experts_path
            .iter()
            .map(|path| loaders.load(&config.experts_loader, path, device))
            .collect::<Result<Vec<_>>>()?;
        info!(
            stage,
            num_experts = experts.len(),
            loader = %config.experts_loader,
            "Loaded experts"
        );
        Self::new(stage, experts, mapping, observation_fn, config.learn_std)
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    pub fn learn_std(&self) -> bool {
        self.learn_std
    }

    /// Cloning targets for every instance: `(mean, sigma)`.
    ///
    /// Each expert answers for its own instances only and the answers are
    /// written into full-width tensors. `sigma` is `None` unless the stage
    /// learns the std.
    pub fn targets(&self, observations: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let expert_obs = match &self.observation_fn {
            Some(f) => f(observations),
            None => observations.shallow_clone(),
        };
        let num_envs = expert_obs.size()[0];

        let mut mean = None;
        let mut sigma = None;
        tch::no_grad(|| -> Result<()> {
            for (i, expert) in self.experts.iter().enumerate() {
                let indices = self.mapping.indices(i);
                let obs = match &indices {
                    Some(idx) => expert_obs.index_select(0, &idx.to_device(expert_obs.device())),
                    None => expert_obs.shallow_clone(),
                };
                let expert_mean = expert.act_inference(&obs)?;
                if self.learn_std {
                    let expert_sigma = expert.actions_log_prob(&expert_mean)?;
                    scatter_rows(&mut sigma, indices.as_ref(), expert_sigma, num_envs);
                }
                scatter_rows(&mut mean, indices.as_ref(), expert_mean, num_envs);
            }
            Ok(())
        })?;

        let mean = mean.ok_or_else(|| {
            ExtPpoError::Config("behavior cloning configured without experts".into())
        })?;
        Ok((mean, sigma))
    }
}

impl fmt::Debug for ExpertEnsemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpertEnsemble")
            .field("num_experts", &self.experts.len())
            .field("learn_std", &self.learn_std)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Expert answering a constant action and a constant spread.
    pub(crate) struct ConstantExpert {
        pub action: f64,
        pub num_actions: i64,
    }

    impl Expert for ConstantExpert {
        fn act_inference(&self, observations: &Tensor) -> Result<Tensor> {
            Ok(Tensor::full(
                [observations.size()[0], self.num_actions],
                self.action,
                (Kind::Float, observations.device()),
            ))
        }

        fn actions_log_prob(&self, actions: &Tensor) -> Result<Tensor> {
            Ok(actions.abs() * 0.1)
        }
    }

    fn constant(action: f64) -> Box<dyn Expert> {
        Box::new(ConstantExpert {
            action,
            num_actions: 2,
        })
    }

    #[test]
    fn test_multiple_experts_need_mapping() {
        let result = ExpertEnsemble::new("online", vec![constant(1.0), constant(2.0)], None, None, false);
        match result {
            Err(ExtPpoError::MissingExpertMapping { stage, num_experts }) => {
                assert_eq!(stage, "online");
                assert_eq!(num_experts, 2);
            }
            other => panic!("Expected mapping error, got {:?}", other.map(|e| e.len())),
        }
    }

    #[test]
    fn test_partition_scatters_into_full_width() {
        let mapping = ExpertEnvMapping::partition(|i| {
            if i == 0 {
                Tensor::from_slice(&[0i64, 2])
            } else {
                Tensor::from_slice(&[1i64, 3])
            }
        });
        let ensemble = ExpertEnsemble::new(
            "online",
            vec![constant(1.0), constant(-2.0)],
            Some(mapping),
            None,
            true,
        )
        .unwrap();

        let obs = Tensor::zeros([4, 3], (Kind::Float, Device::Cpu));
        let (mean, sigma) = ensemble.targets(&obs).unwrap();
        assert_eq!(mean.size(), [4, 2]);
        assert_eq!(mean.double_value(&[0, 0]), 1.0);
        assert_eq!(mean.double_value(&[1, 1]), -2.0);
        assert_eq!(mean.double_value(&[2, 0]), 1.0);
        let sigma = sigma.unwrap();
        assert!((sigma.double_value(&[3, 0]) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_observation_fn_feeds_experts() {
        let obs_fn: ExpertObservationFn = Arc::new(|obs: &Tensor| obs.narrow(0, 0, 2));
        let ensemble = ExpertEnsemble::new("offline", vec![constant(0.5)], None, Some(obs_fn), false).unwrap();
        let (mean, sigma) = ensemble
            .targets(&Tensor::zeros([5, 3], (Kind::Float, Device::Cpu)))
            .unwrap();
        assert_eq!(mean.size(), [2, 2]);
        assert!(sigma.is_none());
    }

    #[test]
    fn test_unknown_loader() {
        let registry = ExpertLoaderRegistry::new();
        match registry.load("pickle", "expert.pt", Device::Cpu) {
            Err(ExtPpoError::UnknownExpertLoader(name)) => assert_eq!(name, "pickle"),
            _ => panic!("Expected unknown loader error"),
        }
    }

    #[test]
    fn test_missing_torchscript_file() {
        let registry = ExpertLoaderRegistry::new();
        let result = registry.load("torchscript", "/nonexistent/expert.pt", Device::Cpu);
        assert!(matches!(result, Err(ExtPpoError::ExpertLoad { .. })));
    }
}
