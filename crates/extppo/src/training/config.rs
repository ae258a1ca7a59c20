//! Algorithm configuration.

use crate::policy::Activation;
use crate::{ExtPpoError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::Device;

/// Learning-rate schedule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    /// Keep the initial learning rate
    #[default]
    Fixed,
    /// Adjust the learning rate from the measured KL divergence
    Adaptive,
}

/// Configuration for the PPO algorithm and its extensions
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    /// Passes over each rollout
    pub num_learning_epochs: usize,
    /// Minibatches per pass
    pub num_mini_batches: usize,
    /// Surrogate and value clipping range
    pub clip_param: f64,
    /// Discount factor
    pub gamma: f64,
    /// GAE lambda
    pub lam: f64,
    pub value_loss_coef: f64,
    pub entropy_coef: f64,
    pub learning_rate: f64,
    /// Maximum gradient norm
    pub max_grad_norm: f64,
    pub use_clipped_value_loss: bool,
    pub schedule: Schedule,
    /// Target KL for the adaptive schedule
    pub desired_kl: Option<f64>,
    /// Replay capacity in rollout windows
    pub replay_capacity_multiplier: usize,

    #[serde(skip, default = "default_device")]
    pub device: Device,

    // Extensions
    pub behavior_cloning: Option<BehaviorCloningConfig>,
    pub rnd: Option<RndConfig>,
    pub symmetry: Option<SymmetryConfig>,
    pub offline: Option<OfflineConfig>,
}

fn default_device() -> Device {
    Device::Cpu
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            num_learning_epochs: 1,
            num_mini_batches: 1,
            clip_param: 0.2,
            gamma: 0.998,
            lam: 0.95,
            value_loss_coef: 1.0,
            entropy_coef: 0.0,
            learning_rate: 1e-3,
            max_grad_norm: 1.0,
            use_clipped_value_loss: true,
            schedule: Schedule::Fixed,
            desired_kl: Some(0.01),
            replay_capacity_multiplier: 20,
            device: Device::Cpu,
            behavior_cloning: None,
            rnd: None,
            symmetry: None,
            offline: None,
        }
    }
}

impl PpoConfig {
    /// Parse from a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Train on the first CUDA device
    pub fn cuda(mut self) -> Self {
        self.device = Device::Cuda(0);
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_epochs(mut self, num_learning_epochs: usize, num_mini_batches: usize) -> Self {
        self.num_learning_epochs = num_learning_epochs;
        self.num_mini_batches = num_mini_batches;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule, desired_kl: Option<f64>) -> Self {
        self.schedule = schedule;
        self.desired_kl = desired_kl;
        self
    }

    pub fn with_behavior_cloning(mut self, config: BehaviorCloningConfig) -> Self {
        self.behavior_cloning = Some(config);
        self
    }

    pub fn with_rnd(mut self, config: RndConfig) -> Self {
        self.rnd = Some(config);
        self
    }

    pub fn with_symmetry(mut self, config: SymmetryConfig) -> Self {
        self.symmetry = Some(config);
        self
    }

    pub fn with_offline(mut self, config: OfflineConfig) -> Self {
        self.offline = Some(config);
        self
    }

    /// Whether the learning rate follows the measured KL
    pub fn adaptive_lr(&self) -> bool {
        self.desired_kl.is_some() && self.schedule == Schedule::Adaptive
    }

    /// Reject settings no update can run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_learning_epochs == 0 {
            return Err(ExtPpoError::Config("num_learning_epochs must be positive".into()));
        }
        if self.num_mini_batches == 0 {
            return Err(ExtPpoError::Config("num_mini_batches must be positive".into()));
        }
        if self.replay_capacity_multiplier == 0 {
            return Err(ExtPpoError::Config(
                "replay_capacity_multiplier must be positive".into(),
            ));
        }
        if let Some(offline) = &self.offline {
            if offline.update_frequencies <= 0.0 {
                return Err(ExtPpoError::Config("offline update_frequencies must be positive".into()));
            }
            if offline.batch_size == Some(0) {
                return Err(ExtPpoError::Config("offline batch_size must be positive".into()));
            }
            if offline.behavior_cloning.is_none() {
                return Err(ExtPpoError::Config(
                    "offline stage requires a behavior_cloning section".into(),
                ));
            }
        }
        Ok(())
    }

    /// Reject extensions the policy cannot train with.
    ///
    /// Symmetry augmentation mirrors single steps, which recurrent policies
    /// consume as padded trajectories.
    pub fn validate_for_policy(&self, recurrent: bool) -> Result<()> {
        if recurrent && self.symmetry.is_some() {
            return Err(ExtPpoError::Config(
                "symmetry augmentation is not supported with recurrent policies".into(),
            ));
        }
        Ok(())
    }
}

/// Cloning of expert policies, online or offline
///
/// `experts_path` and `cloning_loss_coeff` are required in configuration
/// files. `Default` fills them only for builder-style construction in code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorCloningConfig {
    /// One path per expert
    pub experts_path: Vec<String>,
    /// Name of the loader in the expert loader registry
    #[serde(default = "default_experts_loader")]
    pub experts_loader: String,
    /// Also match the expert's action std
    #[serde(default)]
    pub learn_std: bool,
    /// Initial weight of the cloning loss
    pub cloning_loss_coeff: f64,
    /// Multiplied into the coefficient every minibatch
    #[serde(default = "default_loss_decay")]
    pub loss_decay: f64,
}

fn default_experts_loader() -> String {
    "torchscript".to_string()
}

fn default_loss_decay() -> f64 {
    1.0
}

impl Default for BehaviorCloningConfig {
    fn default() -> Self {
        Self {
            experts_path: Vec::new(),
            experts_loader: default_experts_loader(),
            learn_std: false,
            cloning_loss_coeff: 1.0,
            loss_decay: default_loss_decay(),
        }
    }
}

/// Random network distillation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RndConfig {
    /// Width of the intrinsic-reward input state
    pub num_states: i64,
    /// Embedding width
    pub num_outputs: i64,
    pub predictor_hidden_dims: Vec<i64>,
    pub target_hidden_dims: Vec<i64>,
    pub activation: Activation,
    /// Scale of the intrinsic reward
    pub weight: f64,
    pub learning_rate: f64,
    pub state_normalization: bool,
    pub reward_normalization: bool,
}

impl Default for RndConfig {
    fn default() -> Self {
        Self {
            num_states: 1,
            num_outputs: 1,
            predictor_hidden_dims: vec![256, 256],
            target_hidden_dims: vec![256, 256],
            activation: Activation::Elu,
            weight: 0.0,
            learning_rate: 1e-3,
            state_normalization: false,
            reward_normalization: false,
        }
    }
}

/// Symmetry augmentation and mirror loss
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SymmetryConfig {
    /// Train on augmented copies of every minibatch
    pub use_data_augmentation: bool,
    /// Add the symmetry loss to the objective
    pub use_mirror_loss: bool,
    pub mirror_loss_coeff: f64,
    /// Name of the augmentation in the symmetry registry
    pub data_augmentation_func: Option<String>,
}

/// Offline fine-tuning from the replay store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Offline updates per online update
    pub update_frequencies: f64,
    /// Samples per minibatch, defaults to the online minibatch size
    pub batch_size: Option<usize>,
    /// Defaults to the online value
    pub num_learning_epochs: Option<usize>,
    pub behavior_cloning: Option<BehaviorCloningConfig>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            update_frequencies: 1.0,
            batch_size: None,
            num_learning_epochs: None,
            behavior_cloning: None,
        }
    }
}
