//! # extppo
//!
//! The learning core of an on-policy/off-policy robotics RL stack.
//!
//! ## Overview
//!
//! extppo provides:
//! - `RolloutStorage` - time-major store for one rollout window, with GAE and
//!   flat or recurrent minibatch generators
//! - `ReplayStorage` - ring buffer of past rollouts for offline fine-tuning
//! - `ExtensiblePpo` - clipped-surrogate PPO with optional behavior cloning,
//!   random network distillation, symmetry augmentation and an offline stage
//! - `ActorCritic` - the contract a policy/value module has to satisfy, with
//!   feed-forward and recurrent reference implementations
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use extppo::prelude::*;
//! use tch::Device;
//!
//! let policy = MlpActorCritic::new(obs_dim, obs_dim, act_dim, MlpConfig::default(), Device::Cpu);
//! let mut ppo = ExtensiblePpo::new(policy, PpoConfig::default(), Extensions::default())?;
//! ppo.init_storage(num_envs, 24, &[obs_dim], None, &[act_dim])?;
//!
//! let actions = ppo.act(&obs, &critic_obs)?;
//! let step = env.step(&actions);
//! ppo.process_env_step(&step.rewards, &step.dones, &step.info)?;
//! // ... after 24 steps
//! ppo.compute_returns(&step.critic_observations())?;
//! let stats = ppo.update()?;
//! ```

pub mod env;
pub mod extensions;
pub mod log;
pub mod policy;
pub mod storage;
pub mod training;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::env::{EnvStep, StepInfo, VecEnv};
    pub use crate::extensions::{
        EmpiricalNormalization, Expert, ExpertEnvMapping, ExpertLoaderRegistry,
        RandomNetworkDistillation, SymmetryAugmentation, SymmetryRegistry, TorchScriptExpert,
    };
    pub use crate::log::{CompositeLogger, ConsoleLogger, MetricLogger, Metrics, NoOpLogger};
    pub use crate::policy::{
        ActorCritic, DiagGaussian, HasVarStore, MlpActorCritic, MlpConfig, RecurrentActorCritic,
        RecurrentConfig, RnnType,
    };
    pub use crate::storage::{
        HiddenStates, MiniBatch, RecurrentState, ReplayStorage, RolloutStatistics, RolloutStorage, StorageField,
        StorageLayout, Transition,
    };
    pub use crate::training::{
        BehaviorCloningConfig, ExtensiblePpo, Extensions, OfflineConfig, PpoConfig, RndConfig,
        Schedule, SymmetryConfig, UpdateStats,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum ExtPpoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{stage} behavior cloning has {num_experts} experts but no env mapping function")]
    MissingExpertMapping { stage: &'static str, num_experts: usize },

    #[error("Data augmentation enabled but the function is not callable: {0:?}")]
    AugmentationNotCallable(Option<String>),

    #[error("Unknown expert loader: {0}")]
    UnknownExpertLoader(String),

    #[error("Failed to load expert from {path}: {source}")]
    ExpertLoad {
        path: String,
        #[source]
        source: tch::TchError,
    },

    #[error("Transition field `{0}` is required but was not recorded")]
    MissingField(&'static str),

    #[error("Storage has not been initialized, call init_storage first")]
    StorageNotInitialized,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    TensorError(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, ExtPpoError>;
