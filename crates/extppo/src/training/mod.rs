//! Training system for extensible PPO.
//!
//! Provides:
//! - `ExtensiblePpo` - the learner: act, record, compute returns, update
//! - `PpoConfig` - algorithm and extension configuration
//! - `UpdateStats` - losses and schedule state of one update

mod algorithm;
mod config;
mod offline;
mod optimizer;
mod ppo;
mod stats;

pub use algorithm::{ExtensiblePpo, Extensions};
pub use config::{
    BehaviorCloningConfig, OfflineConfig, PpoConfig, RndConfig, Schedule, SymmetryConfig,
};
pub use optimizer::TorchOptimizer;
pub use ppo::{adapt_learning_rate, surrogate_loss, value_loss, MAX_ADAPTIVE_LR, MIN_ADAPTIVE_LR};
pub use stats::UpdateStats;
