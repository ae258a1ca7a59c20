//! Per-update training statistics.

use crate::log::{MetricLogger, Metrics};
use serde::Serialize;

/// Losses and schedule state reported by one `update` call.
///
/// Losses are means over every minibatch of the update. Optional entries are
/// `None` when the corresponding extension is not configured.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UpdateStats {
    pub mean_value_loss: f64,
    pub mean_surrogate_loss: f64,
    pub mean_entropy: f64,
    pub mean_bc_loss: Option<f64>,
    pub mean_rnd_loss: Option<f64>,
    pub mean_symmetry_loss: Option<f64>,
    /// Fraction of the replay ring holding valid rows
    pub replay_fill_ratio: Option<f64>,
    /// Cloning loss of the last offline update
    pub offline_bc_loss: Option<f64>,
    /// Offline updates run after this online update
    pub num_offline_updates: usize,
    pub learning_rate: f64,
    pub bc_loss_coeff: Option<f64>,
    pub offline_bc_loss_coeff: Option<f64>,
}

impl UpdateStats {
    /// Flatten into `category/name` metrics, skipping absent entries.
    pub fn to_metrics(&self) -> Metrics {
        let mut metrics = Metrics::new();
        metrics.insert("loss/value_function".to_string(), self.mean_value_loss);
        metrics.insert("loss/surrogate".to_string(), self.mean_surrogate_loss);
        metrics.insert("loss/entropy".to_string(), self.mean_entropy);
        metrics.insert("loss/learning_rate".to_string(), self.learning_rate);

        let optional = [
            ("loss/behavior_cloning", self.mean_bc_loss),
            ("loss/rnd", self.mean_rnd_loss),
            ("loss/symmetry", self.mean_symmetry_loss),
            ("offline/replay_fill_ratio", self.replay_fill_ratio),
            ("offline/behavior_cloning", self.offline_bc_loss),
            ("schedule/bc_loss_coeff", self.bc_loss_coeff),
            ("schedule/offline_bc_loss_coeff", self.offline_bc_loss_coeff),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                metrics.insert(name.to_string(), value);
            }
        }
        metrics
    }

    pub fn log_to(&self, logger: &dyn MetricLogger, step: u64) {
        logger.log_metrics(&self.to_metrics(), step);
    }
}
