//! Offline fine-tuning from the replay store.

use super::algorithm::ExtensiblePpo;
use super::config::OfflineConfig;
use super::ppo::mse;
use crate::policy::ActorCritic;
use crate::storage::{MiniBatch, StorageField};
use crate::{ExtPpoError, Result};
use tracing::{debug, info};

/// Fractional cadence of offline updates relative to online ones.
///
/// Every online update adds one to the counter; each offline update spends
/// `1 / update_frequency` of it. Fractional frequencies are amortized across
/// iterations.
#[derive(Clone, Debug)]
pub(crate) struct OfflineSchedule {
    update_counter: f64,
    update_frequency: f64,
    pub(super) batch_size: Option<usize>,
    pub(super) num_learning_epochs: Option<usize>,
}

impl OfflineSchedule {
    pub(crate) fn new(config: &OfflineConfig) -> Self {
        Self {
            update_counter: 0.0,
            update_frequency: config.update_frequencies,
            batch_size: config.batch_size,
            num_learning_epochs: config.num_learning_epochs,
        }
    }

    /// Offline updates due after this online update.
    pub(crate) fn due_updates(&mut self) -> usize {
        let mut due = 0;
        while self.update_counter >= 0.0 {
            due += 1;
            self.update_counter -= 1.0 / self.update_frequency;
        }
        self.update_counter += 1.0;
        due
    }

    pub(crate) fn update_counter(&self) -> f64 {
        self.update_counter
    }
}

/// Outcome of one offline stage
pub(super) struct OfflineReport {
    pub fill_ratio: f64,
    pub bc_loss: Option<f64>,
    pub num_updates: usize,
}

impl<P: ActorCritic> ExtensiblePpo<P> {
    /// Fields copied from the rollout into the replay ring
    fn replay_fields(&self) -> Vec<StorageField> {
        let mut fields = vec![
            StorageField::Observations,
            StorageField::PrivilegedObservations,
            StorageField::Dones,
            StorageField::HiddenStates,
        ];
        if let Some(stage) = &self.offline_bc {
            fields.push(StorageField::ExpertActionMean);
            if stage.learn_std() {
                fields.push(StorageField::ExpertActionSigma);
            }
        }
        fields
    }

    /// Copy the finished rollout into the replay ring.
    pub fn transfer_rollout_to_replay(&mut self) -> Result<()> {
        let fields = self.replay_fields();
        let storage = self.storage.as_ref().ok_or(ExtPpoError::StorageNotInitialized)?;
        let replay = self.replay.as_mut().ok_or(ExtPpoError::StorageNotInitialized)?;
        replay.transfer_from(storage, &fields);
        Ok(())
    }

    /// Transfer, then run the offline updates that are due.
    pub(super) fn run_offline_stage(&mut self) -> Result<Option<OfflineReport>> {
        let Some(schedule) = self.offline.as_mut() else {
            return Ok(None);
        };
        let num_updates = schedule.due_updates();

        self.transfer_rollout_to_replay()?;
        let mut bc_loss = None;
        for _ in 0..num_updates {
            bc_loss = self.update_offline()?;
        }

        let fill_ratio = self
            .replay
            .as_ref()
            .map(|replay| replay.fill_ratio())
            .unwrap_or_default();
        info!(num_updates, fill_ratio, bc_loss = ?bc_loss, "Offline stage finished");
        Ok(Some(OfflineReport {
            fill_ratio,
            bc_loss,
            num_updates,
        }))
    }

    /// One offline pass over the replay ring, optimizing the cloning loss only.
    ///
    /// Returns the mean cloning loss, `None` without an offline cloning stage.
    pub fn update_offline(&mut self) -> Result<Option<f64>> {
        let storage = self.storage.as_ref().ok_or(ExtPpoError::StorageNotInitialized)?;
        let replay = self.replay.as_ref().ok_or(ExtPpoError::StorageNotInitialized)?;
        let schedule = self
            .offline
            .as_ref()
            .ok_or_else(|| ExtPpoError::Config("offline stage is not configured".into()))?;
        if replay.size() == 0 {
            return Ok(None);
        }

        let batch_size = schedule
            .batch_size
            .unwrap_or(storage.num_envs() * storage.num_transitions_per_env() / self.config.num_mini_batches)
            .max(1);
        let num_envs = replay.buffers().num_envs();
        let rows = num_envs * replay.size();
        let mut num_mini_batches = (rows / batch_size).max(1);
        let num_epochs = schedule
            .num_learning_epochs
            .unwrap_or(self.config.num_learning_epochs);

        let recurrent = self.policy.is_recurrent();
        let generator: Box<dyn Iterator<Item = MiniBatch>> = if recurrent {
            // Recurrent minibatches split instances, never time
            num_mini_batches = num_mini_batches.min(num_envs);
            Box::new(replay.recurrent_mini_batch_generator(num_mini_batches, num_epochs))
        } else {
            Box::new(replay.mini_batch_generator(num_mini_batches, num_epochs))
        };

        let Some(stage) = self.offline_bc.as_mut() else {
            return Ok(None);
        };
        let max_grad_norm = self.config.max_grad_norm;
        let mut total = 0.0;
        let mut num_updates = 0usize;
        for batch in generator {
            let target = batch
                .expert_action_mean
                .as_ref()
                .ok_or(ExtPpoError::MissingField("expert_action_mean"))?;
            let distribution = self.policy.act(
                &batch.observations,
                batch.masks.as_ref(),
                batch.hidden_states.as_ref().map(|h| &h.actor),
            );
            let mut bc_loss = mse(&distribution.mean, target);
            if stage.learn_std() {
                let target = batch
                    .expert_action_sigma
                    .as_ref()
                    .ok_or(ExtPpoError::MissingField("expert_action_sigma"))?;
                bc_loss = bc_loss + mse(&distribution.std, target);
            }
            stage.decay();

            self.optimizer.backward_step(&bc_loss, Some(max_grad_norm));
            total += bc_loss.double_value(&[]);
            num_updates += 1;
        }

        debug!(
            num_mini_batches,
            num_epochs,
            loss_coeff = stage.loss_coeff(),
            "Offline update finished"
        );
        Ok(Some(total / num_updates.max(1) as f64))
    }

    /// Fractional offline counter, `None` without an offline stage
    pub fn offline_update_counter(&self) -> Option<f64> {
        self.offline.as_ref().map(OfflineSchedule::update_counter)
    }
}
