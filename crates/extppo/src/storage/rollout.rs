//! Storage for one on-policy rollout window.

use super::buffers::{StorageLayout, TransitionBuffers};
use super::minibatch::{MiniBatchGenerator, RecurrentMiniBatchGenerator};
use super::transition::Transition;
use crate::Result;
use tch::{Kind, Tensor};

/// Episode statistics over the valid rows of a rollout
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RolloutStatistics {
    pub mean_episode_length: f64,
    pub mean_reward: f64,
}

/// Time-major `[num_transitions_per_env, num_envs, ...]` rollout buffer.
///
/// Capacity is one rollout window. The algorithm fills it step by step,
/// computes returns, trains on it and clears it.
#[derive(Debug)]
pub struct RolloutStorage {
    buffers: TransitionBuffers,
}

impl RolloutStorage {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            buffers: TransitionBuffers::new(layout),
        }
    }

    pub fn buffers(&self) -> &TransitionBuffers {
        &self.buffers
    }

    pub fn layout(&self) -> &StorageLayout {
        self.buffers.layout()
    }

    pub fn num_transitions_per_env(&self) -> usize {
        self.buffers.capacity()
    }

    pub fn num_envs(&self) -> usize {
        self.buffers.num_envs()
    }

    pub fn step(&self) -> usize {
        self.buffers.step()
    }

    pub fn size(&self) -> usize {
        self.buffers.size()
    }

    /// Record one step for every instance.
    pub fn add_transitions(&mut self, transition: &Transition) -> Result<()> {
        self.buffers.append(transition)
    }

    /// Generalized advantage estimation over the valid rows.
    ///
    /// `last_values` is the critic's estimate for the observation following
    /// the final row, shaped `[num_envs, 1]` or `[num_envs]`. Returns are
    /// `advantage + value`; the stored advantages are then normalized to zero
    /// mean and unit (unbiased) std.
    pub fn compute_returns(&mut self, last_values: &Tensor, gamma: f64, lam: f64) {
        let steps = self.buffers.size as i64;
        if steps == 0 {
            return;
        }
        let b = &self.buffers;
        let last_values = last_values.reshape([-1, 1]).detach();
        let mut advantage = last_values.zeros_like();

        for t in (0..steps).rev() {
            let next_values = if t == steps - 1 {
                last_values.shallow_clone()
            } else {
                b.values.get(t + 1)
            };
            let not_terminal = 1.0 - &b.dones.get(t).to_kind(Kind::Float);
            let values = b.values.get(t);

            let delta = b.rewards.get(t) + gamma * &next_values * &not_terminal - &values;
            advantage = &delta + gamma * lam * &not_terminal * &advantage;
            b.returns.get(t).copy_(&(&advantage + &values));
        }

        let returns = b.returns.narrow(0, 0, steps);
        let advantages = &returns - b.values.narrow(0, 0, steps);
        let normalized =
            (&advantages - advantages.mean(Kind::Float)) / (advantages.std(true) + 1e-8);
        b.advantages.narrow(0, 0, steps).copy_(&normalized);
    }

    /// Mean trajectory length and mean reward over the valid rows.
    ///
    /// The last row is counted as a boundary, so trajectories still running
    /// at the end of the window count as finished.
    pub fn get_statistics(&self) -> Option<RolloutStatistics> {
        let steps = self.buffers.size as i64;
        if steps == 0 {
            return None;
        }

        let done = self.buffers.dones.narrow(0, 0, steps).to_kind(Kind::Int64);
        let _ = done.get(steps - 1).fill_(1i64);
        let flat_dones = done.permute([1, 0, 2]).reshape([-1]);
        let done_indices = Tensor::cat(
            &[
                Tensor::from_slice(&[-1i64]).to_device(flat_dones.device()),
                flat_dones.nonzero().select(1, 0),
            ],
            0,
        );
        let count = done_indices.size()[0] - 1;
        let lengths = done_indices.narrow(0, 1, count) - done_indices.narrow(0, 0, count);

        Some(RolloutStatistics {
            mean_episode_length: lengths.to_kind(Kind::Float).mean(Kind::Float).double_value(&[]),
            mean_reward: self
                .buffers
                .rewards
                .narrow(0, 0, steps)
                .mean(Kind::Float)
                .double_value(&[]),
        })
    }

    pub fn mini_batch_generator(&self, num_mini_batches: usize, num_epochs: usize) -> MiniBatchGenerator {
        self.buffers.mini_batch_generator(num_mini_batches, num_epochs)
    }

    pub fn recurrent_mini_batch_generator(
        &self,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> RecurrentMiniBatchGenerator {
        self.buffers
            .recurrent_mini_batch_generator(num_mini_batches, num_epochs)
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
