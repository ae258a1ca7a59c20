//! Minibatch generators over a store's valid rows.
//!
//! Both generators own shallow clones of the buffer tensors, so they stay
//! valid while the caller keeps mutating its own state. They are finite and
//! cannot be restarted.

use super::transition::{HiddenStates, RecurrentState};
use tch::{Kind, Tensor};

/// A minibatch of experience for training.
///
/// Flat minibatches are `[batch, ...]`. Recurrent minibatches keep the time
/// axis: observations are padded trajectories `[time, segments, ...]` with a
/// validity mask, every other field is `[time, instances, ...]`.
pub struct MiniBatch {
    pub observations: Tensor,
    pub critic_observations: Tensor,
    pub actions: Tensor,
    pub target_values: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
    pub old_actions_log_prob: Tensor,
    pub old_mu: Tensor,
    pub old_sigma: Tensor,
    /// Memory state at the start of every segment (recurrent only)
    pub hidden_states: Option<HiddenStates>,
    /// Trajectory validity mask (recurrent only)
    pub masks: Option<Tensor>,
    pub expert_action_mean: Option<Tensor>,
    pub expert_action_sigma: Option<Tensor>,
    pub rnd_state: Option<Tensor>,
}

fn opt_shallow(t: &Option<Tensor>) -> Option<Tensor> {
    t.as_ref().map(|t| t.shallow_clone())
}

/// Time-major fields shared by both generators.
pub(crate) struct BatchSource {
    pub observations: Tensor,
    pub critic_observations: Tensor,
    pub actions: Tensor,
    pub values: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
    pub actions_log_prob: Tensor,
    pub mu: Tensor,
    pub sigma: Tensor,
    pub expert_action_mean: Option<Tensor>,
    pub expert_action_sigma: Option<Tensor>,
    pub rnd_state: Option<Tensor>,
}

impl BatchSource {
    fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> BatchSource {
        BatchSource {
            observations: f(&self.observations),
            critic_observations: f(&self.critic_observations),
            actions: f(&self.actions),
            values: f(&self.values),
            advantages: f(&self.advantages),
            returns: f(&self.returns),
            actions_log_prob: f(&self.actions_log_prob),
            mu: f(&self.mu),
            sigma: f(&self.sigma),
            expert_action_mean: self.expert_action_mean.as_ref().map(&f),
            expert_action_sigma: self.expert_action_sigma.as_ref().map(&f),
            rnd_state: self.rnd_state.as_ref().map(&f),
        }
    }
}

/// Shuffled minibatches over the flattened `time * instances` axis.
///
/// One permutation is drawn up front and every epoch walks the same
/// partition, so minibatch `i` holds the same samples in every epoch.
pub struct MiniBatchGenerator {
    data: BatchSource,
    indices: Tensor,
    mini_batch_size: i64,
    num_mini_batches: usize,
    num_epochs: usize,
    position: usize,
}

impl MiniBatchGenerator {
    pub(crate) fn new(
        source: BatchSource,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Self {
        let data = source.map(|t| t.flatten(0, 1));
        let batch_size = data.observations.size()[0];
        let mini_batch_size = batch_size / num_mini_batches.max(1) as i64;
        let indices = Tensor::randperm(
            num_mini_batches as i64 * mini_batch_size,
            (Kind::Int64, data.observations.device()),
        );

        Self {
            data,
            indices,
            mini_batch_size,
            num_mini_batches,
            num_epochs,
            position: 0,
        }
    }

    /// Number of samples in every minibatch
    pub fn mini_batch_size(&self) -> i64 {
        self.mini_batch_size
    }
}

impl Iterator for MiniBatchGenerator {
    type Item = MiniBatch;

    fn next(&mut self) -> Option<MiniBatch> {
        if self.position >= self.num_epochs * self.num_mini_batches {
            return None;
        }
        let i = (self.position % self.num_mini_batches) as i64;
        self.position += 1;

        let batch_idx = self
            .indices
            .narrow(0, i * self.mini_batch_size, self.mini_batch_size);
        let batch = self.data.map(|t| t.index_select(0, &batch_idx));

        Some(MiniBatch {
            observations: batch.observations,
            critic_observations: batch.critic_observations,
            actions: batch.actions,
            target_values: batch.values,
            advantages: batch.advantages,
            returns: batch.returns,
            old_actions_log_prob: batch.actions_log_prob,
            old_mu: batch.mu,
            old_sigma: batch.sigma,
            hidden_states: None,
            masks: None,
            expert_action_mean: batch.expert_action_mean,
            expert_action_sigma: batch.expert_action_sigma,
            rnd_state: batch.rnd_state,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.num_epochs * self.num_mini_batches).saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

/// Padded trajectory data consumed by [`RecurrentMiniBatchGenerator`].
pub(crate) struct PaddedTrajectories {
    pub observations: Tensor,
    pub critic_observations: Tensor,
    pub rnd_state: Option<Tensor>,
    pub masks: Tensor,
    /// `[time, instances]`, true where a new segment starts
    pub last_was_done: Tensor,
    /// Per memory tensor: `[num_segments, layers, hidden]` at segment starts
    pub hidden_actor: Option<Vec<Tensor>>,
    pub hidden_critic: Option<Vec<Tensor>>,
}

/// Minibatches of whole trajectories for recurrent policies.
///
/// Instances are split into contiguous groups (never shuffled) and every
/// segment started by a group's instances goes into that group's minibatch.
/// Groups can therefore carry different numbers of segments.
pub struct RecurrentMiniBatchGenerator {
    data: BatchSource,
    padded: PaddedTrajectories,
    mini_batch_size: i64,
    num_mini_batches: usize,
    num_epochs: usize,
    epoch: usize,
    index: usize,
    first_trajectory: i64,
}

impl RecurrentMiniBatchGenerator {
    pub(crate) fn new(
        data: BatchSource,
        padded: PaddedTrajectories,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Self {
        let num_envs = data.actions.size()[1];
        Self {
            data,
            padded,
            mini_batch_size: num_envs / num_mini_batches.max(1) as i64,
            num_mini_batches,
            num_epochs,
            epoch: 0,
            index: 0,
            first_trajectory: 0,
        }
    }

    /// Number of instances in every minibatch
    pub fn mini_batch_size(&self) -> i64 {
        self.mini_batch_size
    }
}

fn gather_segments(saved: &Option<Vec<Tensor>>, first: i64, count: i64) -> Option<RecurrentState> {
    let parts = saved
        .as_ref()?
        .iter()
        .map(|h| h.narrow(0, first, count).transpose(1, 0).contiguous())
        .collect();
    RecurrentState::from_parts(parts)
}

impl Iterator for RecurrentMiniBatchGenerator {
    type Item = MiniBatch;

    fn next(&mut self) -> Option<MiniBatch> {
        if self.epoch >= self.num_epochs || self.num_mini_batches == 0 {
            return None;
        }

        let start = self.index as i64 * self.mini_batch_size;
        let first = self.first_trajectory;
        let count = self
            .padded
            .last_was_done
            .narrow(1, start, self.mini_batch_size)
            .sum(Kind::Int64)
            .int64_value(&[]);

        let instances = self.data.map(|t| t.narrow(1, start, self.mini_batch_size));
        let segments = |t: &Tensor| t.narrow(1, first, count);

        let hidden_states = match (
            gather_segments(&self.padded.hidden_actor, first, count),
            gather_segments(&self.padded.hidden_critic, first, count),
        ) {
            (Some(actor), Some(critic)) => Some(HiddenStates::new(actor, critic)),
            _ => None,
        };

        let batch = MiniBatch {
            observations: segments(&self.padded.observations),
            critic_observations: segments(&self.padded.critic_observations),
            actions: instances.actions,
            target_values: instances.values,
            advantages: instances.advantages,
            returns: instances.returns,
            old_actions_log_prob: instances.actions_log_prob,
            old_mu: instances.mu,
            old_sigma: instances.sigma,
            hidden_states,
            masks: Some(segments(&self.padded.masks)),
            expert_action_mean: opt_shallow(&instances.expert_action_mean),
            expert_action_sigma: opt_shallow(&instances.expert_action_sigma),
            rnd_state: self.padded.rnd_state.as_ref().map(segments),
        };

        self.first_trajectory = first + count;
        self.index += 1;
        if self.index == self.num_mini_batches {
            self.index = 0;
            self.epoch += 1;
            self.first_trajectory = 0;
        }

        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let done = self.epoch * self.num_mini_batches + self.index;
        let remaining = (self.num_epochs * self.num_mini_batches).saturating_sub(done);
        (remaining, Some(remaining))
    }
}
