//! Preallocated time-major buffers shared by the rollout and replay stores.

use super::minibatch::{BatchSource, MiniBatchGenerator, PaddedTrajectories, RecurrentMiniBatchGenerator};
use super::trajectories::split_and_pad_trajectories;
use super::transition::{HiddenStates, Transition};
use crate::{ExtPpoError, Result};
use tch::{Device, Kind, Tensor};

/// Shapes and sizes of a store.
///
/// Optional shapes control which optional buffers are allocated. A field
/// without a buffer is dropped on append and reported as `None` downstream.
#[derive(Clone, Debug)]
pub struct StorageLayout {
    pub num_envs: usize,
    pub capacity: usize,
    pub obs_shape: Vec<i64>,
    pub privileged_obs_shape: Option<Vec<i64>>,
    pub actions_shape: Vec<i64>,
    pub rnd_state_shape: Option<Vec<i64>>,
    pub expert_action_mean_shape: Option<Vec<i64>>,
    pub expert_action_sigma_shape: Option<Vec<i64>>,
    pub device: Device,
}

impl StorageLayout {
    pub fn new(
        num_envs: usize,
        capacity: usize,
        obs_shape: &[i64],
        actions_shape: &[i64],
        device: Device,
    ) -> Self {
        Self {
            num_envs,
            capacity,
            obs_shape: obs_shape.to_vec(),
            privileged_obs_shape: None,
            actions_shape: actions_shape.to_vec(),
            rnd_state_shape: None,
            expert_action_mean_shape: None,
            expert_action_sigma_shape: None,
            device,
        }
    }

    pub fn with_privileged_obs(mut self, shape: Option<&[i64]>) -> Self {
        self.privileged_obs_shape = shape.map(<[i64]>::to_vec);
        self
    }

    pub fn with_rnd_state(mut self, shape: Option<&[i64]>) -> Self {
        self.rnd_state_shape = shape.map(<[i64]>::to_vec);
        self
    }

    pub fn with_expert_actions(mut self, mean: Option<&[i64]>, sigma: Option<&[i64]>) -> Self {
        self.expert_action_mean_shape = mean.map(<[i64]>::to_vec);
        self.expert_action_sigma_shape = sigma.map(<[i64]>::to_vec);
        self
    }

    /// Same layout with a different time length.
    pub fn with_capacity(&self, capacity: usize) -> Self {
        Self {
            capacity,
            ..self.clone()
        }
    }

    fn buffer_shape(&self, feature: &[i64]) -> Vec<i64> {
        let mut shape = vec![self.capacity as i64, self.num_envs as i64];
        shape.extend_from_slice(feature);
        shape
    }
}

/// Names of the per-step fields a store holds.
///
/// Used to select what is copied from a rollout into the replay ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageField {
    Observations,
    PrivilegedObservations,
    Actions,
    Rewards,
    Dones,
    Values,
    ActionsLogProb,
    ActionMean,
    ActionSigma,
    Returns,
    Advantages,
    RndState,
    ExpertActionMean,
    ExpertActionSigma,
    HiddenStates,
}

/// Saved memory, one `[capacity, layers, num_envs, hidden]` tensor per part.
pub(crate) struct SavedHiddenStates {
    pub actor: Vec<Tensor>,
    pub critic: Vec<Tensor>,
}

/// Field buffers plus the ring cursor.
pub struct TransitionBuffers {
    layout: StorageLayout,

    pub(crate) observations: Tensor,
    pub(crate) privileged_observations: Option<Tensor>,
    pub(crate) actions: Tensor,
    pub(crate) rewards: Tensor,
    pub(crate) dones: Tensor,
    pub(crate) values: Tensor,
    pub(crate) actions_log_prob: Tensor,
    pub(crate) mu: Tensor,
    pub(crate) sigma: Tensor,
    pub(crate) returns: Tensor,
    pub(crate) advantages: Tensor,

    pub(crate) rnd_state: Option<Tensor>,
    pub(crate) expert_action_mean: Option<Tensor>,
    pub(crate) expert_action_sigma: Option<Tensor>,

    // Allocated on the first append that carries memory
    pub(crate) hidden_states: Option<SavedHiddenStates>,

    pub(crate) step: usize,
    pub(crate) size: usize,
}

fn required<'a>(field: &'a Option<Tensor>, name: &'static str) -> Result<&'a Tensor> {
    field.as_ref().ok_or(ExtPpoError::MissingField(name))
}

impl TransitionBuffers {
    pub fn new(layout: StorageLayout) -> Self {
        let opts = (Kind::Float, layout.device);
        let zeros = |feature: &[i64]| Tensor::zeros(layout.buffer_shape(feature).as_slice(), opts);

        Self {
            observations: zeros(&layout.obs_shape),
            privileged_observations: layout.privileged_obs_shape.as_deref().map(zeros),
            actions: zeros(&layout.actions_shape),
            rewards: zeros(&[1]),
            dones: Tensor::zeros(layout.buffer_shape(&[1]).as_slice(), (Kind::Uint8, layout.device)),
            values: zeros(&[1]),
            actions_log_prob: zeros(&[1]),
            mu: zeros(&layout.actions_shape),
            sigma: zeros(&layout.actions_shape),
            returns: zeros(&[1]),
            advantages: zeros(&[1]),
            rnd_state: layout.rnd_state_shape.as_deref().map(zeros),
            expert_action_mean: layout.expert_action_mean_shape.as_deref().map(zeros),
            expert_action_sigma: layout.expert_action_sigma_shape.as_deref().map(zeros),
            hidden_states: None,
            step: 0,
            size: 0,
            layout,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn num_envs(&self) -> usize {
        self.layout.num_envs
    }

    /// Row the next append writes to
    pub fn step(&self) -> usize {
        self.step
    }

    /// Number of valid rows
    pub fn size(&self) -> usize {
        self.size
    }

    /// Every row holds data; a ring keeps overwriting its oldest rows
    pub fn is_full(&self) -> bool {
        self.size == self.layout.capacity
    }

    /// Write one transition at the cursor and advance it.
    pub fn append(&mut self, transition: &Transition) -> Result<()> {
        let row = self.step as i64;

        self.observations
            .get(row)
            .copy_(required(&transition.observations, "observations")?);
        if let Some(buffer) = &self.privileged_observations {
            buffer
                .get(row)
                .copy_(required(&transition.critic_observations, "critic_observations")?);
        }
        self.actions
            .get(row)
            .copy_(required(&transition.actions, "actions")?);
        self.rewards
            .get(row)
            .copy_(&required(&transition.rewards, "rewards")?.reshape([-1, 1]));
        self.dones
            .get(row)
            .copy_(&required(&transition.dones, "dones")?.reshape([-1, 1]));
        self.values
            .get(row)
            .copy_(&required(&transition.values, "values")?.reshape([-1, 1]));
        self.actions_log_prob
            .get(row)
            .copy_(&required(&transition.actions_log_prob, "actions_log_prob")?.reshape([-1, 1]));
        self.mu
            .get(row)
            .copy_(required(&transition.action_mean, "action_mean")?);
        self.sigma
            .get(row)
            .copy_(required(&transition.action_sigma, "action_sigma")?);

        if let Some(buffer) = &self.rnd_state {
            buffer
                .get(row)
                .copy_(required(&transition.rnd_state, "rnd_state")?);
        }
        if let (Some(buffer), Some(mean)) = (&self.expert_action_mean, &transition.expert_action_mean) {
            buffer.get(row).copy_(mean);
        }
        if let (Some(buffer), Some(sigma)) = (&self.expert_action_sigma, &transition.expert_action_sigma) {
            buffer.get(row).copy_(sigma);
        }
        if let Some(hidden) = &transition.hidden_states {
            self.save_hidden_states(row, hidden);
        }

        self.step = (self.step + 1) % self.layout.capacity;
        self.size = (self.size + 1).min(self.layout.capacity);
        Ok(())
    }

    fn save_hidden_states(&mut self, row: i64, hidden: &HiddenStates) {
        let actor = hidden.actor.to_parts();
        let critic = hidden.critic.to_parts();
        let capacity = self.layout.capacity as i64;

        let allocate = |parts: &[Tensor]| -> Vec<Tensor> {
            parts
                .iter()
                .map(|h| {
                    let mut shape = vec![capacity];
                    shape.extend(h.size());
                    Tensor::zeros(shape.as_slice(), (h.kind(), h.device()))
                })
                .collect()
        };
        let saved = self.hidden_states.get_or_insert_with(|| SavedHiddenStates {
            actor: allocate(&actor),
            critic: allocate(&critic),
        });

        for (buffer, h) in saved.actor.iter().zip(&actor) {
            buffer.get(row).copy_(&h.detach());
        }
        for (buffer, h) in saved.critic.iter().zip(&critic) {
            buffer.get(row).copy_(&h.detach());
        }
    }

    /// Buffer backing a field, `None` when the store does not hold it.
    pub(crate) fn field(&self, field: StorageField) -> Option<&Tensor> {
        match field {
            StorageField::Observations => Some(&self.observations),
            StorageField::PrivilegedObservations => self.privileged_observations.as_ref(),
            StorageField::Actions => Some(&self.actions),
            StorageField::Rewards => Some(&self.rewards),
            StorageField::Dones => Some(&self.dones),
            StorageField::Values => Some(&self.values),
            StorageField::ActionsLogProb => Some(&self.actions_log_prob),
            StorageField::ActionMean => Some(&self.mu),
            StorageField::ActionSigma => Some(&self.sigma),
            StorageField::Returns => Some(&self.returns),
            StorageField::Advantages => Some(&self.advantages),
            StorageField::RndState => self.rnd_state.as_ref(),
            StorageField::ExpertActionMean => self.expert_action_mean.as_ref(),
            StorageField::ExpertActionSigma => self.expert_action_sigma.as_ref(),
            StorageField::HiddenStates => None,
        }
    }

    /// Valid rows of a field.
    pub fn valid_rows(&self, field: StorageField) -> Option<Tensor> {
        self.field(field).map(|t| t.narrow(0, 0, self.size as i64))
    }

    /// Valid rows of the saved memory as `(actor, critic)` part lists.
    pub fn valid_hidden_states(&self) -> Option<(Vec<Tensor>, Vec<Tensor>)> {
        let size = self.size as i64;
        self.hidden_states.as_ref().map(|saved| {
            (
                saved.actor.iter().map(|h| h.narrow(0, 0, size)).collect(),
                saved.critic.iter().map(|h| h.narrow(0, 0, size)).collect(),
            )
        })
    }

    fn batch_source(&self) -> BatchSource {
        let size = self.size as i64;
        let valid = |t: &Tensor| t.narrow(0, 0, size);
        let observations = valid(&self.observations);
        let critic_observations = self
            .privileged_observations
            .as_ref()
            .map(valid)
            .unwrap_or_else(|| observations.shallow_clone());

        BatchSource {
            observations,
            critic_observations,
            actions: valid(&self.actions),
            values: valid(&self.values),
            advantages: valid(&self.advantages),
            returns: valid(&self.returns),
            actions_log_prob: valid(&self.actions_log_prob),
            mu: valid(&self.mu),
            sigma: valid(&self.sigma),
            expert_action_mean: self.expert_action_mean.as_ref().map(valid),
            expert_action_sigma: self.expert_action_sigma.as_ref().map(valid),
            rnd_state: self.rnd_state.as_ref().map(valid),
        }
    }

    /// Shuffled flat minibatches over the valid rows.
    pub fn mini_batch_generator(&self, num_mini_batches: usize, num_epochs: usize) -> MiniBatchGenerator {
        MiniBatchGenerator::new(self.batch_source(), num_mini_batches, num_epochs)
    }

    /// Trajectory minibatches over the valid rows.
    pub fn recurrent_mini_batch_generator(
        &self,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> RecurrentMiniBatchGenerator {
        let data = self.batch_source();
        let size = self.size as i64;
        let mut dones = self.dones.narrow(0, 0, size);
        // A wrapped ring stores its newest row right before its oldest one
        if self.is_full() && self.step != 0 {
            dones = dones.copy();
            let _ = dones.get(self.step as i64 - 1).fill_(1i64);
        }

        let (padded_obs, masks) = split_and_pad_trajectories(&data.observations, &dones);
        let padded_critic_obs = match &self.privileged_observations {
            Some(_) => split_and_pad_trajectories(&data.critic_observations, &dones).0,
            None => padded_obs.shallow_clone(),
        };
        let padded_rnd = data
            .rnd_state
            .as_ref()
            .map(|t| split_and_pad_trajectories(t, &dones).0);

        // Row 0 always starts a segment, row t starts one when row t - 1 was done
        let dones_bool = dones.squeeze_dim(-1).to_kind(Kind::Bool);
        let last_was_done = dones_bool.zeros_like();
        let _ = last_was_done.get(0).fill_(1i64);
        if size > 1 {
            last_was_done.narrow(0, 1, size - 1).copy_(&dones_bool.narrow(0, 0, size - 1));
        }

        // Segments are enumerated env-major, matching the padding order
        let segment_starts = last_was_done
            .transpose(1, 0)
            .reshape([-1])
            .nonzero()
            .squeeze_dim(1);
        let gather = |parts: &[Tensor]| -> Vec<Tensor> {
            parts
                .iter()
                .map(|h| {
                    h.narrow(0, 0, size)
                        .permute([2, 0, 1, 3])
                        .flatten(0, 1)
                        .index_select(0, &segment_starts)
                })
                .collect()
        };
        let (hidden_actor, hidden_critic) = match &self.hidden_states {
            Some(saved) => (Some(gather(&saved.actor)), Some(gather(&saved.critic))),
            None => (None, None),
        };

        let padded = PaddedTrajectories {
            observations: padded_obs,
            critic_observations: padded_critic_obs,
            rnd_state: padded_rnd,
            masks,
            last_was_done,
            hidden_actor,
            hidden_critic,
        };
        RecurrentMiniBatchGenerator::new(data, padded, num_mini_batches, num_epochs)
    }

    /// Reset the cursor without releasing memory.
    pub fn clear(&mut self) {
        self.step = 0;
        self.size = 0;
    }
}

impl std::fmt::Debug for TransitionBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionBuffers")
            .field("layout", &self.layout)
            .field("step", &self.step)
            .field("size", &self.size)
            .finish()
    }
}
