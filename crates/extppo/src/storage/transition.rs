//! One timestep of data for every parallel instance.

use tch::Tensor;

/// Recurrent state of a single memory module.
///
/// GRU memories carry one tensor, LSTM memories carry `(h, c)`. Each tensor is
/// shaped `[num_layers, batch, hidden_size]`.
pub enum RecurrentState {
    Single(Tensor),
    Pair(Tensor, Tensor),
}

impl RecurrentState {
    /// Flatten into the uniform list representation used by the stores.
    pub fn to_parts(&self) -> Vec<Tensor> {
        match self {
            RecurrentState::Single(h) => vec![h.shallow_clone()],
            RecurrentState::Pair(h, c) => vec![h.shallow_clone(), c.shallow_clone()],
        }
    }

    /// Rebuild from the list representation. Anything but one or two tensors is rejected.
    pub fn from_parts(mut parts: Vec<Tensor>) -> Option<Self> {
        match parts.len() {
            1 => parts.pop().map(RecurrentState::Single),
            2 => {
                let c = parts.pop()?;
                let h = parts.pop()?;
                Some(RecurrentState::Pair(h, c))
            }
            _ => None,
        }
    }

    /// Detached deep copy, safe to keep across optimizer steps.
    pub fn detach_copy(&self) -> Self {
        match self {
            RecurrentState::Single(h) => RecurrentState::Single(h.detach().copy()),
            RecurrentState::Pair(h, c) => {
                RecurrentState::Pair(h.detach().copy(), c.detach().copy())
            }
        }
    }
}

impl Clone for RecurrentState {
    fn clone(&self) -> Self {
        match self {
            RecurrentState::Single(h) => RecurrentState::Single(h.shallow_clone()),
            RecurrentState::Pair(h, c) => RecurrentState::Pair(h.shallow_clone(), c.shallow_clone()),
        }
    }
}

impl std::fmt::Debug for RecurrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecurrentState::Single(h) => f.debug_tuple("Single").field(&h.size()).finish(),
            RecurrentState::Pair(h, c) => f
                .debug_tuple("Pair")
                .field(&h.size())
                .field(&c.size())
                .finish(),
        }
    }
}

/// Actor and critic memory states of a recurrent actor-critic.
#[derive(Clone, Debug)]
pub struct HiddenStates {
    pub actor: RecurrentState,
    pub critic: RecurrentState,
}

impl HiddenStates {
    pub fn new(actor: RecurrentState, critic: RecurrentState) -> Self {
        Self { actor, critic }
    }
}

/// Data recorded for one environment step across all instances.
///
/// Populated field by field by the algorithm, consumed by a store's append
/// and then cleared.
#[derive(Default)]
pub struct Transition {
    pub observations: Option<Tensor>,
    pub critic_observations: Option<Tensor>,
    pub actions: Option<Tensor>,
    pub rewards: Option<Tensor>,
    pub dones: Option<Tensor>,

    // Policy-gradient statistics
    pub values: Option<Tensor>,
    pub actions_log_prob: Option<Tensor>,
    pub action_mean: Option<Tensor>,
    pub action_sigma: Option<Tensor>,

    // Recurrent policies
    pub hidden_states: Option<HiddenStates>,

    // Random network distillation
    pub rnd_state: Option<Tensor>,

    // Behavior cloning targets
    pub expert_action_mean: Option<Tensor>,
    pub expert_action_sigma: Option<Tensor>,
}

impl Transition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every field to empty.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
