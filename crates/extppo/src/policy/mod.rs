//! Actor-critic policies.
//!
//! The learning algorithm only talks to [`ActorCritic`]. Two reference
//! implementations are provided:
//! - `MlpActorCritic` - feed-forward actor and critic
//! - `RecurrentActorCritic` - LSTM/GRU memory feeding MLP heads

mod distribution;
mod mlp;
mod recurrent;

pub use distribution::DiagGaussian;
pub use mlp::{Activation, MlpActorCritic, MlpConfig};
pub(crate) use mlp::build_mlp;
pub use recurrent::{RecurrentActorCritic, RecurrentConfig, RnnType};

use crate::storage::{HiddenStates, RecurrentState};
use tch::{nn, Tensor};

/// Trait for policies that have a VarStore for optimization
pub trait HasVarStore {
    /// Get mutable reference to the VarStore
    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Get reference to the VarStore
    fn var_store(&self) -> &nn::VarStore;
}

/// Policy and value function trained by the algorithm.
///
/// Without `masks` the calls run in rollout mode: one step for every
/// instance, advancing any internal memory. With `masks` (recurrent only)
/// the input is padded trajectories `[time, segments, ...]` starting from
/// `hidden`, and outputs come back as `[time, instances, ...]`.
pub trait ActorCritic: HasVarStore {
    fn is_recurrent(&self) -> bool;

    /// Action distribution for `observations`
    fn act(
        &mut self,
        observations: &Tensor,
        masks: Option<&Tensor>,
        hidden: Option<&RecurrentState>,
    ) -> DiagGaussian;

    /// Deterministic action (the mean)
    fn act_inference(&mut self, observations: &Tensor) -> Tensor;

    /// Value estimate, trailing dimension 1
    fn evaluate(
        &mut self,
        critic_observations: &Tensor,
        masks: Option<&Tensor>,
        hidden: Option<&RecurrentState>,
    ) -> Tensor;

    /// Clear memory of instances whose episode ended
    fn reset(&mut self, dones: &Tensor);

    /// Memory before the next rollout step, `None` for feed-forward policies
    fn hidden_states(&self) -> Option<HiddenStates>;
}
