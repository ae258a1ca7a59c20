//! Core environment trait definitions.

use tch::Tensor;

/// Extra signals returned from a batched environment step
#[derive(Debug, Default)]
pub struct StepInfo {
    /// Instances cut off by a time limit rather than a terminal state, `[num_envs]`
    pub time_outs: Option<Tensor>,
    /// Input state for random network distillation, `[num_envs, num_states]`
    pub rnd_state: Option<Tensor>,
}

impl StepInfo {
    /// Create empty info
    pub fn new() -> Self {
        Self::default()
    }

    /// Add time-out flags
    pub fn with_time_outs(mut self, time_outs: Tensor) -> Self {
        self.time_outs = Some(time_outs);
        self
    }

    /// Add the distillation state
    pub fn with_rnd_state(mut self, rnd_state: Tensor) -> Self {
        self.rnd_state = Some(rnd_state);
        self
    }
}

/// Result from one step of every instance
#[derive(Debug)]
pub struct EnvStep {
    /// Observations after the step, `[num_envs, ...]`
    pub observations: Tensor,
    /// Privileged observations for the critic, if the environment has any
    pub critic_observations: Option<Tensor>,
    /// Rewards received, `[num_envs]`
    pub rewards: Tensor,
    /// Episode ended (terminated or timed out), `[num_envs]`
    pub dones: Tensor,
    /// Additional info
    pub info: StepInfo,
}

impl EnvStep {
    /// Critic observations, falling back to the actor observations
    pub fn critic_observations(&self) -> Tensor {
        self.critic_observations
            .as_ref()
            .unwrap_or(&self.observations)
            .shallow_clone()
    }
}

/// Core trait for batched environments.
///
/// Every call steps all `num_envs` instances at once. Instances reset
/// themselves when their episode ends; the observation returned for such an
/// instance is the first of its next episode.
///
/// # Example
///
/// ```rust,ignore
/// use extppo::env::{EnvStep, StepInfo, VecEnv};
///
/// struct Drift {
///     state: Tensor,
/// }
///
/// impl VecEnv for Drift {
///     fn num_envs(&self) -> usize { 16 }
///     fn num_obs(&self) -> i64 { 1 }
///     fn num_actions(&self) -> i64 { 1 }
///
///     fn reset(&mut self) -> (Tensor, Option<Tensor>) {
///         self.state = Tensor::zeros([16, 1], (Kind::Float, Device::Cpu));
///         (self.state.shallow_clone(), None)
///     }
///
///     fn step(&mut self, actions: &Tensor) -> EnvStep {
///         // ... implement step logic
///     }
/// }
/// ```
pub trait VecEnv {
    /// Number of simulated instances
    fn num_envs(&self) -> usize;

    /// Width of the actor observation
    fn num_obs(&self) -> i64;

    /// Width of the critic observation, `None` when it equals the actor's
    fn num_privileged_obs(&self) -> Option<i64> {
        None
    }

    /// Width of the action
    fn num_actions(&self) -> i64;

    /// Reset every instance
    ///
    /// # Returns
    /// Tuple of (observations, critic observations)
    fn reset(&mut self) -> (Tensor, Option<Tensor>);

    /// Apply `actions` (`[num_envs, num_actions]`) to every instance
    fn step(&mut self, actions: &Tensor) -> EnvStep;
}
