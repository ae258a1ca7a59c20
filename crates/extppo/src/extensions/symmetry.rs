//! Symmetry-based data augmentation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tch::Tensor;

/// Produces symmetric copies of observations and/or actions.
///
/// Outputs are `[batch * num_aug, ...]` with the original batch first.
/// `None` inputs produce `None` outputs. Critic observations are augmented
/// with `is_critic` set, since their layout may differ from the actor's.
pub trait SymmetryAugmentation {
    fn augment(
        &self,
        observations: Option<&Tensor>,
        actions: Option<&Tensor>,
        is_critic: bool,
    ) -> (Option<Tensor>, Option<Tensor>);
}

impl<F> SymmetryAugmentation for F
where
    F: Fn(Option<&Tensor>, Option<&Tensor>, bool) -> (Option<Tensor>, Option<Tensor>),
{
    fn augment(
        &self,
        observations: Option<&Tensor>,
        actions: Option<&Tensor>,
        is_critic: bool,
    ) -> (Option<Tensor>, Option<Tensor>) {
        self(observations, actions, is_critic)
    }
}

/// Two-fold augmentation that mirrors by flipping the sign of chosen
/// features.
///
/// Each sign vector holds `1.0` or `-1.0` per feature of the last axis.
pub struct SignFlipSymmetry {
    observation_signs: Tensor,
    critic_observation_signs: Tensor,
    action_signs: Tensor,
}

impl SignFlipSymmetry {
    pub fn new(observation_signs: &[f32], critic_observation_signs: &[f32], action_signs: &[f32]) -> Self {
        Self {
            observation_signs: Tensor::from_slice(observation_signs),
            critic_observation_signs: Tensor::from_slice(critic_observation_signs),
            action_signs: Tensor::from_slice(action_signs),
        }
    }

    fn mirror(x: &Tensor, signs: &Tensor) -> Tensor {
        let mirrored = x * signs.to_device(x.device());
        Tensor::cat(&[x.shallow_clone(), mirrored], 0)
    }
}

impl SymmetryAugmentation for SignFlipSymmetry {
    fn augment(
        &self,
        observations: Option<&Tensor>,
        actions: Option<&Tensor>,
        is_critic: bool,
    ) -> (Option<Tensor>, Option<Tensor>) {
        let obs_signs = if is_critic {
            &self.critic_observation_signs
        } else {
            &self.observation_signs
        };
        (
            observations.map(|obs| Self::mirror(obs, obs_signs)),
            actions.map(|actions| Self::mirror(actions, &self.action_signs)),
        )
    }
}

/// Augmentation functions by name, so configuration files can refer to them.
#[derive(Clone, Default)]
pub struct SymmetryRegistry {
    functions: HashMap<String, Arc<dyn SymmetryAugmentation>>,
}

impl SymmetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: impl SymmetryAugmentation + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn with(mut self, name: impl Into<String>, function: impl SymmetryAugmentation + 'static) -> Self {
        self.register(name, function);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn SymmetryAugmentation>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for SymmetryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}
