//! Random Network Distillation (RND)
//!
//! Based on "Exploration by Random Network Distillation"
//! (Burda et al., 2018)

use super::normalizer::EmpiricalNormalization;
use crate::policy::build_mlp;
use crate::training::{RndConfig, TorchOptimizer};
use crate::Result;
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// A frozen random target network and a predictor trained to match it.
///
/// States the predictor has not learned yet produce a large prediction error,
/// which is paid out as intrinsic reward.
pub struct RandomNetworkDistillation {
    predictor_vs: nn::VarStore,
    _target_vs: nn::VarStore,
    predictor: nn::Sequential,
    target: nn::Sequential,
    optimizer: TorchOptimizer,
    state_normalizer: Option<EmpiricalNormalization>,
    reward_normalizer: Option<EmpiricalNormalization>,
    num_states: i64,
    weight: f64,
    update_counter: u64,
}

impl RandomNetworkDistillation {
    pub fn new(config: &RndConfig, device: Device) -> Result<Self> {
        let predictor_vs = nn::VarStore::new(device);
        let predictor = build_mlp(
            &predictor_vs.root() / "predictor",
            config.num_states,
            &config.predictor_hidden_dims,
            config.num_outputs,
            config.activation,
        );

        let mut target_vs = nn::VarStore::new(device);
        let target = build_mlp(
            &target_vs.root() / "target",
            config.num_states,
            &config.target_hidden_dims,
            config.num_outputs,
            config.activation,
        );
        target_vs.freeze();

        let optimizer = TorchOptimizer::adam(&predictor_vs, config.learning_rate)?;

        Ok(Self {
            predictor_vs,
            _target_vs: target_vs,
            predictor,
            target,
            optimizer,
            state_normalizer: config
                .state_normalization
                .then(|| EmpiricalNormalization::with_epsilon(&[config.num_states], 1e-8, device)),
            reward_normalizer: config
                .reward_normalization
                .then(|| EmpiricalNormalization::with_epsilon(&[1], 1e-8, device)),
            num_states: config.num_states,
            weight: config.weight,
            update_counter: 0,
        })
    }

    pub fn num_states(&self) -> i64 {
        self.num_states
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.predictor_vs
    }

    /// Intrinsic reward for `rnd_state` (`[num_envs, num_states]`).
    ///
    /// Returns `(reward [num_envs], state)` where `state` is the input after
    /// normalization; that is what gets stored and trained on.
    pub fn get_intrinsic_reward(&mut self, rnd_state: &Tensor) -> (Tensor, Tensor) {
        self.update_counter += 1;
        let state = match self.state_normalizer.as_mut() {
            Some(normalizer) => normalizer.normalize(rnd_state),
            None => rnd_state.shallow_clone(),
        };

        let (target, predicted) = tch::no_grad(|| {
            (self.target.forward(&state), self.predictor.forward(&state))
        });
        let mut reward = (target - predicted)
            .pow_tensor_scalar(2.0)
            .sum_dim_intlist([1i64].as_slice(), false, Kind::Float)
            .sqrt();
        if let Some(normalizer) = self.reward_normalizer.as_mut() {
            reward = normalizer.scale(&reward.unsqueeze(-1)).squeeze_dim(-1);
        }

        (reward * self.weight, state)
    }

    /// Regression loss of the predictor on stored states
    pub fn loss(&self, rnd_state: &Tensor) -> Tensor {
        let predicted = self.predictor.forward(rnd_state);
        let target = self.target.forward(rnd_state).detach();
        predicted.mse_loss(&target, tch::Reduction::Mean)
    }

    /// One optimizer step on the predictor. Returns the loss before the step.
    pub fn train_step(&mut self, rnd_state: &Tensor) -> f64 {
        let loss = self.loss(rnd_state);
        self.optimizer.backward_step(&loss, None);
        loss.double_value(&[])
    }

    /// Intrinsic reward calls so far
    pub fn update_counter(&self) -> u64 {
        self.update_counter
    }

    pub fn train(&mut self, training: bool) {
        if let Some(normalizer) = self.state_normalizer.as_mut() {
            normalizer.train(training);
        }
        if let Some(normalizer) = self.reward_normalizer.as_mut() {
            normalizer.train(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RndConfig {
        RndConfig {
            num_states: 3,
            num_outputs: 4,
            predictor_hidden_dims: vec![16],
            target_hidden_dims: vec![16],
            weight: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_intrinsic_reward_shape() {
        let mut rnd = RandomNetworkDistillation::new(&config(), Device::Cpu).unwrap();
        let state = Tensor::randn([6, 3], (Kind::Float, Device::Cpu));
        let (reward, stored) = rnd.get_intrinsic_reward(&state);
        assert_eq!(reward.size(), [6]);
        assert!(stored.equal(&state));
        assert!(reward.min().double_value(&[]) >= 0.0);
        assert_eq!(rnd.update_counter(), 1);
    }

    #[test]
    fn test_predictor_learns_target() {
        let mut rnd = RandomNetworkDistillation::new(&config(), Device::Cpu).unwrap();
        let state = Tensor::randn([32, 3], (Kind::Float, Device::Cpu));

        let first = rnd.train_step(&state);
        let mut last = first;
        for _ in 0..200 {
            last = rnd.train_step(&state);
        }
        assert!(last < first);
    }

    #[test]
    fn test_state_normalization_changes_stored_state() {
        let mut rnd = RandomNetworkDistillation::new(
            &RndConfig {
                state_normalization: true,
                ..config()
            },
            Device::Cpu,
        )
        .unwrap();
        let state = Tensor::randn([8, 3], (Kind::Float, Device::Cpu)) * 10.0 + 5.0;
        let (_, stored) = rnd.get_intrinsic_reward(&state);
        assert!(stored.mean(Kind::Float).double_value(&[]).abs() < 1.0);
    }
}
