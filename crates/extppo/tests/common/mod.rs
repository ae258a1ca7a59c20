//! Toy environment and experts shared by the integration tests and the demo.

#![allow(dead_code)]

use extppo::env::{EnvStep, StepInfo, VecEnv};
use extppo::extensions::Expert;
use extppo::training::Extensions;
use tch::{Device, Kind, Tensor};

/// Point masses on a plane, pushed towards the origin.
///
/// Observations are position and velocity. The critic additionally sees the
/// episode progress. Episodes end when a mass leaves the radius-3 disc
/// (terminal) or after `max_episode_length` steps (time out).
pub struct PointMass {
    num_envs: usize,
    max_episode_length: f64,
    position: Tensor,
    velocity: Tensor,
    episode_length: Tensor,
    device: Device,
}

impl PointMass {
    pub fn new(num_envs: usize, max_episode_length: usize, device: Device) -> Self {
        let n = num_envs as i64;
        Self {
            num_envs,
            max_episode_length: max_episode_length as f64,
            position: Tensor::zeros([n, 2], (Kind::Float, device)),
            velocity: Tensor::zeros([n, 2], (Kind::Float, device)),
            episode_length: Tensor::zeros([n], (Kind::Float, device)),
            device,
        }
    }

    fn observations(&self) -> Tensor {
        Tensor::cat(&[&self.position, &self.velocity], 1)
    }

    fn critic_observations(&self) -> Tensor {
        let progress = (&self.episode_length / self.max_episode_length).unsqueeze(1);
        Tensor::cat(&[&self.position, &self.velocity, &progress], 1)
    }

    fn spawn(&self) -> Tensor {
        Tensor::rand([self.num_envs as i64, 2], (Kind::Float, self.device)) * 2.0 - 1.0
    }
}

impl VecEnv for PointMass {
    fn num_envs(&self) -> usize {
        self.num_envs
    }

    fn num_obs(&self) -> i64 {
        4
    }

    fn num_privileged_obs(&self) -> Option<i64> {
        Some(5)
    }

    fn num_actions(&self) -> i64 {
        2
    }

    fn reset(&mut self) -> (Tensor, Option<Tensor>) {
        self.position = self.spawn();
        self.velocity = self.velocity.zeros_like();
        self.episode_length = self.episode_length.zeros_like();
        (self.observations(), Some(self.critic_observations()))
    }

    fn step(&mut self, actions: &Tensor) -> EnvStep {
        let force = actions.to_device(self.device).clamp(-1.0, 1.0);
        self.velocity = &self.velocity * 0.9 + force * 0.1;
        self.position = &self.position + &self.velocity * 0.1;
        self.episode_length = &self.episode_length + 1.0;

        let distance = self
            .position
            .pow_tensor_scalar(2.0)
            .sum_dim_intlist([1i64].as_slice(), false, Kind::Float);
        let rewards = -&distance;
        let terminated = distance.gt(9.0).to_kind(Kind::Float);
        let time_outs = self
            .episode_length
            .ge(self.max_episode_length)
            .to_kind(Kind::Float);
        let dones = (&terminated + &time_outs).clamp_max(1.0);

        // Finished instances start over
        let keep = (1.0f64 - &dones).unsqueeze(1);
        self.position = &self.position * &keep + self.spawn() * (1.0 - &keep);
        self.velocity = &self.velocity * &keep;
        self.episode_length = &self.episode_length * keep.squeeze_dim(1);

        let observations = self.observations();
        EnvStep {
            critic_observations: Some(self.critic_observations()),
            rewards,
            dones,
            info: StepInfo::new()
                .with_time_outs(time_outs)
                .with_rnd_state(observations.narrow(1, 0, 2)),
            observations,
        }
    }
}

/// Expert that always answers the same action.
pub struct ConstantExpert {
    pub action: f64,
    pub num_actions: i64,
}

impl Expert for ConstantExpert {
    fn act_inference(&self, observations: &Tensor) -> extppo::Result<Tensor> {
        Ok(Tensor::full(
            [observations.size()[0], self.num_actions],
            self.action,
            (Kind::Float, observations.device()),
        ))
    }

    fn actions_log_prob(&self, actions: &Tensor) -> extppo::Result<Tensor> {
        Ok(actions.abs() * 0.1 + 0.05)
    }
}

/// Extensions with a `"constant"` loader reading the action from the path.
pub fn constant_experts() -> Extensions {
    Extensions::new().with_expert_loader("constant", |path: &str, _device: Device| {
        let action = path
            .parse::<f64>()
            .map_err(|e| extppo::ExtPpoError::Config(format!("bad constant expert {}: {}", path, e)))?;
        let expert: Box<dyn Expert> = Box::new(ConstantExpert {
            action,
            num_actions: 2,
        });
        Ok(expert)
    })
}
