//! Feed-forward Gaussian actor-critic.

use super::{ActorCritic, DiagGaussian, HasVarStore};
use crate::storage::{HiddenStates, RecurrentState};
use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Device, Tensor};

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    ReLU,
    Elu,
    Tanh,
    Gelu,
}

/// Configuration for MLP actor-critic
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    /// Hidden layer sizes of the actor
    pub actor_hidden_dims: Vec<i64>,
    /// Hidden layer sizes of the critic
    pub critic_hidden_dims: Vec<i64>,
    pub activation: Activation,
    /// Initial action standard deviation
    pub init_noise_std: f64,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            actor_hidden_dims: vec![256, 256, 256],
            critic_hidden_dims: vec![256, 256, 256],
            activation: Activation::Elu,
            init_noise_std: 1.0,
        }
    }
}

/// Stack of linear layers with `activation` between them and a linear output.
pub(crate) fn build_mlp(
    path: nn::Path,
    in_size: i64,
    hidden_dims: &[i64],
    out_size: i64,
    activation: Activation,
) -> nn::Sequential {
    let mut net = nn::seq();
    let mut in_size = in_size;

    for (i, &hidden) in hidden_dims.iter().enumerate() {
        net = net.add(nn::linear(
            &path / format!("layer_{}", i),
            in_size,
            hidden,
            Default::default(),
        ));
        net = match activation {
            Activation::ReLU => net.add_fn(|x| x.relu()),
            Activation::Elu => net.add_fn(|x| x.elu()),
            Activation::Tanh => net.add_fn(|x| x.tanh()),
            Activation::Gelu => net.add_fn(|x| x.gelu("none")),
        };
        in_size = hidden;
    }

    net.add(nn::linear(&path / "out", in_size, out_size, Default::default()))
}

/// MLP actor and critic with a state-independent learned action std.
pub struct MlpActorCritic {
    vs: nn::VarStore,
    actor: nn::Sequential,
    critic: nn::Sequential,
    std: Tensor,
    device: Device,
}

impl MlpActorCritic {
    pub fn new(
        num_actor_obs: i64,
        num_critic_obs: i64,
        num_actions: i64,
        config: MlpConfig,
        device: Device,
    ) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let actor = build_mlp(
            &root / "actor",
            num_actor_obs,
            &config.actor_hidden_dims,
            num_actions,
            config.activation,
        );
        let critic = build_mlp(
            &root / "critic",
            num_critic_obs,
            &config.critic_hidden_dims,
            1,
            config.activation,
        );
        let std = root.var("std", &[num_actions], nn::Init::Const(config.init_noise_std));

        Self {
            vs,
            actor,
            critic,
            std,
            device,
        }
    }

    pub fn num_parameters(&self) -> i64 {
        self.vs.variables().values().map(|v| v.numel() as i64).sum()
    }
}

impl HasVarStore for MlpActorCritic {
    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

impl ActorCritic for MlpActorCritic {
    fn is_recurrent(&self) -> bool {
        false
    }

    fn act(
        &mut self,
        observations: &Tensor,
        _masks: Option<&Tensor>,
        _hidden: Option<&RecurrentState>,
    ) -> DiagGaussian {
        let mean = self.actor.forward(&observations.to_device(self.device));
        let std = self.std.expand_as(&mean);
        DiagGaussian::new(mean, std)
    }

    fn act_inference(&mut self, observations: &Tensor) -> Tensor {
        self.actor.forward(&observations.to_device(self.device))
    }

    fn evaluate(
        &mut self,
        critic_observations: &Tensor,
        _masks: Option<&Tensor>,
        _hidden: Option<&RecurrentState>,
    ) -> Tensor {
        self.critic
            .forward(&critic_observations.to_device(self.device))
    }

    fn reset(&mut self, _dones: &Tensor) {}

    fn hidden_states(&self) -> Option<HiddenStates> {
        None
    }
}
