//! Recurrent Gaussian actor-critic.

use super::mlp::{build_mlp, MlpConfig};
use super::{ActorCritic, DiagGaussian, HasVarStore};
use crate::storage::{unpad_trajectories, HiddenStates, RecurrentState};
use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, nn::RNN, Device, Kind, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RnnType {
    Lstm,
    Gru,
}

/// Configuration for recurrent actor-critic
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrentConfig {
    pub rnn_type: RnnType,
    pub rnn_hidden_size: i64,
    pub rnn_num_layers: i64,
    /// Heads on top of the memory output
    pub mlp: MlpConfig,
}

impl Default for RecurrentConfig {
    fn default() -> Self {
        Self {
            rnn_type: RnnType::Lstm,
            rnn_hidden_size: 256,
            rnn_num_layers: 1,
            mlp: MlpConfig::default(),
        }
    }
}

enum RnnModule {
    Lstm(nn::LSTM),
    Gru(nn::GRU),
}

/// Time-major memory with per-instance state for rollouts.
struct Memory {
    rnn: RnnModule,
    hidden_size: i64,
    num_layers: i64,
    device: Device,
    state: Option<RecurrentState>,
}

impl Memory {
    fn new(path: nn::Path, input_size: i64, config: &RecurrentConfig, device: Device) -> Self {
        let rnn_config = nn::RNNConfig {
            num_layers: config.rnn_num_layers,
            batch_first: false,
            ..Default::default()
        };
        let rnn = match config.rnn_type {
            RnnType::Lstm => RnnModule::Lstm(nn::lstm(
                &path / "rnn",
                input_size,
                config.rnn_hidden_size,
                rnn_config,
            )),
            RnnType::Gru => RnnModule::Gru(nn::gru(
                &path / "rnn",
                input_size,
                config.rnn_hidden_size,
                rnn_config,
            )),
        };

        Self {
            rnn,
            hidden_size: config.rnn_hidden_size,
            num_layers: config.rnn_num_layers,
            device,
            state: None,
        }
    }

    fn zeros(&self, batch_size: i64) -> RecurrentState {
        let zeros = || {
            Tensor::zeros(
                [self.num_layers, batch_size, self.hidden_size],
                (Kind::Float, self.device),
            )
        };
        match self.rnn {
            RnnModule::Lstm(_) => RecurrentState::Pair(zeros(), zeros()),
            RnnModule::Gru(_) => RecurrentState::Single(zeros()),
        }
    }

    /// Run `[time, batch, features]` input from `state`.
    fn run(&self, input: &Tensor, state: Option<&RecurrentState>) -> (Tensor, RecurrentState) {
        let batch_size = input.size()[1];
        match (&self.rnn, state) {
            (RnnModule::Lstm(lstm), Some(RecurrentState::Pair(h, c))) => {
                let state = nn::LSTMState((h.shallow_clone(), c.shallow_clone()));
                let (output, next) = lstm.seq_init(input, &state);
                let (h, c) = next.0;
                (output, RecurrentState::Pair(h, c))
            }
            (RnnModule::Gru(gru), Some(RecurrentState::Single(h))) => {
                let (output, next) = gru.seq_init(input, &nn::GRUState(h.shallow_clone()));
                (output, RecurrentState::Single(next.0))
            }
            // Missing or mismatched state starts from zeros
            _ => {
                let zeros = self.zeros(batch_size);
                self.run(input, Some(&zeros))
            }
        }
    }

    /// Batch mode with `masks`: padded trajectories in, unpadded outputs out.
    /// Rollout mode otherwise: one step `[batch, features]` advancing the stored state.
    fn forward(
        &mut self,
        input: &Tensor,
        masks: Option<&Tensor>,
        hidden: Option<&RecurrentState>,
    ) -> Tensor {
        match masks {
            Some(masks) => {
                let (output, _) = self.run(input, hidden);
                unpad_trajectories(&output, masks)
            }
            None => {
                let (output, next) = self.run(&input.unsqueeze(0), self.state.as_ref());
                self.state = Some(next.detach_copy());
                output.squeeze_dim(0)
            }
        }
    }

    fn reset(&mut self, dones: &Tensor) {
        if let Some(state) = &self.state {
            let keep = 1.0 - &dones.to_kind(Kind::Float).reshape([1, -1, 1]);
            let parts = state.to_parts().iter().map(|h| h * &keep).collect();
            self.state = RecurrentState::from_parts(parts);
        }
    }
}

/// LSTM or GRU memory for actor and critic, each feeding an MLP head.
pub struct RecurrentActorCritic {
    vs: nn::VarStore,
    actor_memory: Memory,
    critic_memory: Memory,
    actor: nn::Sequential,
    critic: nn::Sequential,
    std: Tensor,
    device: Device,
}

impl RecurrentActorCritic {
    pub fn new(
        num_actor_obs: i64,
        num_critic_obs: i64,
        num_actions: i64,
        config: RecurrentConfig,
        device: Device,
    ) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let actor_memory = Memory::new(&root / "memory_a", num_actor_obs, &config, device);
        let critic_memory = Memory::new(&root / "memory_c", num_critic_obs, &config, device);
        let actor = build_mlp(
            &root / "actor",
            config.rnn_hidden_size,
            &config.mlp.actor_hidden_dims,
            num_actions,
            config.mlp.activation,
        );
        let critic = build_mlp(
            &root / "critic",
            config.rnn_hidden_size,
            &config.mlp.critic_hidden_dims,
            1,
            config.mlp.activation,
        );
        let std = root.var(
            "std",
            &[num_actions],
            nn::Init::Const(config.mlp.init_noise_std),
        );

        Self {
            vs,
            actor_memory,
            critic_memory,
            actor,
            critic,
            std,
            device,
        }
    }
}

impl HasVarStore for RecurrentActorCritic {
    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

impl ActorCritic for RecurrentActorCritic {
    fn is_recurrent(&self) -> bool {
        true
    }

    fn act(
        &mut self,
        observations: &Tensor,
        masks: Option<&Tensor>,
        hidden: Option<&RecurrentState>,
    ) -> DiagGaussian {
        let obs = observations.to_device(self.device);
        let latent = self.actor_memory.forward(&obs, masks, hidden);
        let mean = self.actor.forward(&latent);
        let std = self.std.expand_as(&mean);
        DiagGaussian::new(mean, std)
    }

    fn act_inference(&mut self, observations: &Tensor) -> Tensor {
        let obs = observations.to_device(self.device);
        let latent = self.actor_memory.forward(&obs, None, None);
        self.actor.forward(&latent)
    }

    fn evaluate(
        &mut self,
        critic_observations: &Tensor,
        masks: Option<&Tensor>,
        hidden: Option<&RecurrentState>,
    ) -> Tensor {
        let obs = critic_observations.to_device(self.device);
        let latent = self.critic_memory.forward(&obs, masks, hidden);
        self.critic.forward(&latent)
    }

    fn reset(&mut self, dones: &Tensor) {
        self.actor_memory.reset(dones);
        self.critic_memory.reset(dones);
    }

    fn hidden_states(&self) -> Option<HiddenStates> {
        match (&self.actor_memory.state, &self.critic_memory.state) {
            (Some(actor), Some(critic)) => Some(HiddenStates::new(actor.clone(), critic.clone())),
            _ => None,
        }
    }
}
