//! Extensible PPO: clipped-surrogate PPO with optional behavior cloning,
//! random network distillation, symmetry augmentation and an offline
//! fine-tuning stage.

use super::config::{BehaviorCloningConfig, PpoConfig, SymmetryConfig};
use super::offline::OfflineSchedule;
use super::optimizer::TorchOptimizer;
use super::ppo::{adapt_learning_rate, mse, surrogate_loss, value_loss};
use super::stats::UpdateStats;
use crate::env::StepInfo;
use crate::extensions::{
    Expert, ExpertEnsemble, ExpertEnvMapping, ExpertLoaderRegistry, ExpertObservationFn,
    RandomNetworkDistillation, SymmetryAugmentation, SymmetryRegistry,
};
use crate::policy::{ActorCritic, DiagGaussian};
use crate::storage::{MiniBatch, ReplayStorage, RolloutStatistics, RolloutStorage, StorageLayout, Transition};
use crate::{ExtPpoError, Result};
use std::sync::Arc;
use tch::{Device, Kind, Tensor};
use tracing::{debug, info, warn};

/// Runtime hooks that cannot live in a configuration file.
///
/// Closures capture whatever simulation handle they need; the algorithm never
/// owns the simulation.
#[derive(Clone, Default)]
pub struct Extensions {
    /// Augmentation functions referenced by `SymmetryConfig::data_augmentation_func`
    pub symmetry_registry: SymmetryRegistry,
    /// Loaders referenced by `BehaviorCloningConfig::experts_loader`
    pub expert_loaders: ExpertLoaderRegistry,
    pub online_expert_mapping: Option<ExpertEnvMapping>,
    pub offline_expert_mapping: Option<ExpertEnvMapping>,
    pub online_expert_observations: Option<ExpertObservationFn>,
    pub offline_expert_observations: Option<ExpertObservationFn>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symmetry(mut self, name: impl Into<String>, function: impl SymmetryAugmentation + 'static) -> Self {
        self.symmetry_registry.register(name, function);
        self
    }

    pub fn with_expert_loader<F>(mut self, name: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&str, Device) -> Result<Box<dyn Expert>> + 'static,
    {
        self.expert_loaders.register(name, loader);
        self
    }

    pub fn with_online_mapping(mut self, mapping: ExpertEnvMapping) -> Self {
        self.online_expert_mapping = Some(mapping);
        self
    }

    pub fn with_offline_mapping(mut self, mapping: ExpertEnvMapping) -> Self {
        self.offline_expert_mapping = Some(mapping);
        self
    }

    pub fn with_online_observations(mut self, f: impl Fn(&Tensor) -> Tensor + 'static) -> Self {
        self.online_expert_observations = Some(Arc::new(f));
        self
    }

    pub fn with_offline_observations(mut self, f: impl Fn(&Tensor) -> Tensor + 'static) -> Self {
        self.offline_expert_observations = Some(Arc::new(f));
        self
    }
}

/// Experts of one cloning stage and its decaying loss weight.
pub(super) struct CloningStage {
    pub(super) experts: ExpertEnsemble,
    loss_coeff: f64,
    decay: f64,
}

impl CloningStage {
    fn load(
        stage: &'static str,
        config: &BehaviorCloningConfig,
        loaders: &ExpertLoaderRegistry,
        mapping: Option<ExpertEnvMapping>,
        observation_fn: Option<ExpertObservationFn>,
        device: Device,
    ) -> Result<Self> {
        let experts = ExpertEnsemble::load(stage, config, loaders, mapping, observation_fn, device)?;
        Ok(Self {
            experts,
            loss_coeff: config.cloning_loss_coeff,
            decay: config.loss_decay,
        })
    }

    pub(super) fn learn_std(&self) -> bool {
        self.experts.learn_std()
    }

    pub(super) fn loss_coeff(&self) -> f64 {
        self.loss_coeff
    }

    /// Apply one decay step and return the new coefficient.
    pub(super) fn decay(&mut self) -> f64 {
        self.loss_coeff *= self.decay;
        self.loss_coeff
    }
}

struct SymmetryStage {
    function: Arc<dyn SymmetryAugmentation>,
    use_data_augmentation: bool,
    use_mirror_loss: bool,
    mirror_loss_coeff: f64,
}

impl SymmetryStage {
    fn resolve(config: &SymmetryConfig, registry: &SymmetryRegistry) -> Result<Self> {
        if !config.use_data_augmentation && !config.use_mirror_loss {
            warn!("Symmetry not used for learning, the symmetry loss is only logged");
        }
        let function = config
            .data_augmentation_func
            .as_deref()
            .and_then(|name| registry.resolve(name))
            .ok_or_else(|| ExtPpoError::AugmentationNotCallable(config.data_augmentation_func.clone()))?;
        Ok(Self {
            function,
            use_data_augmentation: config.use_data_augmentation,
            use_mirror_loss: config.use_mirror_loss,
            mirror_loss_coeff: config.mirror_loss_coeff,
        })
    }
}

fn augmented(tensor: Option<Tensor>, what: &str) -> Result<Tensor> {
    tensor.ok_or_else(|| ExtPpoError::Config(format!("symmetry augmentation returned no {}", what)))
}

/// Losses of one minibatch step
struct StepLosses {
    value: f64,
    surrogate: f64,
    entropy: f64,
    bc: Option<f64>,
    rnd: Option<f64>,
    symmetry: Option<f64>,
}

fn accumulate(total: &mut Option<f64>, value: Option<f64>) {
    if let Some(value) = value {
        *total = Some(total.unwrap_or(0.0) + value);
    }
}

/// PPO learner driving one actor-critic.
///
/// Call order per iteration: `act` and `process_env_step` once per
/// environment step, then `compute_returns` and `update` once the rollout
/// window is full. `init_storage` must run before the first `act`.
pub struct ExtensiblePpo<P: ActorCritic> {
    pub(super) policy: P,
    pub(super) optimizer: TorchOptimizer,
    pub(super) config: PpoConfig,
    pub(super) learning_rate: f64,

    transition: Transition,
    pub(super) storage: Option<RolloutStorage>,
    pub(super) replay: Option<ReplayStorage>,

    bc: Option<CloningStage>,
    pub(super) offline_bc: Option<CloningStage>,
    rnd: Option<RandomNetworkDistillation>,
    symmetry: Option<SymmetryStage>,
    pub(super) offline: Option<OfflineSchedule>,
}

impl<P: ActorCritic> ExtensiblePpo<P> {
    /// Validate `config`, load experts and resolve hooks from `extensions`.
    pub fn new(policy: P, config: PpoConfig, extensions: Extensions) -> Result<Self> {
        config.validate()?;
        config.validate_for_policy(policy.is_recurrent())?;
        let device = config.device;

        let bc = config
            .behavior_cloning
            .as_ref()
            .map(|bc| {
                CloningStage::load(
                    "online",
                    bc,
                    &extensions.expert_loaders,
                    extensions.online_expert_mapping.clone(),
                    extensions.online_expert_observations.clone(),
                    device,
                )
            })
            .transpose()?;
        let offline_bc = config
            .offline
            .as_ref()
            .and_then(|offline| offline.behavior_cloning.as_ref())
            .map(|bc| {
                CloningStage::load(
                    "offline",
                    bc,
                    &extensions.expert_loaders,
                    extensions.offline_expert_mapping.clone(),
                    extensions.offline_expert_observations.clone(),
                    device,
                )
            })
            .transpose()?;
        let rnd = config
            .rnd
            .as_ref()
            .map(|rnd| RandomNetworkDistillation::new(rnd, device))
            .transpose()?;
        let symmetry = config
            .symmetry
            .as_ref()
            .map(|symmetry| SymmetryStage::resolve(symmetry, &extensions.symmetry_registry))
            .transpose()?;
        let offline = config.offline.as_ref().map(OfflineSchedule::new);

        let optimizer = TorchOptimizer::adam(policy.var_store(), config.learning_rate)?;

        info!(
            recurrent = policy.is_recurrent(),
            behavior_cloning = bc.is_some(),
            offline_behavior_cloning = offline_bc.is_some(),
            rnd = rnd.is_some(),
            symmetry = symmetry.is_some(),
            offline = offline.is_some(),
            learning_rate = config.learning_rate,
            "Extensible PPO initialized"
        );

        Ok(Self {
            policy,
            optimizer,
            learning_rate: config.learning_rate,
            config,
            transition: Transition::new(),
            storage: None,
            replay: None,
            bc,
            offline_bc,
            rnd,
            symmetry,
            offline,
        })
    }

    /// Allocate the rollout store, and the replay store when the offline
    /// stage is configured.
    pub fn init_storage(
        &mut self,
        num_envs: usize,
        num_transitions_per_env: usize,
        actor_obs_shape: &[i64],
        critic_obs_shape: Option<&[i64]>,
        action_shape: &[i64],
    ) -> Result<()> {
        if num_envs == 0 || num_transitions_per_env == 0 {
            return Err(ExtPpoError::Config(
                "storage needs at least one instance and one step".into(),
            ));
        }
        // Recurrent minibatches split instances, flat ones split samples
        let num_mini_batches = self.config.num_mini_batches;
        let (available, unit) = if self.policy.is_recurrent() {
            (num_envs, "instances")
        } else {
            (num_envs * num_transitions_per_env, "samples")
        };
        if available < num_mini_batches {
            return Err(ExtPpoError::Config(format!(
                "{} {} cannot fill {} minibatches",
                available, unit, num_mini_batches
            )));
        }
        let rnd_state_shape = self.rnd.as_ref().map(|rnd| vec![rnd.num_states()]);

        let mut expert_mean = None;
        let mut expert_sigma = None;
        for stage in [&self.bc, &self.offline_bc].into_iter().flatten() {
            expert_mean = Some(action_shape);
            if stage.learn_std() {
                expert_sigma = Some(action_shape);
            }
        }

        let layout = StorageLayout::new(
            num_envs,
            num_transitions_per_env,
            actor_obs_shape,
            action_shape,
            self.config.device,
        )
        .with_privileged_obs(critic_obs_shape)
        .with_rnd_state(rnd_state_shape.as_deref())
        .with_expert_actions(expert_mean, expert_sigma);

        if self.offline.is_some() {
            let (mean, sigma) = match &self.offline_bc {
                Some(stage) => (Some(action_shape), stage.learn_std().then_some(action_shape)),
                None => (None, None),
            };
            let capacity = num_transitions_per_env * self.config.replay_capacity_multiplier;
            let replay_layout = layout.with_capacity(capacity).with_expert_actions(mean, sigma);
            self.replay = Some(ReplayStorage::new(replay_layout));
        }
        self.storage = Some(RolloutStorage::new(layout));
        Ok(())
    }

    /// Sample actions for `observations` and record the policy statistics.
    pub fn act(&mut self, observations: &Tensor, critic_observations: &Tensor) -> Result<Tensor> {
        if self.storage.is_none() {
            return Err(ExtPpoError::StorageNotInitialized);
        }
        if self.policy.is_recurrent() {
            self.transition.hidden_states = self.policy.hidden_states();
        }

        let policy = &mut self.policy;
        let (distribution, actions, values) = tch::no_grad(|| {
            let distribution = policy.act(observations, None, None).detach();
            let actions = distribution.sample();
            let values = policy.evaluate(critic_observations, None, None);
            (distribution, actions, values)
        });

        self.transition.actions_log_prob = Some(distribution.log_prob(&actions).detach());
        self.transition.actions = Some(actions.shallow_clone());
        self.transition.values = Some(values.detach());
        self.transition.action_mean = Some(distribution.mean);
        self.transition.action_sigma = Some(distribution.std);
        self.transition.observations = Some(observations.shallow_clone());
        self.transition.critic_observations = Some(critic_observations.shallow_clone());

        // Offline targets overwrite online ones when both stages are configured
        for stage in [&self.bc, &self.offline_bc].into_iter().flatten() {
            let (mean, sigma) = stage.experts.targets(observations)?;
            self.transition.expert_action_mean = Some(mean);
            if sigma.is_some() {
                self.transition.expert_action_sigma = sigma;
            }
        }

        Ok(actions)
    }

    /// Record the environment's answer to the last `act` and store the step.
    pub fn process_env_step(&mut self, rewards: &Tensor, dones: &Tensor, info: &StepInfo) -> Result<()> {
        let device = self.config.device;
        // Cloned, since the caller may reuse the reward for bootstrapping
        let mut rewards = rewards.to_device(device).to_kind(Kind::Float).reshape([-1]).copy();

        if let Some(rnd) = self.rnd.as_mut() {
            let rnd_state = info
                .rnd_state
                .as_ref()
                .ok_or(ExtPpoError::MissingField("rnd_state"))?;
            let (intrinsic, rnd_state) = rnd.get_intrinsic_reward(&rnd_state.to_device(device));
            rewards += intrinsic;
            self.transition.rnd_state = Some(rnd_state.copy());
        }

        // Bootstrap on time outs
        if let Some(time_outs) = &info.time_outs {
            let values = self
                .transition
                .values
                .as_ref()
                .ok_or(ExtPpoError::MissingField("values"))?;
            let time_outs = time_outs.to_device(device).to_kind(Kind::Float).reshape([-1]);
            rewards += self.config.gamma * values.reshape([-1]) * time_outs;
        }

        self.transition.rewards = Some(rewards);
        self.transition.dones = Some(dones.to_device(device));

        let storage = self.storage.as_mut().ok_or(ExtPpoError::StorageNotInitialized)?;
        let appended = storage.add_transitions(&self.transition);
        self.transition.clear();
        self.policy.reset(&dones.to_device(device));
        appended
    }

    /// Bootstrap from the critic on the observation following the window.
    pub fn compute_returns(&mut self, last_critic_observations: &Tensor) -> Result<()> {
        let storage = self.storage.as_mut().ok_or(ExtPpoError::StorageNotInitialized)?;
        let policy = &mut self.policy;
        let last_values = tch::no_grad(|| policy.evaluate(last_critic_observations, None, None));
        storage.compute_returns(&last_values, self.config.gamma, self.config.lam);
        Ok(())
    }

    /// Train on the stored rollout, run the offline stage and clear the
    /// rollout store. The store is cleared even when training fails.
    pub fn update(&mut self) -> Result<UpdateStats> {
        let result = self.run_update();
        if let Some(storage) = self.storage.as_mut() {
            storage.clear();
        }
        result
    }

    fn run_update(&mut self) -> Result<UpdateStats> {
        let storage = self.storage.as_ref().ok_or(ExtPpoError::StorageNotInitialized)?;
        if storage.size() == 0 {
            return Err(ExtPpoError::Config("update called on an empty rollout".into()));
        }
        let (num_mini_batches, num_epochs) = (self.config.num_mini_batches, self.config.num_learning_epochs);
        let generator: Box<dyn Iterator<Item = MiniBatch>> = if self.policy.is_recurrent() {
            Box::new(storage.recurrent_mini_batch_generator(num_mini_batches, num_epochs))
        } else {
            Box::new(storage.mini_batch_generator(num_mini_batches, num_epochs))
        };

        let mut stats = UpdateStats::default();
        let mut num_updates = 0usize;
        for batch in generator {
            let losses = self.train_step(batch)?;
            stats.mean_value_loss += losses.value;
            stats.mean_surrogate_loss += losses.surrogate;
            stats.mean_entropy += losses.entropy;
            accumulate(&mut stats.mean_bc_loss, losses.bc);
            accumulate(&mut stats.mean_rnd_loss, losses.rnd);
            accumulate(&mut stats.mean_symmetry_loss, losses.symmetry);
            num_updates += 1;
        }

        let n = num_updates.max(1) as f64;
        stats.mean_value_loss /= n;
        stats.mean_surrogate_loss /= n;
        stats.mean_entropy /= n;
        for mean in [
            &mut stats.mean_bc_loss,
            &mut stats.mean_rnd_loss,
            &mut stats.mean_symmetry_loss,
        ] {
            *mean = mean.map(|total| total / n);
        }

        if let Some(report) = self.run_offline_stage()? {
            stats.replay_fill_ratio = Some(report.fill_ratio);
            stats.offline_bc_loss = report.bc_loss;
            stats.num_offline_updates = report.num_updates;
        }

        stats.learning_rate = self.learning_rate;
        stats.bc_loss_coeff = self.bc_loss_coeff();
        stats.offline_bc_loss_coeff = self.offline_bc_loss_coeff();
        debug!(
            num_updates,
            value_loss = stats.mean_value_loss,
            surrogate_loss = stats.mean_surrogate_loss,
            entropy = stats.mean_entropy,
            learning_rate = stats.learning_rate,
            "Update finished"
        );
        Ok(stats)
    }

    fn train_step(&mut self, batch: MiniBatch) -> Result<StepLosses> {
        let MiniBatch {
            mut observations,
            mut critic_observations,
            mut actions,
            mut target_values,
            mut advantages,
            mut returns,
            mut old_actions_log_prob,
            old_mu,
            old_sigma,
            hidden_states,
            masks,
            expert_action_mean,
            expert_action_sigma,
            rnd_state,
        } = batch;
        let original_batch_size = observations.size()[0];

        if let Some(symmetry) = self.symmetry.as_ref().filter(|s| s.use_data_augmentation) {
            let (aug_obs, aug_actions) = symmetry.function.augment(Some(&observations), Some(&actions), false);
            let (aug_critic_obs, _) = symmetry.function.augment(Some(&critic_observations), None, true);
            observations = augmented(aug_obs, "observations")?;
            actions = augmented(aug_actions, "actions")?;
            critic_observations = augmented(aug_critic_obs, "critic observations")?;

            let num_aug = observations.size()[0] / original_batch_size;
            old_actions_log_prob = old_actions_log_prob.repeat([num_aug, 1]);
            target_values = target_values.repeat([num_aug, 1]);
            advantages = advantages.repeat([num_aug, 1]);
            returns = returns.repeat([num_aug, 1]);
        }

        let distribution = self.policy.act(
            &observations,
            masks.as_ref(),
            hidden_states.as_ref().map(|h| &h.actor),
        );
        let actions_log_prob = distribution.log_prob(&actions);
        let values = self.policy.evaluate(
            &critic_observations,
            masks.as_ref(),
            hidden_states.as_ref().map(|h| &h.critic),
        );
        // Only the original samples feed entropy, KL and cloning
        let mu = distribution.mean.narrow(0, 0, original_batch_size);
        let sigma = distribution.std.narrow(0, 0, original_batch_size);
        let entropy = distribution.entropy().narrow(0, 0, original_batch_size);

        if self.config.adaptive_lr() {
            if let Some(desired_kl) = self.config.desired_kl {
                let kl_mean = tch::no_grad(|| {
                    DiagGaussian::new(mu.detach(), sigma.detach())
                        .kl_from(&old_mu, &old_sigma)
                        .mean(Kind::Float)
                        .double_value(&[])
                });
                let learning_rate = adapt_learning_rate(self.learning_rate, kl_mean, desired_kl);
                if learning_rate != self.learning_rate {
                    debug!(kl_mean, learning_rate, "Adjusted learning rate");
                }
                self.learning_rate = learning_rate;
                self.optimizer.set_learning_rate(learning_rate);
            }
        }

        let clip = self.config.clip_param;
        let surrogate = surrogate_loss(&advantages, &actions_log_prob, &old_actions_log_prob, clip);
        let value_loss = value_loss(
            &values,
            &target_values,
            &returns,
            clip,
            self.config.use_clipped_value_loss,
        );
        let entropy_mean = entropy.mean(Kind::Float);
        let mut loss = &surrogate + self.config.value_loss_coef * &value_loss
            - self.config.entropy_coef * &entropy_mean;

        let symmetry_loss = match &self.symmetry {
            Some(symmetry) => {
                let aug_obs = if symmetry.use_data_augmentation {
                    observations.shallow_clone()
                } else {
                    augmented(symmetry.function.augment(Some(&observations), None, false).0, "observations")?
                };
                let mean_actions = self.policy.act_inference(&aug_obs.detach());
                let original_mean = mean_actions.narrow(0, 0, original_batch_size);
                let (_, mirrored) = symmetry.function.augment(None, Some(&original_mean), false);
                let mirrored = augmented(mirrored, "actions")?.detach();

                let rows = mean_actions.size()[0] - original_batch_size;
                let symmetry_loss = mse(
                    &mean_actions.narrow(0, original_batch_size, rows),
                    &mirrored.narrow(0, original_batch_size, rows),
                );
                if symmetry.use_mirror_loss {
                    loss = loss + symmetry.mirror_loss_coeff * &symmetry_loss;
                    Some(symmetry_loss)
                } else {
                    Some(symmetry_loss.detach())
                }
            }
            None => None,
        };

        let bc_loss = match self.bc.as_mut() {
            Some(stage) => {
                let target = expert_action_mean
                    .as_ref()
                    .ok_or(ExtPpoError::MissingField("expert_action_mean"))?;
                let mut bc_loss = mse(&mu, target);
                if stage.learn_std() {
                    let target = expert_action_sigma
                        .as_ref()
                        .ok_or(ExtPpoError::MissingField("expert_action_sigma"))?;
                    bc_loss = bc_loss + mse(&sigma, target);
                }
                let coeff = stage.decay();
                loss = (1.0 - coeff) * &loss + coeff * &bc_loss;
                Some(bc_loss)
            }
            None => None,
        };

        self.optimizer.backward_step(&loss, Some(self.config.max_grad_norm));

        let rnd_loss = match (self.rnd.as_mut(), rnd_state.as_ref()) {
            (Some(rnd), Some(state)) => Some(rnd.train_step(state)),
            _ => None,
        };

        Ok(StepLosses {
            value: value_loss.double_value(&[]),
            surrogate: surrogate.double_value(&[]),
            entropy: entropy_mean.double_value(&[]),
            bc: bc_loss.map(|l| l.double_value(&[])),
            rnd: rnd_loss,
            symmetry: symmetry_loss.map(|l| l.double_value(&[])),
        })
    }

    /// Switch extension normalizers to training mode
    pub fn train_mode(&mut self) {
        if let Some(rnd) = self.rnd.as_mut() {
            rnd.train(true);
        }
    }

    /// Freeze extension normalizers
    pub fn test_mode(&mut self) {
        if let Some(rnd) = self.rnd.as_mut() {
            rnd.train(false);
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub fn storage(&self) -> Option<&RolloutStorage> {
        self.storage.as_ref()
    }

    pub fn replay_storage(&self) -> Option<&ReplayStorage> {
        self.replay.as_ref()
    }

    pub fn rnd(&self) -> Option<&RandomNetworkDistillation> {
        self.rnd.as_ref()
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Current online cloning weight
    pub fn bc_loss_coeff(&self) -> Option<f64> {
        self.bc.as_ref().map(CloningStage::loss_coeff)
    }

    /// Current offline cloning weight
    pub fn offline_bc_loss_coeff(&self) -> Option<f64> {
        self.offline_bc.as_ref().map(CloningStage::loss_coeff)
    }

    /// Episode statistics of the rollout collected so far
    pub fn rollout_statistics(&self) -> Option<RolloutStatistics> {
        self.storage.as_ref()?.get_statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::tests::ConstantExpert;
    use crate::policy::{MlpActorCritic, MlpConfig, RecurrentActorCritic, RecurrentConfig, RnnType};
    use crate::training::{OfflineConfig, RndConfig, Schedule};

    const NUM_ENVS: usize = 4;
    const STEPS: usize = 6;
    const OBS: i64 = 3;
    const ACT: i64 = 2;

    fn policy() -> MlpActorCritic {
        MlpActorCritic::new(
            OBS,
            OBS,
            ACT,
            MlpConfig {
                actor_hidden_dims: vec![16],
                critic_hidden_dims: vec![16],
                ..Default::default()
            },
            Device::Cpu,
        )
    }

    fn constant_loader() -> Extensions {
        Extensions::new().with_expert_loader("constant", |path: &str, _device: Device| {
            let action: f64 = path.parse().unwrap_or(0.0);
            let expert: Box<dyn Expert> = Box::new(ConstantExpert {
                action,
                num_actions: ACT,
            });
            Ok(expert)
        })
    }

    fn cloning(coeff: f64, decay: f64) -> BehaviorCloningConfig {
        BehaviorCloningConfig {
            experts_path: vec!["0.5".to_string()],
            experts_loader: "constant".to_string(),
            cloning_loss_coeff: coeff,
            loss_decay: decay,
            ..Default::default()
        }
    }

    fn rollout<P: ActorCritic>(ppo: &mut ExtensiblePpo<P>, info: impl Fn() -> StepInfo) {
        for t in 0..STEPS {
            let obs = Tensor::randn([NUM_ENVS as i64, OBS], (Kind::Float, Device::Cpu));
            let actions = ppo.act(&obs, &obs).unwrap();
            assert_eq!(actions.size(), [NUM_ENVS as i64, ACT]);
            let rewards = Tensor::ones([NUM_ENVS as i64], (Kind::Float, Device::Cpu));
            let dones = Tensor::zeros([NUM_ENVS as i64], (Kind::Float, Device::Cpu));
            if t == 2 {
                let _ = dones.get(1).fill_(1.0);
            }
            ppo.process_env_step(&rewards, &dones, &info()).unwrap();
        }
        let obs = Tensor::randn([NUM_ENVS as i64, OBS], (Kind::Float, Device::Cpu));
        ppo.compute_returns(&obs).unwrap();
    }

    #[test]
    fn test_act_before_init_storage() {
        let mut ppo = ExtensiblePpo::new(policy(), PpoConfig::default(), Extensions::default()).unwrap();
        let obs = Tensor::zeros([2, OBS], (Kind::Float, Device::Cpu));
        assert!(matches!(ppo.act(&obs, &obs), Err(ExtPpoError::StorageNotInitialized)));
    }

    #[test]
    fn test_storage_too_small_for_minibatches() {
        let config = PpoConfig::default().with_epochs(1, 8);
        let mut ppo = ExtensiblePpo::new(policy(), config.clone(), Extensions::default()).unwrap();
        assert!(matches!(
            ppo.init_storage(2, 3, &[OBS], None, &[ACT]),
            Err(ExtPpoError::Config(_))
        ));
        assert!(ppo.init_storage(2, 4, &[OBS], None, &[ACT]).is_ok());

        // Recurrent minibatches need one instance each
        let recurrent = RecurrentActorCritic::new(OBS, OBS, ACT, RecurrentConfig::default(), Device::Cpu);
        let mut ppo = ExtensiblePpo::new(recurrent, config, Extensions::default()).unwrap();
        assert!(matches!(
            ppo.init_storage(4, 100, &[OBS], None, &[ACT]),
            Err(ExtPpoError::Config(_))
        ));
    }

    #[test]
    fn test_plain_update_clears_storage() {
        let config = PpoConfig::default().with_epochs(2, 2);
        let mut ppo = ExtensiblePpo::new(policy(), config, Extensions::default()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();

        rollout(&mut ppo, StepInfo::new);
        assert_eq!(ppo.storage().unwrap().size(), STEPS);

        let stats = ppo.update().unwrap();
        assert!(stats.mean_value_loss.is_finite());
        assert!(stats.mean_bc_loss.is_none());
        assert!(stats.mean_rnd_loss.is_none());
        assert!(stats.mean_symmetry_loss.is_none());
        assert!(stats.replay_fill_ratio.is_none());
        assert_eq!(stats.learning_rate, 1e-3);
        assert_eq!(ppo.storage().unwrap().size(), 0);
    }

    #[test]
    fn test_time_outs_bootstrap_reward() {
        let config = PpoConfig {
            gamma: 0.5,
            ..Default::default()
        };
        let mut ppo = ExtensiblePpo::new(policy(), config, Extensions::default()).unwrap();
        ppo.init_storage(2, 2, &[OBS], None, &[ACT]).unwrap();

        let obs = Tensor::ones([2, OBS], (Kind::Float, Device::Cpu));
        ppo.act(&obs, &obs).unwrap();
        let rewards = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let dones = Tensor::ones([2], (Kind::Float, Device::Cpu));
        let info = StepInfo::new().with_time_outs(Tensor::from_slice(&[1.0f32, 0.0]));
        ppo.process_env_step(&rewards, &dones, &info).unwrap();

        let buffers = ppo.storage().unwrap().buffers();
        let value = buffers.values.double_value(&[0, 0, 0]);
        assert!((buffers.rewards.double_value(&[0, 0, 0]) - 0.5 * value).abs() < 1e-6);
        assert_eq!(buffers.rewards.double_value(&[0, 1, 0]), 0.0);
        // Caller's tensor untouched
        assert_eq!(rewards.double_value(&[0]), 0.0);
    }

    #[test]
    fn test_online_cloning_decays_every_minibatch() {
        let config = PpoConfig::default()
            .with_epochs(3, 2)
            .with_behavior_cloning(cloning(0.8, 0.9));
        let mut ppo = ExtensiblePpo::new(policy(), config, constant_loader()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();

        rollout(&mut ppo, StepInfo::new);
        let stored = &ppo.storage().unwrap().buffers().expert_action_mean;
        assert_eq!(stored.as_ref().unwrap().double_value(&[0, 0, 0]), 0.5);

        let stats = ppo.update().unwrap();
        let expected = 0.8 * 0.9f64.powi(6);
        assert!((ppo.bc_loss_coeff().unwrap() - expected).abs() < 1e-12);
        assert_eq!(stats.bc_loss_coeff, ppo.bc_loss_coeff());
        assert!(stats.mean_bc_loss.unwrap() >= 0.0);
    }

    #[test]
    fn test_missing_rnd_state_is_reported() {
        let config = PpoConfig::default().with_rnd(RndConfig {
            num_states: 2,
            num_outputs: 4,
            predictor_hidden_dims: vec![8],
            target_hidden_dims: vec![8],
            weight: 1.0,
            ..Default::default()
        });
        let mut ppo = ExtensiblePpo::new(policy(), config, Extensions::default()).unwrap();
        ppo.init_storage(2, 2, &[OBS], None, &[ACT]).unwrap();

        let obs = Tensor::ones([2, OBS], (Kind::Float, Device::Cpu));
        ppo.act(&obs, &obs).unwrap();
        let rewards = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let dones = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let result = ppo.process_env_step(&rewards, &dones, &StepInfo::new());
        assert!(matches!(result, Err(ExtPpoError::MissingField("rnd_state"))));
    }

    #[test]
    fn test_rnd_adds_intrinsic_reward_and_trains() {
        let config = PpoConfig::default().with_rnd(RndConfig {
            num_states: 2,
            num_outputs: 4,
            predictor_hidden_dims: vec![8],
            target_hidden_dims: vec![8],
            weight: 1.0,
            ..Default::default()
        });
        let mut ppo = ExtensiblePpo::new(policy(), config, Extensions::default()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();

        rollout(&mut ppo, || {
            StepInfo::new().with_rnd_state(Tensor::randn([NUM_ENVS as i64, 2], (Kind::Float, Device::Cpu)))
        });
        // Extrinsic reward is 1, the distance term is positive
        let rewards = &ppo.storage().unwrap().buffers().rewards;
        assert!(rewards.min().double_value(&[]) > 1.0);

        let stats = ppo.update().unwrap();
        assert!(stats.mean_rnd_loss.unwrap() > 0.0);
        assert_eq!(ppo.rnd().unwrap().update_counter(), STEPS as u64);
    }

    #[test]
    fn test_adaptive_schedule_moves_learning_rate() {
        let config = PpoConfig::default()
            .with_epochs(4, 2)
            .with_lr(1e-3)
            .with_schedule(Schedule::Adaptive, Some(1e3));
        let mut ppo = ExtensiblePpo::new(policy(), config, Extensions::default()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();
        rollout(&mut ppo, StepInfo::new);

        // Any positive KL is far below half the target, so every step raises the rate
        let stats = ppo.update().unwrap();
        assert!(stats.learning_rate > 1e-3);
        assert!(stats.learning_rate <= 1e-2);
    }

    #[test]
    fn test_desired_kl_without_adaptive_keeps_rate() {
        let config = PpoConfig::default()
            .with_epochs(4, 2)
            .with_schedule(Schedule::Fixed, Some(1e3));
        let mut ppo = ExtensiblePpo::new(policy(), config, Extensions::default()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();
        rollout(&mut ppo, StepInfo::new);
        assert_eq!(ppo.update().unwrap().learning_rate, 1e-3);
    }

    #[test]
    fn test_symmetry_requires_registered_function() {
        let config = PpoConfig::default().with_symmetry(SymmetryConfig {
            use_data_augmentation: true,
            data_augmentation_func: Some("mirror".to_string()),
            ..Default::default()
        });
        match ExtensiblePpo::new(policy(), config, Extensions::default()) {
            Err(ExtPpoError::AugmentationNotCallable(name)) => assert_eq!(name.as_deref(), Some("mirror")),
            _ => panic!("Expected augmentation error"),
        }
    }

    #[test]
    fn test_symmetry_augmentation_and_mirror_loss() {
        let config = PpoConfig::default().with_epochs(1, 2).with_symmetry(SymmetryConfig {
            use_data_augmentation: true,
            use_mirror_loss: true,
            mirror_loss_coeff: 0.5,
            data_augmentation_func: Some("mirror".to_string()),
        });
        let extensions = Extensions::new().with_symmetry(
            "mirror",
            crate::extensions::SignFlipSymmetry::new(&[1.0, -1.0, 1.0], &[1.0, -1.0, 1.0], &[-1.0, 1.0]),
        );
        let mut ppo = ExtensiblePpo::new(policy(), config, extensions).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();
        rollout(&mut ppo, StepInfo::new);

        let stats = ppo.update().unwrap();
        assert!(stats.mean_symmetry_loss.unwrap() >= 0.0);
        assert!(stats.mean_surrogate_loss.is_finite());
    }

    #[test]
    fn test_symmetry_rejected_for_recurrent_policy() {
        let recurrent = RecurrentActorCritic::new(
            OBS,
            OBS,
            ACT,
            RecurrentConfig {
                rnn_type: RnnType::Gru,
                rnn_hidden_size: 8,
                ..Default::default()
            },
            Device::Cpu,
        );
        let config = PpoConfig::default().with_symmetry(SymmetryConfig {
            data_augmentation_func: Some("identity".to_string()),
            ..Default::default()
        });
        let extensions = Extensions::new().with_symmetry(
            "identity",
            |obs: Option<&Tensor>, actions: Option<&Tensor>, _is_critic: bool| {
                (obs.map(|o| o.shallow_clone()), actions.map(|a| a.shallow_clone()))
            },
        );
        assert!(matches!(
            ExtensiblePpo::new(recurrent, config, extensions),
            Err(ExtPpoError::Config(_))
        ));
    }

    #[test]
    fn test_recurrent_update_runs() {
        let recurrent = RecurrentActorCritic::new(
            OBS,
            OBS,
            ACT,
            RecurrentConfig {
                rnn_type: RnnType::Lstm,
                rnn_hidden_size: 8,
                mlp: MlpConfig {
                    actor_hidden_dims: vec![8],
                    critic_hidden_dims: vec![8],
                    ..Default::default()
                },
                ..Default::default()
            },
            Device::Cpu,
        );
        let config = PpoConfig::default().with_epochs(2, 2);
        let mut ppo = ExtensiblePpo::new(recurrent, config, Extensions::default()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();
        rollout(&mut ppo, StepInfo::new);

        assert!(ppo.storage().unwrap().buffers().hidden_states.is_some());
        let stats = ppo.update().unwrap();
        assert!(stats.mean_value_loss.is_finite());
    }

    #[test]
    fn test_replay_allocated_only_for_offline() {
        let mut ppo = ExtensiblePpo::new(policy(), PpoConfig::default(), Extensions::default()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();
        assert!(ppo.replay_storage().is_none());

        let config = PpoConfig {
            replay_capacity_multiplier: 3,
            ..Default::default()
        }
        .with_offline(OfflineConfig {
            behavior_cloning: Some(cloning(1.0, 1.0)),
            ..Default::default()
        });
        let mut ppo = ExtensiblePpo::new(policy(), config, constant_loader()).unwrap();
        ppo.init_storage(NUM_ENVS, STEPS, &[OBS], None, &[ACT]).unwrap();
        let replay = ppo.replay_storage().unwrap();
        assert_eq!(replay.capacity(), 3 * STEPS);
        assert!(replay.buffers().expert_action_mean.is_some());
        assert!(replay.buffers().expert_action_sigma.is_none());
        // Online storage still carries the offline targets
        assert!(ppo.storage().unwrap().buffers().expert_action_mean.is_some());
    }
}
