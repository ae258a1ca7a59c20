//! Train a point-mass controller with online behavior cloning from a
//! constant expert, intrinsic reward and a replay-backed offline stage.
//!
//! Run with `RUST_LOG=extppo=debug` for per-update statistics.

#[path = "../tests/common/mod.rs"]
mod common;

use common::{constant_experts, PointMass};
use extppo::prelude::*;
use extppo::utils::{abbreviate, set_seed};
use indicatif::{ProgressBar, ProgressStyle};
use tch::Device;
use tracing_subscriber::EnvFilter;

const NUM_ENVS: usize = 64;
const STEPS_PER_ENV: usize = 24;
const ITERATIONS: u64 = 50;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    set_seed(42);

    let device = if cfg!(feature = "cuda") && tch::utils::has_cuda() {
        Device::Cuda(0)
    } else {
        Device::Cpu
    };
    let mut env = PointMass::new(NUM_ENVS, 100, device);

    let policy = MlpActorCritic::new(
        env.num_obs(),
        env.num_privileged_obs().unwrap_or(env.num_obs()),
        env.num_actions(),
        MlpConfig::default(),
        device,
    );
    tracing::info!(
        params = policy.num_parameters(),
        device = ?device,
        "Created point-mass policy"
    );

    let mut config = PpoConfig::default()
        .with_epochs(5, 4)
        .with_schedule(Schedule::Adaptive, Some(0.01))
        .with_behavior_cloning(BehaviorCloningConfig {
            experts_path: vec!["0.0".to_string()],
            experts_loader: "constant".to_string(),
            cloning_loss_coeff: 0.5,
            loss_decay: 0.99,
            ..Default::default()
        })
        .with_rnd(RndConfig {
            num_states: 2,
            num_outputs: 16,
            weight: 0.05,
            state_normalization: true,
            ..Default::default()
        })
        .with_offline(OfflineConfig {
            update_frequencies: 0.5,
            behavior_cloning: Some(BehaviorCloningConfig {
                experts_path: vec!["0.0".to_string()],
                experts_loader: "constant".to_string(),
                cloning_loss_coeff: 1.0,
                loss_decay: 0.999,
                ..Default::default()
            }),
            ..Default::default()
        });
    config.device = device;

    let mut ppo = ExtensiblePpo::new(policy, config, constant_experts())?;
    let critic_shape = env.num_privileged_obs().map(|n| vec![n]);
    ppo.init_storage(
        NUM_ENVS,
        STEPS_PER_ENV,
        &[env.num_obs()],
        critic_shape.as_deref(),
        &[env.num_actions()],
    )?;

    let logger = CompositeLogger::new(vec![Box::new(ConsoleLogger::new())]);
    let pb = ProgressBar::new(ITERATIONS);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    let (mut obs, critic_obs) = env.reset();
    let mut critic_obs = critic_obs.unwrap_or_else(|| obs.shallow_clone());
    let mut global_step = 0u64;

    for iteration in 0..ITERATIONS {
        for _ in 0..STEPS_PER_ENV {
            let actions = ppo.act(&obs, &critic_obs)?;
            let step = env.step(&actions);
            ppo.process_env_step(&step.rewards, &step.dones, &step.info)?;
            critic_obs = step.critic_observations();
            obs = step.observations;
            global_step += NUM_ENVS as u64;
        }
        let rollout = ppo.rollout_statistics();
        ppo.compute_returns(&critic_obs)?;
        let stats = ppo.update()?;

        if let Some(rollout) = rollout {
            pb.set_message(format!(
                "Steps: {} Reward: {:.3} Loss: {:.4}",
                abbreviate(global_step),
                rollout.mean_reward,
                stats.mean_surrogate_loss
            ));
        }
        if iteration % 10 == 0 {
            stats.log_to(&logger, iteration);
        }
        pb.inc(1);
    }
    pb.finish_with_message("Training complete");
    logger.close();

    Ok(())
}
