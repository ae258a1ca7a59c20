mod common;

use common::{constant_experts, PointMass};
use extppo::prelude::*;
use extppo::ExtPpoError;
use tch::{Device, Kind, Tensor};

const NUM_ENVS: usize = 8;
const STEPS: usize = 10;

fn mlp(env: &PointMass) -> MlpActorCritic {
    MlpActorCritic::new(
        env.num_obs(),
        env.num_privileged_obs().unwrap_or(env.num_obs()),
        env.num_actions(),
        MlpConfig {
            actor_hidden_dims: vec![32, 32],
            critic_hidden_dims: vec![32, 32],
            ..Default::default()
        },
        Device::Cpu,
    )
}

fn gru(env: &PointMass) -> RecurrentActorCritic {
    RecurrentActorCritic::new(
        env.num_obs(),
        env.num_privileged_obs().unwrap_or(env.num_obs()),
        env.num_actions(),
        RecurrentConfig {
            rnn_type: RnnType::Gru,
            rnn_hidden_size: 16,
            mlp: MlpConfig {
                actor_hidden_dims: vec![16],
                critic_hidden_dims: vec![16],
                ..Default::default()
            },
            ..Default::default()
        },
        Device::Cpu,
    )
}

fn init<P: ActorCritic>(ppo: &mut ExtensiblePpo<P>, env: &PointMass) {
    let critic_shape = env.num_privileged_obs().map(|n| vec![n]);
    ppo.init_storage(
        env.num_envs(),
        STEPS,
        &[env.num_obs()],
        critic_shape.as_deref(),
        &[env.num_actions()],
    )
    .unwrap();
}

/// Collect one rollout window and run an update.
fn iteration<P: ActorCritic>(
    ppo: &mut ExtensiblePpo<P>,
    env: &mut PointMass,
    obs: &mut Tensor,
    critic_obs: &mut Tensor,
) -> UpdateStats {
    for _ in 0..STEPS {
        let actions = ppo.act(obs, critic_obs).unwrap();
        let step = env.step(&actions);
        ppo.process_env_step(&step.rewards, &step.dones, &step.info).unwrap();
        *critic_obs = step.critic_observations();
        *obs = step.observations;
    }
    ppo.compute_returns(critic_obs).unwrap();
    ppo.update().unwrap()
}

fn start(env: &mut PointMass) -> (Tensor, Tensor) {
    let (obs, critic_obs) = env.reset();
    let critic_obs = critic_obs.unwrap_or_else(|| obs.shallow_clone());
    (obs, critic_obs)
}

#[test]
fn test_full_loop_with_privileged_observations() {
    let mut env = PointMass::new(NUM_ENVS, 15, Device::Cpu);
    let config = PpoConfig::default().with_epochs(2, 4);
    let mut ppo = ExtensiblePpo::new(mlp(&env), config, Extensions::default()).unwrap();
    init(&mut ppo, &env);

    let (mut obs, mut critic_obs) = start(&mut env);
    for _ in 0..3 {
        let stats = iteration(&mut ppo, &mut env, &mut obs, &mut critic_obs);
        assert!(stats.mean_value_loss.is_finite());
        assert!(stats.mean_surrogate_loss.is_finite());
        assert!(stats.mean_symmetry_loss.is_none());
        assert!(stats.mean_bc_loss.is_none());
        assert_eq!(ppo.storage().unwrap().size(), 0);
        assert!(stats.to_metrics().contains_key("loss/surrogate"));
    }
}

#[test]
fn test_rollout_statistics_before_update() {
    let mut env = PointMass::new(NUM_ENVS, 4, Device::Cpu);
    let mut ppo = ExtensiblePpo::new(mlp(&env), PpoConfig::default(), Extensions::default()).unwrap();
    init(&mut ppo, &env);
    let (mut obs, critic_obs) = start(&mut env);
    let mut critic_obs = critic_obs;

    assert!(ppo.rollout_statistics().is_none());
    for _ in 0..STEPS {
        let actions = ppo.act(&obs, &critic_obs).unwrap();
        let step = env.step(&actions);
        ppo.process_env_step(&step.rewards, &step.dones, &step.info).unwrap();
        critic_obs = step.critic_observations();
        obs = step.observations;
    }
    let stats = ppo.rollout_statistics().unwrap();
    // Episodes time out every 4 steps, the window of 10 ends mid-episode
    assert!((stats.mean_episode_length - 10.0 / 3.0).abs() < 1e-6);
    assert!(stats.mean_reward.is_finite());
}

#[test]
fn test_offline_cloning_coefficient_decay() {
    let mut env = PointMass::new(NUM_ENVS, 15, Device::Cpu);
    let offline_cloning = BehaviorCloningConfig {
        experts_path: vec!["0.25".to_string()],
        experts_loader: "constant".to_string(),
        learn_std: true,
        cloning_loss_coeff: 0.9,
        loss_decay: 0.95,
    };
    let config = PpoConfig {
        replay_capacity_multiplier: 2,
        ..Default::default()
    }
    .with_offline(OfflineConfig {
        update_frequencies: 1.0,
        batch_size: Some(40),
        num_learning_epochs: Some(1),
        behavior_cloning: Some(offline_cloning),
    });
    let mut ppo = ExtensiblePpo::new(mlp(&env), config, constant_experts()).unwrap();
    init(&mut ppo, &env);
    assert_eq!(ppo.replay_storage().unwrap().capacity(), 2 * STEPS);

    let (mut obs, mut critic_obs) = start(&mut env);
    let mut fill = Vec::new();
    for _ in 0..3 {
        let stats = iteration(&mut ppo, &mut env, &mut obs, &mut critic_obs);
        assert_eq!(stats.num_offline_updates, 1);
        assert!(stats.offline_bc_loss.unwrap() >= 0.0);
        fill.push(stats.replay_fill_ratio.unwrap());
    }
    assert_eq!(fill, vec![0.5, 1.0, 1.0]);

    // 80, 160 and 160 replay rows in minibatches of 40
    let decays = 2 + 4 + 4;
    let expected = 0.9 * 0.95f64.powi(decays);
    assert!((ppo.offline_bc_loss_coeff().unwrap() - expected).abs() < 1e-12);

    let replay = ppo.replay_storage().unwrap();
    let targets = replay.buffers().valid_rows(StorageField::ExpertActionMean).unwrap();
    assert!((targets.mean(Kind::Float).double_value(&[]) - 0.25).abs() < 1e-6);
}

#[test]
fn test_fractional_offline_cadence() {
    let mut env = PointMass::new(NUM_ENVS, 15, Device::Cpu);
    let config = PpoConfig::default().with_offline(OfflineConfig {
        update_frequencies: 0.5,
        behavior_cloning: Some(BehaviorCloningConfig {
            experts_path: vec!["0.0".to_string()],
            experts_loader: "constant".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    let mut ppo = ExtensiblePpo::new(mlp(&env), config, constant_experts()).unwrap();
    init(&mut ppo, &env);

    let (mut obs, mut critic_obs) = start(&mut env);
    let cadence: Vec<usize> = (0..4)
        .map(|_| iteration(&mut ppo, &mut env, &mut obs, &mut critic_obs).num_offline_updates)
        .collect();
    assert_eq!(cadence, vec![1, 0, 1, 0]);
    // The rollout reaches the ring every iteration, trained on or not
    assert_eq!(ppo.replay_storage().unwrap().size(), 4 * STEPS);
}

#[test]
fn test_recurrent_policy_with_offline_cloning() {
    let mut env = PointMass::new(NUM_ENVS, 6, Device::Cpu);
    let config = PpoConfig::default().with_epochs(2, 2).with_offline(OfflineConfig {
        batch_size: Some(20),
        behavior_cloning: Some(BehaviorCloningConfig {
            experts_path: vec!["0.5".to_string()],
            experts_loader: "constant".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    let mut ppo = ExtensiblePpo::new(gru(&env), config, constant_experts()).unwrap();
    init(&mut ppo, &env);

    let (mut obs, mut critic_obs) = start(&mut env);
    for _ in 0..2 {
        let stats = iteration(&mut ppo, &mut env, &mut obs, &mut critic_obs);
        assert!(stats.mean_value_loss.is_finite());
        assert!(stats.offline_bc_loss.unwrap().is_finite());
    }
    assert!(ppo.replay_storage().unwrap().buffers().valid_hidden_states().is_some());
}

#[test]
fn test_rnd_and_online_cloning_together() {
    let mut env = PointMass::new(NUM_ENVS, 15, Device::Cpu);
    let config = PpoConfig::default()
        .with_epochs(1, 2)
        .with_behavior_cloning(BehaviorCloningConfig {
            experts_path: vec!["0.1".to_string(), "-0.1".to_string()],
            experts_loader: "constant".to_string(),
            learn_std: true,
            cloning_loss_coeff: 0.5,
            loss_decay: 0.5,
        })
        .with_rnd(RndConfig {
            num_states: 2,
            num_outputs: 8,
            predictor_hidden_dims: vec![16],
            target_hidden_dims: vec![16],
            weight: 0.1,
            state_normalization: true,
            reward_normalization: true,
            ..Default::default()
        });
    let half = NUM_ENVS as i64 / 2;
    let extensions = constant_experts().with_online_mapping(ExpertEnvMapping::partition(move |i| {
        Tensor::arange_start(i as i64 * half, (i as i64 + 1) * half, (Kind::Int64, Device::Cpu))
    }));
    let mut ppo = ExtensiblePpo::new(mlp(&env), config, extensions).unwrap();
    init(&mut ppo, &env);

    let (mut obs, mut critic_obs) = start(&mut env);
    for _ in 0..STEPS {
        let actions = ppo.act(&obs, &critic_obs).unwrap();
        let step = env.step(&actions);
        ppo.process_env_step(&step.rewards, &step.dones, &step.info).unwrap();
        critic_obs = step.critic_observations();
        obs = step.observations;
    }
    let targets = ppo
        .storage()
        .unwrap()
        .buffers()
        .valid_rows(StorageField::ExpertActionMean)
        .unwrap();
    assert!((targets.double_value(&[0, 0, 0]) - 0.1).abs() < 1e-6);
    assert!((targets.double_value(&[0, NUM_ENVS as i64 - 1, 0]) + 0.1).abs() < 1e-6);

    ppo.compute_returns(&critic_obs).unwrap();
    let stats = ppo.update().unwrap();
    assert!(stats.mean_rnd_loss.unwrap() > 0.0);
    assert!(stats.mean_bc_loss.unwrap() >= 0.0);
    assert!((ppo.bc_loss_coeff().unwrap() - 0.5 * 0.5f64.powi(2)).abs() < 1e-12);
}

#[test]
fn test_multiple_experts_without_mapping() {
    let env = PointMass::new(NUM_ENVS, 15, Device::Cpu);
    let config = PpoConfig::default().with_behavior_cloning(BehaviorCloningConfig {
        experts_path: vec!["0.1".to_string(), "0.2".to_string()],
        experts_loader: "constant".to_string(),
        ..Default::default()
    });
    match ExtensiblePpo::new(mlp(&env), config, constant_experts()) {
        Err(ExtPpoError::MissingExpertMapping { stage, num_experts }) => {
            assert_eq!(stage, "online");
            assert_eq!(num_experts, 2);
        }
        _ => panic!("Expected a missing mapping error"),
    }
}

#[test]
fn test_config_from_json() {
    let env = PointMass::new(NUM_ENVS, 15, Device::Cpu);
    let config = PpoConfig::from_json_str(
        r#"{
            "num_learning_epochs": 2,
            "num_mini_batches": 2,
            "schedule": "adaptive",
            "desired_kl": null,
            "symmetry": {"use_mirror_loss": true, "data_augmentation_func": "missing"}
        }"#,
    )
    .unwrap();
    assert!(!config.adaptive_lr());

    match ExtensiblePpo::new(mlp(&env), config.clone(), Extensions::default()) {
        Err(ExtPpoError::AugmentationNotCallable(Some(name))) => assert_eq!(name, "missing"),
        _ => panic!("Expected an augmentation error"),
    }

    // Without a target KL the adaptive schedule keeps the rate
    let config = PpoConfig {
        symmetry: None,
        ..config
    };
    let mut env = env;
    let mut ppo = ExtensiblePpo::new(mlp(&env), config, Extensions::default()).unwrap();
    init(&mut ppo, &env);
    let (mut obs, mut critic_obs) = start(&mut env);
    let stats = iteration(&mut ppo, &mut env, &mut obs, &mut critic_obs);
    assert_eq!(stats.learning_rate, 1e-3);

    assert!(matches!(
        PpoConfig::from_json_str(r#"{"num_mini_batches": 0}"#),
        Err(ExtPpoError::Config(_))
    ));
    assert!(matches!(PpoConfig::from_json_str("{"), Err(ExtPpoError::JsonError(_))));
}

#[test]
fn test_unknown_loader_is_reported() {
    let env = PointMass::new(NUM_ENVS, 15, Device::Cpu);
    let config = PpoConfig::default().with_behavior_cloning(BehaviorCloningConfig {
        experts_path: vec!["expert.pt".to_string()],
        experts_loader: "onnx".to_string(),
        ..Default::default()
    });
    assert!(matches!(
        ExtensiblePpo::new(mlp(&env), config, Extensions::default()),
        Err(ExtPpoError::UnknownExpertLoader(_))
    ));
}
