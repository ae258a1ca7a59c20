//! PPO loss terms and the KL-driven learning-rate rule.

use tch::{Kind, Reduction, Tensor};

/// Lower bound of the adaptive learning rate
pub const MIN_ADAPTIVE_LR: f64 = 1e-5;
/// Upper bound of the adaptive learning rate
pub const MAX_ADAPTIVE_LR: f64 = 1e-2;

/// Compute PPO clipped surrogate loss
///
/// # Arguments
/// * `advantages` - Normalized advantages [B, 1] or [B]
/// * `log_probs` - Log-probabilities under the current policy [B]
/// * `old_log_probs` - Log-probabilities recorded during the rollout [B, 1] or [B]
/// * `clip_coef` - Ratio clipping range
pub fn surrogate_loss(
    advantages: &Tensor,
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    clip_coef: f64,
) -> Tensor {
    let advantages = advantages.reshape([-1]);
    let ratio = (log_probs.reshape([-1]) - old_log_probs.reshape([-1])).exp();

    let surr1 = -&advantages * &ratio;
    let surr2 = -&advantages * ratio.clamp(1.0 - clip_coef, 1.0 + clip_coef);

    surr1.max_other(&surr2).mean(Kind::Float)
}

/// Compute value loss, optionally clipped around the rollout estimate
pub fn value_loss(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    clip_coef: f64,
    clipped: bool,
) -> Tensor {
    if !clipped {
        return (returns - values).pow_tensor_scalar(2).mean(Kind::Float);
    }
    let values_clipped = old_values + (values - old_values).clamp(-clip_coef, clip_coef);

    let loss1 = (values - returns).pow_tensor_scalar(2);
    let loss2 = (&values_clipped - returns).pow_tensor_scalar(2);

    loss1.max_other(&loss2).mean(Kind::Float)
}

/// Mean squared error between a prediction and a fixed target
pub fn mse(prediction: &Tensor, target: &Tensor) -> Tensor {
    prediction.mse_loss(&target.to_kind(prediction.kind()), Reduction::Mean)
}

/// Next learning rate given the measured mean KL
///
/// Divides by 1.5 when the KL overshoots twice the target, multiplies by 1.5
/// when it stays under half of it, and clamps to
/// [`MIN_ADAPTIVE_LR`, `MAX_ADAPTIVE_LR`].
pub fn adapt_learning_rate(learning_rate: f64, kl_mean: f64, desired_kl: f64) -> f64 {
    if kl_mean > desired_kl * 2.0 {
        MIN_ADAPTIVE_LR.max(learning_rate / 1.5)
    } else if kl_mean < desired_kl / 2.0 && kl_mean > 0.0 {
        MAX_ADAPTIVE_LR.min(learning_rate * 1.5)
    } else {
        learning_rate
    }
}
