//! Gradient step helpers around `tch::nn::Optimizer`.

use crate::Result;
use tch::{nn, nn::OptimizerConfig, Tensor};

/// Adam over a fixed set of variables, with gradient-norm clipping and a
/// mutable learning rate.
pub struct TorchOptimizer {
    inner: nn::Optimizer,
    variables: Vec<Tensor>,
    learning_rate: f64,
}

impl TorchOptimizer {
    /// Adam over every trainable variable of `vs`.
    pub fn adam(vs: &nn::VarStore, learning_rate: f64) -> Result<Self> {
        let inner = nn::Adam::default().build(vs, learning_rate)?;
        Ok(Self {
            inner,
            variables: vs.trainable_variables(),
            learning_rate,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
        self.inner.set_lr(learning_rate);
    }

    pub fn variables(&self) -> &[Tensor] {
        &self.variables
    }

    pub fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    pub fn step(&mut self) {
        self.inner.step();
    }

    /// Scale gradients so their global L2 norm is at most `max_norm`.
    ///
    /// Returns the norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let mut global_norm = 0.0f64;
        for var in &self.variables {
            let grad = var.grad();
            if grad.defined() {
                global_norm += grad
                    .pow_tensor_scalar(2.0)
                    .sum(tch::Kind::Float)
                    .double_value(&[]);
            }
        }
        global_norm = global_norm.sqrt();

        if global_norm > max_norm {
            let clip_coef = max_norm / (global_norm + 1e-6);
            for var in &self.variables {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.f_mul_scalar_(clip_coef);
                }
            }
        }
        global_norm
    }

    /// `zero_grad`, backprop `loss`, optionally clip, `step`.
    pub fn backward_step(&mut self, loss: &Tensor, max_grad_norm: Option<f64>) {
        self.zero_grad();
        loss.backward();
        if let Some(max_norm) = max_grad_norm {
            self.clip_grad_norm(max_norm);
        }
        self.step();
    }
}
