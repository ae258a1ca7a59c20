//! Running mean and variance normalization over batches of samples.

use tch::{Device, Kind, Tensor};

/// Normalizes samples with statistics accumulated from every batch seen in
/// training mode.
///
/// Batch moments are merged into the running moments weighted by sample
/// count, so the result does not depend on how samples are batched.
#[derive(Debug)]
pub struct EmpiricalNormalization {
    mean: Tensor,
    var: Tensor,
    count: i64,
    epsilon: f64,
    /// Stop updating after this many samples
    until: Option<i64>,
    training: bool,
}

impl EmpiricalNormalization {
    pub fn new(shape: &[i64], device: Device) -> Self {
        Self::with_epsilon(shape, 1e-2, device)
    }

    pub fn with_epsilon(shape: &[i64], epsilon: f64, device: Device) -> Self {
        Self {
            mean: Tensor::zeros(shape, (Kind::Float, device)),
            var: Tensor::ones(shape, (Kind::Float, device)),
            count: 0,
            epsilon,
            until: None,
            training: true,
        }
    }

    pub fn until(mut self, max_samples: i64) -> Self {
        self.until = Some(max_samples);
        self
    }

    pub fn train(&mut self, training: bool) {
        self.training = training;
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn std(&self) -> Tensor {
        self.var.sqrt()
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    /// Merge the moments of `batch` (`[batch, ...shape]`).
    pub fn update(&mut self, batch: &Tensor) {
        if self.until.is_some_and(|until| self.count >= until) {
            return;
        }
        let batch_count = batch.size()[0];
        if batch_count == 0 {
            return;
        }
        self.count += batch_count;
        let rate = batch_count as f64 / self.count as f64;

        let batch = batch.detach().to_kind(Kind::Float);
        let batch_var = batch.var_dim([0i64].as_slice(), false, false);
        let batch_mean = batch.mean_dim([0i64].as_slice(), false, Kind::Float);
        let delta_mean = &batch_mean - &self.mean;

        let new_mean = &self.mean + &delta_mean * rate;
        let new_var = &self.var + (batch_var - &self.var + &delta_mean * (&batch_mean - &new_mean)) * rate;
        self.mean = new_mean;
        self.var = new_var;
    }

    /// Normalize `x`, updating the statistics first in training mode.
    pub fn normalize(&mut self, x: &Tensor) -> Tensor {
        if self.training {
            self.update(x);
        }
        (x - &self.mean) / (self.std() + self.epsilon)
    }

    /// Divide by the running std without centering.
    pub fn scale(&mut self, x: &Tensor) -> Tensor {
        if self.training {
            self.update(x);
        }
        x / (self.std() + self.epsilon)
    }
}
