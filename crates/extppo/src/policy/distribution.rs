//! Diagonal Gaussian action distribution.

use tch::{Kind, Tensor};

/// Independent normal per action dimension.
///
/// `mean` and `std` share the shape `[..., num_actions]`. Log-probabilities,
/// entropy and KL are summed over the last axis.
pub struct DiagGaussian {
    pub mean: Tensor,
    pub std: Tensor,
}

impl DiagGaussian {
    pub fn new(mean: Tensor, std: Tensor) -> Self {
        Self { mean, std }
    }

    /// Draw one action per row
    pub fn sample(&self) -> Tensor {
        let noise = Tensor::randn_like(&self.mean);
        &self.mean + noise * &self.std
    }

    pub fn log_prob(&self, actions: &Tensor) -> Tensor {
        let var = self.std.pow_tensor_scalar(2.0);
        let log_std = self.std.log();
        let log_2pi = (2.0 * std::f64::consts::PI).ln();

        let sq_diff = (actions - &self.mean).pow_tensor_scalar(2.0);
        let element_wise = (sq_diff / var + log_std * 2.0 + log_2pi) * -0.5;
        element_wise.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
    }

    pub fn entropy(&self) -> Tensor {
        let entropy = self.std.log() + 0.5 + 0.5 * (2.0 * std::f64::consts::PI).ln();
        entropy.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
    }

    /// `KL(old || self)` for a previous distribution given by its mean and std.
    pub fn kl_from(&self, old_mean: &Tensor, old_std: &Tensor) -> Tensor {
        let kl = (&self.std / old_std + 1e-5).log()
            + (old_std.pow_tensor_scalar(2.0) + (old_mean - &self.mean).pow_tensor_scalar(2.0))
                / (self.std.pow_tensor_scalar(2.0) * 2.0)
            - 0.5;
        kl.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
    }

    /// Copy with both parameters cut from the graph
    pub fn detach(&self) -> Self {
        Self {
            mean: self.mean.detach(),
            std: self.std.detach(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn standard(batch: i64, dims: i64) -> DiagGaussian {
        DiagGaussian::new(
            Tensor::zeros([batch, dims], (Kind::Float, Device::Cpu)),
            Tensor::ones([batch, dims], (Kind::Float, Device::Cpu)),
        )
    }

    #[test]
    fn test_gaussian_sample() {
        let dist = DiagGaussian::new(
            Tensor::zeros([1, 2], (Kind::Float, Device::Cpu)),
            Tensor::from_slice(&[1.0f32, 2.0]).reshape([1, 2]),
        );
        assert_eq!(dist.sample().size(), [1, 2]);
    }

    #[test]
    fn test_gaussian_log_prob() {
        let dist = standard(1, 1);
        let x = Tensor::zeros([1, 1], (Kind::Float, Device::Cpu));
        let val = dist.log_prob(&x).double_value(&[0]);
        assert!((val + 0.9189).abs() < 1e-4);

        // Summed over action dimensions
        let dist = standard(1, 3);
        let x = Tensor::zeros([1, 3], (Kind::Float, Device::Cpu));
        assert!((dist.log_prob(&x).double_value(&[0]) + 3.0 * 0.9189).abs() < 1e-3);
    }

    #[test]
    fn test_gaussian_entropy() {
        let val = standard(1, 1).entropy().double_value(&[0]);
        assert!((val - 1.4189).abs() < 1e-4);
    }

    #[test]
    fn test_kl_of_identical_distributions_is_near_zero() {
        let dist = standard(4, 2);
        let kl = dist.kl_from(&dist.mean, &dist.std);
        assert_eq!(kl.size(), [4]);
        assert!(kl.abs().max().double_value(&[]) < 1e-4);

        let wider = DiagGaussian::new(dist.mean.shallow_clone(), &dist.std * 2.0);
        assert!(wider.kl_from(&dist.mean, &dist.std).min().double_value(&[]) > 0.0);
    }
}
