//! Environment contract.
//!
//! Provides the `VecEnv` trait a batched simulator implements to be driven
//! by the learning algorithm, plus the step payload it returns.

mod traits;

pub use traits::{EnvStep, StepInfo, VecEnv};
