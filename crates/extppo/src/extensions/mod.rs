//! Optional learning extensions.
//!
//! - `RandomNetworkDistillation` - intrinsic reward from prediction error
//! - `SymmetryAugmentation` - mirrored copies of minibatches
//! - `ExpertEnsemble` - cloning targets from frozen expert policies

mod expert;
mod normalizer;
mod rnd;
mod symmetry;

pub use expert::{
    Expert, ExpertEnsemble, ExpertEnvMapping, ExpertLoader, ExpertLoaderRegistry,
    ExpertObservationFn, TorchScriptExpert,
};
pub use normalizer::EmpiricalNormalization;
pub use rnd::RandomNetworkDistillation;
pub use symmetry::{SignFlipSymmetry, SymmetryAugmentation, SymmetryRegistry};
