//! Trajectory storage.
//!
//! Both stores share one buffer core ([`TransitionBuffers`]): preallocated
//! `[time, num_envs, ...]` tensors with a ring cursor. [`RolloutStorage`]
//! holds one on-policy window, [`ReplayStorage`] keeps a multiple of it for
//! offline updates.

mod buffers;
mod minibatch;
mod replay;
mod rollout;
mod trajectories;
mod transition;

pub use buffers::{StorageField, StorageLayout, TransitionBuffers};
pub use minibatch::{MiniBatch, MiniBatchGenerator, RecurrentMiniBatchGenerator};
pub use replay::ReplayStorage;
pub use rollout::{RolloutStatistics, RolloutStorage};
pub use trajectories::{split_and_pad_trajectories, unpad_trajectories};
pub use transition::{HiddenStates, RecurrentState, Transition};
