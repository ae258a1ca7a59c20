//! Splitting time-major buffers into padded per-episode trajectories.

use tch::{Kind, Tensor};

/// Split `[time, num_envs, ...]` data at done flags and pad every trajectory
/// to the full time length.
///
/// Trajectories are enumerated env-major: all segments of instance 0 in time
/// order, then instance 1, and so on. The last row is treated as done so no
/// trajectory crosses an instance boundary.
///
/// # Returns
/// `(padded, masks)` where `padded` is `[time, num_trajectories, ...]` and
/// `masks` is a boolean `[time, num_trajectories]` validity mask.
pub fn split_and_pad_trajectories(tensor: &Tensor, dones: &Tensor) -> (Tensor, Tensor) {
    let size = tensor.size();
    let steps = size[0];
    let num_envs = size[1];
    let device = tensor.device();
    let total = steps * num_envs;

    let dones = dones.reshape([steps, num_envs]).to_kind(Kind::Int64).copy();
    let _ = dones.get(steps - 1).fill_(1i64);
    let flat_dones = dones.transpose(1, 0).reshape([-1]);

    let done_indices = Tensor::cat(
        &[
            Tensor::from_slice(&[-1i64]).to_device(device),
            flat_dones.nonzero().select(1, 0),
        ],
        0,
    );
    let num_trajectories = done_indices.size()[0] - 1;
    let trajectory_starts = done_indices.narrow(0, 0, num_trajectories) + 1i64;
    let trajectory_lengths =
        done_indices.narrow(0, 1, num_trajectories) - done_indices.narrow(0, 0, num_trajectories);

    // Trajectory id and in-trajectory position of every flat element
    let start_flags = Tensor::cat(
        &[
            Tensor::ones([1], (Kind::Int64, device)),
            flat_dones.narrow(0, 0, total - 1),
        ],
        0,
    );
    let trajectory_ids = start_flags.cumsum(0, Kind::Int64) - 1i64;
    let positions = Tensor::arange(total, (Kind::Int64, device))
        - trajectory_starts.index_select(0, &trajectory_ids);

    let flat = tensor.transpose(1, 0).flatten(0, 1);
    let mut padded_shape = vec![steps, num_trajectories];
    padded_shape.extend_from_slice(&size[2..]);
    let mut padded = Tensor::zeros(padded_shape.as_slice(), (tensor.kind(), device));
    let _ = padded.index_put_(&[Some(positions), Some(trajectory_ids)], &flat, false);

    let masks = trajectory_lengths
        .unsqueeze(0)
        .gt_tensor(&Tensor::arange(steps, (Kind::Int64, device)).unsqueeze(1));

    (padded, masks)
}

/// Inverse of [`split_and_pad_trajectories`]: gather the valid entries back
/// into a `[time, num_envs, ...]` layout.
pub fn unpad_trajectories(trajectories: &Tensor, masks: &Tensor) -> Tensor {
    let size = trajectories.size();
    let steps = size[0];

    let flat = trajectories.transpose(1, 0).flatten(0, 1);
    let valid = masks.transpose(1, 0).reshape([-1]).nonzero().squeeze_dim(1);

    let mut shape = vec![-1, steps];
    shape.extend_from_slice(&size[2..]);
    flat.index_select(0, &valid)
        .reshape(shape.as_slice())
        .transpose(1, 0)
}
