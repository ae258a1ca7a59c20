//! Ring buffer of past rollouts for offline fine-tuning.

use super::buffers::{SavedHiddenStates, StorageField, StorageLayout, TransitionBuffers};
use super::minibatch::{MiniBatchGenerator, RecurrentMiniBatchGenerator};
use super::rollout::RolloutStorage;
use tch::Tensor;
use tracing::trace;

/// Copy `source` rows into `target` starting at `step`, wrapping at capacity.
fn copy_wrapped(target: &Tensor, source: &Tensor, step: i64, capacity: i64) {
    let rows = source.size()[0];
    let head = rows.min(capacity - step);
    target.narrow(0, step, head).copy_(&source.narrow(0, 0, head));
    if head < rows {
        let tail = rows - head;
        target.narrow(0, 0, tail).copy_(&source.narrow(0, head, tail));
    }
}

/// Fixed-capacity replay store with the rollout layout.
///
/// Filled by bulk copies from a [`RolloutStorage`] and never cleared. Once
/// full, the oldest rows are overwritten first.
#[derive(Debug)]
pub struct ReplayStorage {
    buffers: TransitionBuffers,
}

impl ReplayStorage {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            buffers: TransitionBuffers::new(layout),
        }
    }

    pub fn buffers(&self) -> &TransitionBuffers {
        &self.buffers
    }

    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    pub fn step(&self) -> usize {
        self.buffers.step()
    }

    pub fn size(&self) -> usize {
        self.buffers.size()
    }

    /// Fraction of the ring holding valid rows
    pub fn fill_ratio(&self) -> f64 {
        self.buffers.size() as f64 / self.buffers.capacity() as f64
    }

    /// Copy the rollout's valid rows for `fields` into the ring.
    ///
    /// Fields missing on either side are skipped. Saved memory is copied with
    /// [`StorageField::HiddenStates`] and allocated here on first use. A
    /// rollout longer than the ring only keeps its last `capacity` rows.
    pub fn transfer_from(&mut self, rollout: &RolloutStorage, fields: &[StorageField]) {
        let source = rollout.buffers();
        let capacity = self.buffers.capacity();
        let mut rows = source.size();
        if rows == 0 {
            return;
        }
        let skip = rows.saturating_sub(capacity) as i64;
        rows = rows.min(capacity);
        let step = self.buffers.step as i64;
        let valid = |t: &Tensor| t.narrow(0, skip, rows as i64);

        for &field in fields {
            if field == StorageField::HiddenStates {
                if let Some((actor, critic)) = source.valid_hidden_states() {
                    let saved = self.buffers.hidden_states.get_or_insert_with(|| {
                        let allocate = |parts: &[Tensor]| -> Vec<Tensor> {
                            parts
                                .iter()
                                .map(|h| {
                                    let mut shape = h.size();
                                    shape[0] = capacity as i64;
                                    Tensor::zeros(shape.as_slice(), (h.kind(), h.device()))
                                })
                                .collect()
                        };
                        SavedHiddenStates {
                            actor: allocate(&actor),
                            critic: allocate(&critic),
                        }
                    });
                    for (target, h) in saved.actor.iter().zip(&actor) {
                        copy_wrapped(target, &valid(h), step, capacity as i64);
                    }
                    for (target, h) in saved.critic.iter().zip(&critic) {
                        copy_wrapped(target, &valid(h), step, capacity as i64);
                    }
                }
                continue;
            }

            if let (Some(target), Some(rows)) = (self.buffers.field(field), source.field(field)) {
                copy_wrapped(target, &valid(rows), step, capacity as i64);
            }
        }

        self.buffers.step = (self.buffers.step + rows) % capacity;
        self.buffers.size = (self.buffers.size + rows).min(capacity);
        trace!(rows, step = self.buffers.step, size = self.buffers.size, "Replay transfer");
    }

    pub fn mini_batch_generator(&self, num_mini_batches: usize, num_epochs: usize) -> MiniBatchGenerator {
        self.buffers.mini_batch_generator(num_mini_batches, num_epochs)
    }

    pub fn recurrent_mini_batch_generator(
        &self,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> RecurrentMiniBatchGenerator {
        self.buffers
            .recurrent_mini_batch_generator(num_mini_batches, num_epochs)
    }
}
