use std::num::NonZeroUsize;

use ndarray::{Array4, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{Batch, BatchSource};
use crate::{MlErr, Result};

/// An already decoded dataset held in memory.
///
/// Batches are cut in order, the last one may be smaller than `batch_size`. When shuffling is
/// enabled the sample order is permuted at the start of every pass.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    images: Array4<f32>,
    labels: Array4<f32>,
    batch_size: NonZeroUsize,
    rng: Option<StdRng>,
}

impl InMemoryDataset {
    /// Creates a new `InMemoryDataset`.
    ///
    /// # Arguments
    /// * `images` - Every image of the dataset, shaped `[n, H, W, 3]`.
    /// * `labels` - Every heatmap label of the dataset, shaped `[n, Hh, Wh, K]`.
    /// * `batch_size` - The amount of samples per (global) batch.
    ///
    /// # Returns
    /// A new `InMemoryDataset` or an error if `images` and `labels` hold a different amount of samples.
    pub fn new(images: Array4<f32>, labels: Array4<f32>, batch_size: NonZeroUsize) -> Result<Self> {
        let (got, expected) = (labels.len_of(Axis(0)), images.len_of(Axis(0)));

        if got != expected {
            return Err(MlErr::SizeMismatch {
                what: "dataset labels",
                got,
                expected,
            });
        }

        Ok(Self {
            images,
            labels,
            batch_size,
            rng: None,
        })
    }

    /// Enables shuffling the samples at the start of every pass.
    ///
    /// # Arguments
    /// * `seed` - A seed for a reproducible order, or `None` to seed from the OS.
    pub fn shuffled(mut self, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        self.rng = Some(rng);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the amount of batches yielded on every pass.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size.get())
    }
}

impl BatchSource for InMemoryDataset {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_> {
        let total = self.len();
        let batch_size = self.batch_size.get();
        let mut indices: Vec<usize> = (0..total).collect();

        if let Some(rng) = self.rng.as_mut() {
            indices.shuffle(rng);
        }

        let (images, labels) = (&self.images, &self.labels);

        let iter = (0..total).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(total);
            let idx = &indices[start..end];

            Batch {
                images: images.select(Axis(0), idx),
                labels: labels.select(Axis(0), idx),
            }
        });

        Box::new(iter)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.num_batches())
    }
}
