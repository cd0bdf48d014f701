use std::num::NonZeroUsize;

use ndarray::{Array4, Axis, Slice};

use super::shard_range;
use crate::{MlErr, Result};

/// A batch of training data: images shaped `[batch, H, W, 3]` and heatmap labels shaped
/// `[batch, Hh, Wh, K]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Array4<f32>,
}

impl Batch {
    /// Creates a new `Batch`.
    ///
    /// # Arguments
    /// * `images` - The input images.
    /// * `labels` - The ground truth heatmaps.
    ///
    /// # Returns
    /// A new `Batch` or an error if both tensors hold a different amount of samples.
    pub fn new(images: Array4<f32>, labels: Array4<f32>) -> Result<Self> {
        let (got, expected) = (labels.len_of(Axis(0)), images.len_of(Axis(0)));

        if got != expected {
            return Err(MlErr::SizeMismatch {
                what: "batch labels",
                got,
                expected,
            });
        }

        Ok(Self { images, labels })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits the batch along the sample axis into one shard per replica.
    ///
    /// # Arguments
    /// * `replicas` - The amount of shards to create.
    ///
    /// # Returns
    /// `replicas` balanced shards; trailing shards are empty if there are fewer samples than replicas.
    pub fn split(&self, replicas: NonZeroUsize) -> Vec<Batch> {
        let total = self.len();

        (0..replicas.get())
            .map(|id| {
                let range = shard_range(total, id, replicas.get());
                let slice = Slice::from(range);

                Batch {
                    images: self.images.slice_axis(Axis(0), slice).to_owned(),
                    labels: self.labels.slice_axis(Axis(0), slice).to_owned(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> Batch {
        let images = Array4::from_shape_fn((n, 2, 2, 3), |(b, ..)| b as f32);
        let labels = Array4::from_shape_fn((n, 1, 1, 2), |(b, ..)| b as f32);
        Batch::new(images, labels).unwrap()
    }

    #[test]
    fn mismatched_sample_counts_fail() {
        let images = Array4::zeros((2, 2, 2, 3));
        let labels = Array4::zeros((3, 1, 1, 2));
        assert!(Batch::new(images, labels).is_err());
    }

    #[test]
    fn split_keeps_samples_in_order() {
        let shards = batch(5).split(NonZeroUsize::new(2).unwrap());

        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].len(), 3);
        assert_eq!(shards[1].len(), 2);
        assert_eq!(shards[1].images[[0, 0, 0, 0]], 3.0);
        assert_eq!(shards[1].labels[[1, 0, 0, 0]], 4.0);
    }

    #[test]
    fn split_with_fewer_samples_than_replicas() {
        let shards = batch(1).split(NonZeroUsize::new(3).unwrap());

        assert_eq!(shards.iter().map(Batch::len).collect::<Vec<_>>(), [1, 0, 0]);
        assert!(shards[2].is_empty());
    }
}
