use ndarray::{Array4, ArrayView4};

use super::LossFn;
use crate::{MlErr, Result};

/// Aggregates a per-output loss over every supervised stage of a model.
///
/// Each stage's loss is summed over all positions, the stage totals are added
/// up and the result is scaled by `1 / global_batch_size`, which keeps the
/// value comparable when the amount of replicas changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StagedLoss<L: LossFn> {
    loss_fn: L,
}

impl<L: LossFn> StagedLoss<L> {
    /// Creates a new `StagedLoss`.
    ///
    /// # Arguments
    /// * `loss_fn` - The loss applied to every stage output.
    ///
    /// # Returns
    /// A new `StagedLoss` instance.
    pub fn new(loss_fn: L) -> Self {
        Self { loss_fn }
    }

    /// Computes the aggregated loss.
    ///
    /// # Arguments
    /// * `labels` - The ground truth heatmaps.
    /// * `outputs` - One predicted heatmap tensor per stage.
    /// * `global_batch_size` - The amount of samples in the distributed batch.
    ///
    /// # Returns
    /// The scalar loss, or an error if there are no outputs or any of them has a different shape
    /// than `labels`.
    pub fn compute(
        &self,
        labels: ArrayView4<f32>,
        outputs: &[Array4<f32>],
        global_batch_size: usize,
    ) -> Result<f32> {
        let scale = Self::validate(labels, outputs, global_batch_size)?;

        let total: f32 = outputs
            .iter()
            .map(|output| self.loss_fn.loss(output.view(), labels))
            .sum();

        Ok(total * scale)
    }

    /// Computes the aggregated loss and its gradient with respect to every stage output.
    ///
    /// # Arguments
    /// * `labels` - The ground truth heatmaps.
    /// * `outputs` - One predicted heatmap tensor per stage.
    /// * `global_batch_size` - The amount of samples in the distributed batch.
    ///
    /// # Returns
    /// A tuple with the scalar loss and one gradient tensor per stage.
    pub fn compute_with_grads(
        &self,
        labels: ArrayView4<f32>,
        outputs: &[Array4<f32>],
        global_batch_size: usize,
    ) -> Result<(f32, Vec<Array4<f32>>)> {
        let scale = Self::validate(labels, outputs, global_batch_size)?;

        let mut total = 0.0;
        let mut grads = Vec::with_capacity(outputs.len());

        for output in outputs {
            total += self.loss_fn.loss(output.view(), labels);
            grads.push(self.loss_fn.loss_prime(output.view(), labels) * scale);
        }

        Ok((total * scale, grads))
    }

    fn validate(
        labels: ArrayView4<f32>,
        outputs: &[Array4<f32>],
        global_batch_size: usize,
    ) -> Result<f32> {
        if global_batch_size == 0 {
            return Err(MlErr::InvalidInput("the global batch size must be positive"));
        }

        if outputs.is_empty() {
            return Err(MlErr::SizeMismatch {
                what: "model outputs",
                got: 0,
                expected: 1,
            });
        }

        for output in outputs {
            if output.shape() != labels.shape() {
                return Err(MlErr::ShapeMismatch {
                    what: "model output and labels",
                    got: output.shape().to_vec(),
                    expected: labels.shape().to_vec(),
                });
            }
        }

        Ok(1.0 / global_batch_size as f32)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;
    use crate::arch::loss::Mse;

    fn labels() -> Array4<f32> {
        Array4::zeros((2, 2, 2, 2))
    }

    #[test]
    fn sums_every_stage_and_scales_by_global_batch() {
        let staged = StagedLoss::new(Mse);
        let outputs = vec![
            Array4::from_elem((2, 2, 2, 2), 1.0),
            Array4::from_elem((2, 2, 2, 2), 2.0),
        ];

        // Stage totals are 8 * 1 and 8 * 4.
        let loss = staged.compute(labels().view(), &outputs, 4).unwrap();
        assert_eq!(loss, (8.0 + 32.0) / 4.0);
    }

    #[test]
    fn scaling_the_global_batch_scales_the_loss_inversely() {
        let staged = StagedLoss::new(Mse);
        let outputs = vec![Array4::from_elem((2, 2, 2, 2), 0.5)];

        let base = staged.compute(labels().view(), &outputs, 2).unwrap();
        let scaled = staged.compute(labels().view(), &outputs, 6).unwrap();
        assert!((base / 3.0 - scaled).abs() < 1e-6);
    }

    #[test]
    fn grads_match_each_stage() {
        let staged = StagedLoss::new(Mse);
        let outputs = vec![
            Array4::from_elem((2, 2, 2, 2), 1.0),
            Array4::from_elem((2, 2, 2, 2), -1.0),
        ];

        let (loss, grads) = staged
            .compute_with_grads(labels().view(), &outputs, 2)
            .unwrap();

        assert_eq!(loss, 8.0);
        assert_eq!(grads.len(), 2);
        assert!(grads[0].iter().all(|&g| g == 0.5));
        assert!(grads[1].iter().all(|&g| g == -0.5));
    }

    #[test]
    fn mismatched_stage_shape_fails() {
        let staged = StagedLoss::new(Mse);
        let outputs = vec![Array4::zeros((2, 2, 2, 3))];

        let err = staged.compute(labels().view(), &outputs, 2).unwrap_err();
        assert!(matches!(err, MlErr::ShapeMismatch { .. }));
    }

    #[test]
    fn no_outputs_fails() {
        let staged = StagedLoss::new(Mse);
        assert!(staged.compute(labels().view(), &[], 2).is_err());
    }
}
