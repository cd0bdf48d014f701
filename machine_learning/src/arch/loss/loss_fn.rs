use ndarray::{Array4, ArrayView4};

/// A per-output loss over heatmap tensors shaped `[batch, height, width, channels]`.
///
/// Implementations reduce over the channel axis only and then sum over every
/// remaining position, leaving the batch normalization to the caller.
pub trait LossFn {
    fn loss(&self, y_pred: ArrayView4<f32>, y: ArrayView4<f32>) -> f32;
    fn loss_prime(&self, y_pred: ArrayView4<f32>, y: ArrayView4<f32>) -> Array4<f32>;
}
