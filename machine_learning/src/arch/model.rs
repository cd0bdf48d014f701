use ndarray::{Array4, ArrayView4};
use rand::Rng;

use crate::error::Result;

/// Whether a forward pass is part of a training step or only an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Inference,
}

/// A heatmap regression network operating on flat parameter buffers.
///
/// The parameters live outside the model so that every replica can pull a synchronized copy of them
/// before each step.
pub trait Model {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize;

    /// Generates a fresh set of parameters for this model.
    ///
    /// # Arguments
    /// * `rng` - The random number generator used for the initialization.
    ///
    /// # Returns
    /// A flat buffer of `size()` parameters.
    fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<f32>;

    /// Makes a forward pass through the network.
    ///
    /// In `Mode::Train` the model keeps whatever it needs to run `backward` afterwards, in
    /// `Mode::Inference` nothing is kept.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `images` - An image batch shaped `[batch, height, width, channels]`.
    /// * `mode` - Training or inference.
    ///
    /// # Returns
    /// One heatmap prediction per supervised stage, or an error if the input doesn't fit the model.
    fn forward(
        &mut self,
        params: &[f32],
        images: ArrayView4<f32>,
        mode: Mode,
    ) -> Result<Vec<Array4<f32>>>;

    /// Computes the gradient of the loss with respect to the parameters of the model for the last
    /// training forward pass.
    ///
    /// # Arguments
    /// * `params` - The model's parameters, the same used in the forward pass.
    /// * `output_grads` - The gradient of the loss with respect to each stage output.
    /// * `grad` - A buffer of `size()` values where the gradient will be written to.
    ///
    /// # Returns
    /// An error if there was no training forward pass or the buffers have unexpected sizes.
    fn backward(
        &mut self,
        params: &[f32],
        output_grads: &[Array4<f32>],
        grad: &mut [f32],
    ) -> Result<()>;
}
