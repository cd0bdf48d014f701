use crate::storage::Result;

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Updates the provided slice of parameters using the accumulated gradients.
    ///
    /// # Arguments
    /// * `grad` - A reference to the model's gradient.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// Returns the learning rate used by the following updates.
    fn learning_rate(&self) -> f32;

    /// Replaces the learning rate, keeping the rest of the optimizer's state untouched.
    ///
    /// # Arguments
    /// * `learning_rate` - The new learning rate.
    fn set_learning_rate(&mut self, learning_rate: f32);
}

/// An optimizer chosen at runtime.
pub type DynOptimizer = Box<dyn Optimizer + Send>;

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        (**self).update_params(grad, params)
    }

    fn learning_rate(&self) -> f32 {
        (**self).learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        (**self).set_learning_rate(learning_rate);
    }
}
