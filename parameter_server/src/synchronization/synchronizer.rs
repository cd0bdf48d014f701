use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// Executes a single synchronized parameter update step.
///
/// A `Synchronizer` coordinates how the gradients of every replica are combined into the shared
/// parameters and hands the updated parameters back to each of them.
#[allow(unused)]
#[trait_variant::make(Synchronizer: Send)]
pub trait SynchronizerTemplate: Clone {
    /// Contributes this replica's gradient to the next update and pulls the resulting parameters.
    ///
    /// # Arguments
    /// * `handle` - The parameter handle holding the parameters of the model.
    /// * `grad` - The replica's gradient to accumulate.
    /// * `params` - Where to write the resulting parameters.
    ///
    /// # Returns
    /// The version of the pulled parameters, or an error if there's a size mismatch between
    /// `grad`, `params` and the size of the storage.
    async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<u64>
    where
        O: Optimizer + Send;
}
