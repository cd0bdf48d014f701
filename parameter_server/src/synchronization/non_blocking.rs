use super::Synchronizer;
use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// Skips synchronization between replicas, every gradient is applied as soon as it arrives.
#[derive(Debug, Clone, Default)]
pub struct NoBlockingSync;

impl NoBlockingSync {
    /// Creates a new `NoBlockingSync` synchronizer.
    pub fn new() -> Self {
        Self
    }
}

impl Synchronizer for NoBlockingSync {
    async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<u64>
    where
        O: Optimizer + Send,
    {
        handle.accumulate(grad).await?;
        handle.update_params().await?;
        handle.pull_params(params).await
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::{optimization::GradientDescent, storage::ParameterStore};

    #[tokio::test(flavor = "multi_thread")]
    async fn every_step_updates() {
        let shard_size = NonZeroUsize::new(4).unwrap();
        let store = ParameterStore::new(shard_size, vec![1.; 2], |_| GradientDescent::new(0.5));
        let handle = ParameterHandle::new(store);
        let sync = NoBlockingSync::new();
        let mut params = [0.; 2];

        assert_eq!(sync.step(&handle, &[1., 2.], &mut params).await.unwrap(), 1);
        assert_eq!(params, [0.5, 0.]);

        assert_eq!(sync.step(&handle, &[1., 0.], &mut params).await.unwrap(), 2);
        assert_eq!(params, [0., 0.]);
    }
}
