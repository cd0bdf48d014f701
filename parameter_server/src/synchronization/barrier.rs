use std::sync::Arc;

use tokio::sync::Barrier;

use super::Synchronizer;
use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// Synchronizes the replicas on every step using a barrier.
///
/// Every replica accumulates its gradient, the barrier leader applies a single optimizer update
/// and, once it's done, every replica pulls the same parameters.
#[derive(Clone)]
pub struct BarrierSync {
    barrier: Arc<Barrier>,
}

impl BarrierSync {
    /// Creates a new `BarrierSync` synchronizer.
    ///
    /// # Arguments
    /// * `barrier_size` - The amount of replicas taking part in every step.
    pub fn new(barrier_size: usize) -> Self {
        Self {
            barrier: Arc::new(Barrier::new(barrier_size)),
        }
    }
}

impl Synchronizer for BarrierSync {
    async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<u64>
    where
        O: Optimizer + Send,
    {
        // Both waits happen even on error, otherwise the other replicas would hang.
        let accumulated = handle.accumulate(grad).await;

        let updated = if self.barrier.wait().await.is_leader() {
            handle.update_params().await
        } else {
            Ok(())
        };

        self.barrier.wait().await;
        accumulated.and(updated)?;
        handle.pull_params(params).await
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use tokio::task::JoinSet;

    use super::*;
    use crate::{optimization::GradientDescent, storage::ParameterStore};

    #[tokio::test(flavor = "multi_thread")]
    async fn replicas_share_one_update() {
        const REPLICAS: usize = 3;

        let shard_size = NonZeroUsize::new(2).unwrap();
        let store = ParameterStore::new(shard_size, vec![0.; 3], |_| GradientDescent::new(1.));
        let handle = ParameterHandle::new(store);
        let sync = BarrierSync::new(REPLICAS);

        let mut tasks = JoinSet::new();

        for id in 0..REPLICAS {
            let (handle, sync) = (handle.clone(), sync.clone());

            tasks.spawn(async move {
                let grad = vec![id as f32; 3];
                let mut params = vec![0.; 3];
                let version = sync.step(&handle, &grad, &mut params).await.unwrap();
                (version, params)
            });
        }

        let results = tasks.join_all().await;

        // 0 + 1 + 2 with a learning rate of 1
        for (version, params) in results {
            assert_eq!(version, 1);
            assert_eq!(params, [-3.0; 3]);
        }
    }
}
