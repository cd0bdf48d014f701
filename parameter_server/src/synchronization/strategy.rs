use std::num::NonZeroUsize;

use super::{BarrierSync, NoBlockingSync, Synchronizer};
use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// The synchronizer matching the amount of replicas of a training run.
#[derive(Clone)]
pub enum SyncStrategy {
    Barrier(BarrierSync),
    NonBlocking(NoBlockingSync),
}

impl SyncStrategy {
    /// Picks a barrier for several replicas, a single replica needs no synchronization.
    ///
    /// # Arguments
    /// * `replicas` - The amount of replicas taking part in every step.
    pub fn for_replicas(replicas: NonZeroUsize) -> Self {
        match replicas.get() {
            1 => Self::NonBlocking(NoBlockingSync::new()),
            n => Self::Barrier(BarrierSync::new(n)),
        }
    }
}

impl Synchronizer for SyncStrategy {
    async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<u64>
    where
        O: Optimizer + Send,
    {
        match self {
            Self::Barrier(sync) => sync.step(handle, grad, params).await,
            Self::NonBlocking(sync) => sync.step(handle, grad, params).await,
        }
    }
}
