use machine_learning::{
    arch::{
        Mode, Model,
        loss::{Mse, StagedLoss},
    },
    dataset::Batch,
};
use parameter_server::{
    optimization::Optimizer,
    storage::ParameterHandle,
    synchronization::Synchronizer,
};
use tokio::task;

use crate::error::Result;

/// What a replica observed on a single training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicaReport {
    pub loss: f32,
    pub version: u64,
}

/// One data-parallel copy of the model.
///
/// Every replica keeps its own parameter and gradient buffers, the shared state lives in the
/// parameter store behind `handle` and is only reached through the synchronizer.
pub struct Replica<M, O: Optimizer, S> {
    id: usize,
    model: M,
    params: Vec<f32>,
    grad: Vec<f32>,
    handle: ParameterHandle<O>,
    sync: S,
    loss: StagedLoss<Mse>,
    global_batch_size: usize,
}

impl<M, O, S> Replica<M, O, S>
where
    M: Model,
    O: Optimizer + Send,
    S: Synchronizer + Sync,
{
    /// Creates a new `Replica` holding the current parameters of the store.
    ///
    /// # Arguments
    /// * `id` - The replica's index.
    /// * `model` - This replica's copy of the model.
    /// * `handle` - A handle to the shared parameter store.
    /// * `sync` - The synchronizer shared by every replica.
    /// * `global_batch_size` - The amount of samples in a full distributed batch.
    pub fn new(
        id: usize,
        model: M,
        handle: ParameterHandle<O>,
        sync: S,
        global_batch_size: usize,
    ) -> Self {
        let params = handle.snapshot();
        let grad = vec![0.; params.len()];

        Self {
            id,
            model,
            params,
            grad,
            handle,
            sync,
            loss: StagedLoss::new(Mse::new()),
            global_batch_size,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The replica's local copy of the parameters.
    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Runs a synchronized training step over `shard`.
    ///
    /// The replica always takes part in the synchronization, with a zero gradient if its shard
    /// is empty or its computation failed, so the other replicas are never left waiting.
    ///
    /// # Arguments
    /// * `shard` - This replica's slice of the distributed batch.
    ///
    /// # Returns
    /// The replica's loss and the parameter version it pulled.
    pub async fn train_step(&mut self, shard: &Batch) -> Result<ReplicaReport> {
        let computed = if shard.is_empty() {
            Ok(0.)
        } else {
            task::block_in_place(|| self.forward_backward(shard))
        };

        if shard.is_empty() || computed.is_err() {
            self.grad.fill(0.);
        }

        let version = self
            .sync
            .step(&self.handle, &self.grad, &mut self.params)
            .await?;

        Ok(ReplicaReport {
            loss: computed?,
            version,
        })
    }

    /// Evaluates the loss of `shard` without touching the parameters.
    ///
    /// # Arguments
    /// * `shard` - This replica's slice of the distributed batch.
    ///
    /// # Returns
    /// The replica's loss.
    pub async fn val_step(&mut self, shard: &Batch) -> Result<f32> {
        task::block_in_place(|| {
            let outputs = self
                .model
                .forward(&self.params, shard.images.view(), Mode::Inference)?;

            let loss = self
                .loss
                .compute(shard.labels.view(), &outputs, self.global_batch_size)?;

            Ok(loss)
        })
    }

    fn forward_backward(&mut self, shard: &Batch) -> Result<f32> {
        let outputs = self
            .model
            .forward(&self.params, shard.images.view(), Mode::Train)?;

        let (loss, output_grads) =
            self.loss
                .compute_with_grads(shard.labels.view(), &outputs, self.global_batch_size)?;

        self.model.backward(&self.params, &output_grads, &mut self.grad)?;
        Ok(loss)
    }
}
