use std::{mem, num::NonZeroUsize};

use log::debug;
use machine_learning::{
    arch::Model,
    dataset::{Batch, BatchSource},
};
use parameter_server::{optimization::Optimizer, synchronization::Synchronizer};
use tokio::task::JoinSet;

use crate::{
    error::{Phase, Result, TrainErr},
    replica::{Replica, ReplicaReport},
};

/// The running loss of one pass over a dataset.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EpochTotals {
    pub total_loss: f32,
    pub num_batches: usize,
}

impl EpochTotals {
    fn add(&mut self, batch_loss: f32) {
        self.total_loss += batch_loss;
        self.num_batches += 1;
    }

    /// Returns the mean loss per batch.
    ///
    /// # Arguments
    /// * `phase` - The pass these totals belong to.
    /// * `epoch` - The epoch these totals belong to.
    ///
    /// # Returns
    /// The mean, or a `DataExhaustion` error if no batch was seen.
    pub fn mean(&self, phase: Phase, epoch: usize) -> Result<f32> {
        if self.num_batches == 0 {
            return Err(TrainErr::DataExhaustion { phase, epoch });
        }

        Ok(self.total_loss / self.num_batches as f32)
    }
}

/// Reduces the losses of every replica into the loss of the distributed batch.
pub fn reduce_losses(reports: &[ReplicaReport]) -> f32 {
    reports.iter().map(|report| report.loss).sum()
}

/// Drives every replica through full passes over a dataset, one distributed batch at a time.
///
/// For every batch the replicas are moved into their own task together with their shard and
/// handed back once the task is joined, so joining all of them acts as the per-batch barrier.
pub struct EpochDriver<M, O: Optimizer, S> {
    replicas: Vec<Replica<M, O, S>>,
    epoch: usize,
}

impl<M, O, S> EpochDriver<M, O, S>
where
    M: Model + Send + 'static,
    O: Optimizer + Send + 'static,
    S: Synchronizer + Send + Sync + 'static,
{
    /// Creates a new `EpochDriver`.
    ///
    /// # Arguments
    /// * `replicas` - Every replica of the run, ordered by id.
    ///
    /// # Returns
    /// A new `EpochDriver` or a config error if there are no replicas.
    pub fn new(replicas: Vec<Replica<M, O, S>>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(TrainErr::Config("at least one replica is required".into()));
        }

        Ok(Self { replicas, epoch: 0 })
    }

    pub fn replicas(&self) -> &[Replica<M, O, S>] {
        &self.replicas
    }

    /// Sets the epoch reported in progress logs.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// Trains over every batch of `dataset`.
    ///
    /// # Returns
    /// The summed batch losses and the amount of batches.
    pub async fn run_train_epoch<D>(&mut self, dataset: &mut D) -> Result<EpochTotals>
    where
        D: BatchSource + ?Sized,
    {
        let mut totals = EpochTotals::default();

        for (batch_idx, batch) in dataset.batches().enumerate() {
            let batch_loss = self.train_batch(batch_idx, batch).await?;
            totals.add(batch_loss);

            debug!(
                epoch = self.epoch, batch = batch_idx, loss = batch_loss, total = totals.total_loss;
                "train batch done"
            );
        }

        Ok(totals)
    }

    /// Evaluates every batch of `dataset`.
    ///
    /// # Returns
    /// The summed batch losses and the amount of batches.
    pub async fn run_val_epoch<D>(&mut self, dataset: &mut D) -> Result<EpochTotals>
    where
        D: BatchSource + ?Sized,
    {
        let mut totals = EpochTotals::default();

        for (batch_idx, batch) in dataset.batches().enumerate() {
            let batch_loss = self.val_batch(batch).await?;
            totals.add(batch_loss);

            debug!(
                epoch = self.epoch, batch = batch_idx, loss = batch_loss, total = totals.total_loss;
                "validation batch done"
            );
        }

        Ok(totals)
    }

    /// Runs one synchronized training step on every replica.
    ///
    /// # Arguments
    /// * `batch_idx` - The index of the batch within the epoch.
    /// * `batch` - The distributed batch.
    ///
    /// # Returns
    /// The summed loss of every replica.
    pub async fn train_batch(&mut self, batch_idx: usize, batch: Batch) -> Result<f32> {
        let shards = batch.split(self.num_replicas());
        let mut tasks = JoinSet::new();

        for (mut replica, shard) in mem::take(&mut self.replicas).into_iter().zip(shards) {
            tasks.spawn(async move {
                let report = replica.train_step(&shard).await;
                (replica, report)
            });
        }

        let reports = self.join(tasks).await?;
        let versions: Vec<u64> = reports.iter().map(|report| report.version).collect();

        if versions.windows(2).any(|pair| pair[0] != pair[1]) {
            return Err(TrainErr::ReplicaDivergence {
                batch: batch_idx,
                versions,
            });
        }

        Ok(reduce_losses(&reports))
    }

    /// Evaluates one distributed batch, replicas whose shard is empty sit it out.
    ///
    /// # Returns
    /// The summed loss of every replica.
    pub async fn val_batch(&mut self, batch: Batch) -> Result<f32> {
        let shards = batch.split(self.num_replicas());
        let mut tasks = JoinSet::new();

        for (mut replica, shard) in mem::take(&mut self.replicas).into_iter().zip(shards) {
            if shard.is_empty() {
                self.replicas.push(replica);
                continue;
            }

            tasks.spawn(async move {
                let loss = replica.val_step(&shard).await;
                (replica, loss)
            });
        }

        let losses = self.join(tasks).await?;
        Ok(losses.into_iter().sum())
    }

    fn num_replicas(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.replicas.len()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Joins every replica task, putting the replicas and their results back in id order.
    async fn join<T: Send + 'static>(
        &mut self,
        mut tasks: JoinSet<(Replica<M, O, S>, Result<T>)>,
    ) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(tasks.len());

        while let Some(joined) = tasks.join_next().await {
            let (replica, result) = joined.map_err(|e| TrainErr::ReplicaPanicked(e.to_string()))?;
            results.push((replica.id(), result));
            self.replicas.push(replica);
        }

        self.replicas.sort_by_key(Replica::id);
        results.sort_by_key(|(id, _)| *id);
        results.into_iter().map(|(_, result)| result).collect()
    }
}
