use std::path::PathBuf;

use log::{info, warn};
use machine_learning::{arch::Model, dataset::BatchSource};
use parameter_server::{
    optimization::Optimizer,
    storage::{ParameterHandle, ParameterStore, SizeMismatchErr},
    synchronization::SyncStrategy,
};
use tokio::runtime::Runtime;

use crate::{
    checkpoint::CheckpointManager,
    config::TrainerConfig,
    epoch::EpochDriver,
    error::{Phase, Result},
    metrics::{SummaryWriter, TRAIN_LOSS_TAG, VAL_LOSS_TAG},
    replica::Replica,
    scheduler::PlateauScheduler,
    state::TrainingState,
};

/// The outcome of a finished training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub state: TrainingState,
    pub checkpoints: Vec<PathBuf>,
    pub params: Vec<f32>,
}

/// A full training run: every epoch from the start epoch to the last one, followed by the final
/// checkpoint.
///
/// The session owns the runtime its replicas run on and blocks on it until the run finishes.
pub struct Session<M, O: Optimizer> {
    runtime: Runtime,
    training: Training<M, O>,
}

struct Training<M, O: Optimizer> {
    driver: EpochDriver<M, O, SyncStrategy>,
    handle: ParameterHandle<O>,
    scheduler: PlateauScheduler,
    checkpoints: CheckpointManager,
    summary: SummaryWriter,
    state: TrainingState,
    start_epoch: usize,
    epochs: usize,
    train_data: Box<dyn BatchSource>,
    val_data: Box<dyn BatchSource>,
}

impl<M, O> Session<M, O>
where
    M: Model + Clone + Send + 'static,
    O: Optimizer + Send + 'static,
{
    /// Creates a new `Session`.
    ///
    /// # Arguments
    /// * `config` - The training config.
    /// * `model` - The model, cloned once per replica.
    /// * `params` - The initial parameters, fresh or restored from a checkpoint.
    /// * `optimizer_factory` - Builds the optimizer of a store shard given its amount of parameters.
    /// * `train_data` - The training batches, global batch sized.
    /// * `val_data` - The validation batches, global batch sized.
    ///
    /// # Returns
    /// A new `Session` or an error if the config is invalid or the parameters don't fit the model.
    pub fn new<F>(
        config: &TrainerConfig,
        model: M,
        params: Vec<f32>,
        optimizer_factory: F,
        train_data: Box<dyn BatchSource>,
        val_data: Box<dyn BatchSource>,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> O,
    {
        config.validate()?;

        if params.len() != model.size() {
            return Err(SizeMismatchErr.into());
        }

        let replicas = config.replicas()?;
        let store = ParameterStore::new(config.shard_size()?, params, optimizer_factory);
        let handle = ParameterHandle::new(store);
        let sync = SyncStrategy::for_replicas(replicas);

        let replicas = (0..replicas.get())
            .map(|id| {
                Replica::new(
                    id,
                    model.clone(),
                    handle.clone(),
                    sync.clone(),
                    config.global_batch_size(),
                )
            })
            .collect();

        let training = Training {
            driver: EpochDriver::new(replicas)?,
            handle,
            scheduler: PlateauScheduler::new(config.decay_factor),
            checkpoints: CheckpointManager::new(&config.models_dir, &config.model_version),
            summary: SummaryWriter::new(&config.log_dir)?,
            state: TrainingState::new(config.start_epoch, config.learning_rate, config.max_patience),
            start_epoch: config.start_epoch,
            epochs: config.epochs,
            train_data,
            val_data,
        };

        Ok(Self {
            runtime: Runtime::new()?,
            training,
        })
    }

    /// Runs the whole training and waits for it to finish.
    ///
    /// # Returns
    /// The final state, every checkpoint written and the trained parameters.
    pub fn run(self) -> Result<TrainingReport> {
        let Self { runtime, training } = self;
        runtime.block_on(training.run())
    }
}

impl<M, O> Training<M, O>
where
    M: Model + Send + 'static,
    O: Optimizer + Send + 'static,
{
    async fn run(mut self) -> Result<TrainingReport> {
        info!(
            start_epoch = self.start_epoch, epochs = self.epochs,
            replicas = self.driver.replicas().len(), params = self.handle.len();
            "starting training"
        );

        if self.start_epoch > self.epochs {
            warn!(
                start_epoch = self.start_epoch, epochs = self.epochs;
                "start epoch is past the last epoch, only the final checkpoint will be saved"
            );
        }

        for epoch in self.start_epoch..=self.epochs {
            self.run_epoch(epoch).await?;
        }

        let params = self.handle.snapshot();
        self.checkpoints
            .save_final(self.epochs, self.state.last_val_loss, &params)?;

        info!(
            lowest_val_loss = self.state.lowest_val_loss,
            checkpoints = self.checkpoints.saved().len();
            "training finished"
        );

        Ok(TrainingReport {
            state: self.state,
            checkpoints: self.checkpoints.saved().to_vec(),
            params,
        })
    }

    async fn run_epoch(&mut self, epoch: usize) -> Result<()> {
        self.state.current_epoch = epoch;
        self.driver.set_epoch(epoch);

        let learning_rate = self.scheduler.apply(&mut self.state, &self.handle);
        info!(epoch = epoch, learning_rate = learning_rate; "start epoch with learning rate");

        let train_loss = self
            .driver
            .run_train_epoch(&mut *self.train_data)
            .await?
            .mean(Phase::Train, epoch)?;

        info!(epoch = epoch, loss = train_loss; "epoch train loss");
        self.summary.add_scalar(TRAIN_LOSS_TAG, epoch, train_loss)?;

        let val_loss = self
            .driver
            .run_val_epoch(&mut *self.val_data)
            .await?
            .mean(Phase::Validation, epoch)?;

        info!(epoch = epoch, loss = val_loss; "epoch val loss");
        self.summary.add_scalar(VAL_LOSS_TAG, epoch, val_loss)?;

        let params = self.handle.snapshot();
        self.checkpoints
            .maybe_save(epoch, val_loss, self.state.lowest_val_loss, &params)?;

        self.state.record_val_loss(val_loss);
        Ok(())
    }
}
