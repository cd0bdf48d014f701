use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use machine_learning::MlErr;
use parameter_server::storage::SizeMismatchErr;

/// The result type used across the trainer.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// The two passes over the data made on every epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Validation,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Validation => f.write_str("validation"),
        }
    }
}

/// All errors that can stop a training run.
#[derive(Debug)]
pub enum TrainErr {
    /// An epoch's dataset produced no batches.
    DataExhaustion { phase: Phase, epoch: usize },
    /// A checkpoint couldn't be written or read.
    CheckpointIo { path: PathBuf, source: io::Error },
    /// A checkpoint file was read but its content is unusable.
    CheckpointFormat { path: PathBuf, detail: String },
    /// The model, the loss or the data failed, most often on mismatched tensor shapes.
    Model(MlErr),
    /// A gradient or parameter buffer doesn't match the parameter store.
    Storage(SizeMismatchErr),
    /// The replicas observed different parameter versions after a synchronized step.
    ReplicaDivergence { batch: usize, versions: Vec<u64> },
    /// A replica task panicked or was cancelled.
    ReplicaPanicked(String),
    /// The configuration is invalid.
    Config(String),
    /// A metric record couldn't be serialized.
    Metrics(serde_json::Error),
    Io(io::Error),
}

impl Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataExhaustion { phase, epoch } => {
                write!(f, "the {phase} dataset produced no batches on epoch {epoch}")
            }
            Self::CheckpointIo { path, source } => {
                write!(f, "checkpoint {}: {source}", path.display())
            }
            Self::CheckpointFormat { path, detail } => {
                write!(f, "invalid checkpoint {}: {detail}", path.display())
            }
            Self::Model(e) => write!(f, "model error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::ReplicaDivergence { batch, versions } => write!(
                f,
                "replicas diverged after batch {batch}, observed parameter versions {versions:?}"
            ),
            Self::ReplicaPanicked(msg) => write!(f, "replica task failed: {msg}"),
            Self::Config(msg) => write!(f, "invalid config: {msg}"),
            Self::Metrics(e) => write!(f, "metrics error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CheckpointIo { source, .. } => Some(source),
            Self::Model(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Metrics(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for TrainErr {
    fn from(e: MlErr) -> Self {
        Self::Model(e)
    }
}

impl From<SizeMismatchErr> for TrainErr {
    fn from(e: SizeMismatchErr) -> Self {
        Self::Storage(e)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Metrics(e)
    }
}

impl From<io::Error> for TrainErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
