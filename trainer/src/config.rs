use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use clap::{Parser, ValueEnum};
use parameter_server::optimization::{
    Adam, DynOptimizer, GradientDescent, GradientDescentWithMomentum,
};
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::DEFAULT_MODEL_VERSION,
    error::{Result, TrainErr},
    scheduler::{DEFAULT_DECAY_FACTOR, DEFAULT_MAX_PATIENCE},
};

/// The optimization algorithm applied by the parameter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
    Momentum,
}

impl OptimizerKind {
    /// Builds an optimizer for a shard of `len` parameters.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters of the shard.
    /// * `learning_rate` - The initial learning rate.
    /// * `momentum` - Only used by `Momentum`.
    pub fn build(self, len: usize, learning_rate: f32, momentum: f32) -> DynOptimizer {
        match self {
            Self::Adam => Box::new(Adam::with_defaults(len, learning_rate)),
            Self::Sgd => Box::new(GradientDescent::new(learning_rate)),
            Self::Momentum => Box::new(GradientDescentWithMomentum::new(
                len,
                learning_rate,
                momentum,
            )),
        }
    }
}

/// Every setting of a training run.
///
/// It can be read from a JSON file, missing fields take their default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub start_epoch: usize,
    pub learning_rate: f32,
    pub replicas: usize,
    /// Samples per replica, the global batch holds `replicas * batch_size` samples.
    pub batch_size: usize,
    pub image_shape: (usize, usize, usize),
    pub heatmap_shape: (usize, usize, usize),
    pub stages: usize,
    pub optimizer: OptimizerKind,
    pub momentum: f32,
    pub shard_size: usize,
    pub max_patience: usize,
    pub decay_factor: f32,
    pub models_dir: PathBuf,
    pub model_version: String,
    pub log_dir: PathBuf,
    pub data_dir: PathBuf,
    pub checkpoint: Option<PathBuf>,
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 120,
            start_epoch: 1,
            learning_rate: 0.00025,
            replicas: 1,
            batch_size: 32,
            image_shape: (256, 256, 3),
            heatmap_shape: (64, 64, 16),
            stages: 4,
            optimizer: OptimizerKind::Adam,
            momentum: 0.9,
            shard_size: 1 << 16,
            max_patience: DEFAULT_MAX_PATIENCE,
            decay_factor: DEFAULT_DECAY_FACTOR,
            models_dir: PathBuf::from("./models"),
            model_version: DEFAULT_MODEL_VERSION.to_string(),
            log_dir: PathBuf::from("./logs/"),
            data_dir: PathBuf::from("./data"),
            checkpoint: None,
            seed: None,
        }
    }
}

impl TrainerConfig {
    /// Reads a config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| TrainErr::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Checks the config for values that can't be trained with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("epochs", self.epochs),
            ("start_epoch", self.start_epoch),
            ("replicas", self.replicas),
            ("batch_size", self.batch_size),
            ("stages", self.stages),
            ("shard_size", self.shard_size),
        ];

        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(TrainErr::Config(format!("{name} must be positive")));
        }

        if !self.learning_rate.is_finite() || self.learning_rate <= 0. {
            return Err(TrainErr::Config("learning_rate must be positive".into()));
        }

        if !self.decay_factor.is_finite() || self.decay_factor <= 0. {
            return Err(TrainErr::Config("decay_factor must be positive".into()));
        }

        let (h, w, c) = self.image_shape;
        let (hh, wh, k) = self.heatmap_shape;

        if [h, w, c, hh, wh, k].contains(&0) {
            return Err(TrainErr::Config("shapes can't have empty dimensions".into()));
        }

        if h % hh != 0 || w % wh != 0 {
            return Err(TrainErr::Config(format!(
                "the image size {h}x{w} isn't a multiple of the heatmap size {hh}x{wh}"
            )));
        }

        Ok(())
    }

    /// Returns the amount of samples of a distributed batch.
    pub fn global_batch_size(&self) -> usize {
        self.replicas * self.batch_size
    }

    pub fn replicas(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.replicas)
            .ok_or_else(|| TrainErr::Config("replicas must be positive".into()))
    }

    pub fn stages(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.stages)
            .ok_or_else(|| TrainErr::Config("stages must be positive".into()))
    }

    pub fn shard_size(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.shard_size)
            .ok_or_else(|| TrainErr::Config("shard_size must be positive".into()))
    }

    /// Builds the optimizer of a store shard of `len` parameters.
    pub fn build_optimizer(&self, len: usize) -> DynOptimizer {
        self.optimizer.build(len, self.learning_rate, self.momentum)
    }
}

/// Command line arguments of the trainer.
///
/// Flags take precedence over the values of `--config`, which in turn take precedence over the
/// defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "trainer", about = "Train a multi-stage heatmap regression model")]
pub struct Cli {
    /// JSON file with the full training config.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Last epoch to train [default: 120].
    #[arg(long)]
    pub epochs: Option<usize>,
    /// First epoch to train, used when resuming [default: 1].
    #[arg(long)]
    pub start_epoch: Option<usize>,
    /// Checkpoint to resume the parameters from.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Initial learning rate [default: 0.00025].
    #[arg(long)]
    pub learning_rate: Option<f32>,
    /// Directory with the `train*` and `val*` record files.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Amount of data-parallel replicas.
    #[arg(long)]
    pub replicas: Option<usize>,
    /// Optimization algorithm.
    #[arg(long, value_enum)]
    pub optimizer: Option<OptimizerKind>,
}

impl Cli {
    /// Resolves the final config from the config file, the flags and the defaults.
    ///
    /// # Returns
    /// A validated config.
    pub fn into_config(self) -> Result<TrainerConfig> {
        let mut config = match &self.config {
            Some(path) => TrainerConfig::from_file(path)?,
            None => TrainerConfig::default(),
        };

        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(start_epoch) = self.start_epoch {
            config.start_epoch = start_epoch;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(replicas) = self.replicas {
            config.replicas = replicas;
        }
        if let Some(optimizer) = self.optimizer {
            config.optimizer = optimizer;
        }
        if let Some(checkpoint) = self.checkpoint {
            config.checkpoint = Some(checkpoint);
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use parameter_server::optimization::Optimizer;

    use super::*;

    #[test]
    fn defaults_match_the_reference_run() {
        let config = TrainerConfig::default();

        assert_eq!(config.epochs, 120);
        assert_eq!(config.start_epoch, 1);
        assert_eq!(config.learning_rate, 0.00025);
        assert_eq!(config.image_shape, (256, 256, 3));
        assert_eq!(config.heatmap_shape, (64, 64, 16));
        assert_eq!(config.stages, 4);
        assert_eq!(config.max_patience, 5);
        assert_eq!(config.decay_factor, 5.);
        assert_eq!(config.models_dir, PathBuf::from("./models"));
        assert_eq!(config.model_version, "1.0.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn flags_override_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{ "epochs": 10, "replicas": 2, "optimizer": "sgd" }"#).unwrap();

        let cli = Cli::parse_from([
            "trainer",
            "--config",
            path.to_str().unwrap(),
            "--epochs",
            "3",
            "--learning-rate",
            "0.1",
        ]);
        let config = cli.into_config().unwrap();

        assert_eq!(config.epochs, 3);
        assert_eq!(config.replicas, 2);
        assert_eq!(config.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.learning_rate, 0.1);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.global_batch_size(), 64);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_replicas = TrainerConfig {
            replicas: 0,
            ..Default::default()
        };
        assert!(matches!(zero_replicas.validate(), Err(TrainErr::Config(_))));

        let uneven = TrainerConfig {
            image_shape: (100, 100, 3),
            heatmap_shape: (64, 64, 16),
            ..Default::default()
        };
        assert!(uneven.validate().is_err());

        let cli = Cli::parse_from(["trainer", "--epochs", "0"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ epochs: ").unwrap();

        assert!(matches!(
            TrainerConfig::from_file(&path),
            Err(TrainErr::Config(_))
        ));
    }

    #[test]
    fn optimizers_start_with_the_configured_learning_rate() {
        for kind in [OptimizerKind::Adam, OptimizerKind::Sgd, OptimizerKind::Momentum] {
            let optimizer = kind.build(4, 0.01, 0.9);
            assert_eq!(optimizer.learning_rate(), 0.01);
        }
    }
}
