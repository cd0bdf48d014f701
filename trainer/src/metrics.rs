use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainErr};

pub const TRAIN_LOSS_TAG: &str = "epoch train loss";
pub const VAL_LOSS_TAG: &str = "epoch val loss";

/// The name of the scalar log inside the log directory.
pub const SCALARS_FILE: &str = "scalars.jsonl";

/// A single logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub step: usize,
    pub value: f32,
    pub wall_time: f64,
}

/// Appends scalar summaries as JSON lines to `<log_dir>/scalars.jsonl`.
#[derive(Debug)]
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SummaryWriter {
    /// Opens the scalar log inside `log_dir`, creating both if they don't exist yet.
    pub fn new(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)?;

        let path = log_dir.join(SCALARS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `value` under `tag` at `step` and flushes it.
    pub fn add_scalar(&mut self, tag: &str, step: usize, value: f32) -> Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let record = ScalarRecord {
            tag: tag.to_string(),
            step,
            value,
            wall_time,
        };

        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads every record of a scalar log.
pub fn read_scalars(path: &Path) -> Result<Vec<ScalarRecord>> {
    let content = fs::read_to_string(path)?;

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TrainErr::from))
        .collect()
}
