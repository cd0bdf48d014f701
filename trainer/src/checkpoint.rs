use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::info;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::error::{Result, TrainErr};

/// Name of the parameter tensor inside a checkpoint file.
pub const PARAMS_TENSOR: &str = "params";

pub const DEFAULT_MODEL_VERSION: &str = "1.0.0";

/// Persists the model's parameters whenever the validation loss reaches a new minimum and once
/// more at the end of the run.
///
/// Checkpoints are written to a hidden temporary sibling first and then renamed, so a file with
/// a checkpoint's name is always complete. Files are never deleted.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    version: String,
    saved: Vec<PathBuf>,
}

impl CheckpointManager {
    /// Creates a new `CheckpointManager`.
    ///
    /// # Arguments
    /// * `dir` - The directory the checkpoints are written to, created on the first save.
    /// * `version` - The model version embedded in every file name.
    pub fn new(dir: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            version: version.into(),
            saved: Vec::new(),
        }
    }

    /// Every checkpoint written so far, in order.
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }

    /// Returns the file name of the checkpoint for `epoch` and `val_loss`.
    pub fn file_name(&self, epoch: usize, val_loss: f32) -> String {
        format!(
            "model-v{}-epoch-{epoch}-loss-{val_loss:.4}.safetensors",
            self.version
        )
    }

    /// Saves `params` only if `val_loss` improves on the lowest validation loss seen before.
    ///
    /// # Arguments
    /// * `epoch` - The epoch that just finished.
    /// * `val_loss` - That epoch's validation loss.
    /// * `lowest_val_loss` - The lowest validation loss of the previous epochs.
    /// * `params` - The model's parameters.
    ///
    /// # Returns
    /// The path of the new checkpoint, `None` if nothing was saved.
    pub fn maybe_save(
        &mut self,
        epoch: usize,
        val_loss: f32,
        lowest_val_loss: f32,
        params: &[f32],
    ) -> Result<Option<PathBuf>> {
        if val_loss < lowest_val_loss {
            self.save(epoch, val_loss, params).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Saves `params` unconditionally, tagged with the final epoch and the last validation loss.
    pub fn save_final(&mut self, epoch: usize, last_val_loss: f32, params: &[f32]) -> Result<PathBuf> {
        self.save(epoch, last_val_loss, params)
    }

    fn save(&mut self, epoch: usize, val_loss: f32, params: &[f32]) -> Result<PathBuf> {
        let name = self.file_name(epoch, val_loss);
        let path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!(".{name}.tmp"));

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let metadata = HashMap::from([
            ("epoch".to_string(), epoch.to_string()),
            ("val_loss".to_string(), val_loss.to_string()),
            ("version".to_string(), self.version.clone()),
        ]);

        let view = TensorView::new(Dtype::F32, vec![params.len()], bytemuck::cast_slice(params))
            .map_err(|e| TrainErr::CheckpointFormat {
                path: path.clone(),
                detail: e.to_string(),
            })?;

        let bytes = safetensors::serialize([(PARAMS_TENSOR, view)], &Some(metadata)).map_err(|e| {
            TrainErr::CheckpointFormat {
                path: path.clone(),
                detail: e.to_string(),
            }
        })?;

        replace_file(&tmp_path, &path, &bytes)?;

        info!(epoch = epoch, val_loss = val_loss, path:% = path.display(); "saved checkpoint");
        self.saved.push(path.clone());
        Ok(path)
    }

    /// Reads the parameters stored in a checkpoint.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `expected_len` - The amount of parameters of the model being restored.
    ///
    /// # Returns
    /// The parameters, or an error if the file can't be read or doesn't fit the model.
    pub fn load(path: &Path, expected_len: usize) -> Result<Vec<f32>> {
        let format_err = |detail: String| TrainErr::CheckpointFormat {
            path: path.to_path_buf(),
            detail,
        };

        let bytes = fs::read(path).map_err(|source| TrainErr::CheckpointIo {
            path: path.to_path_buf(),
            source,
        })?;

        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| format_err(e.to_string()))?;
        let view = tensors
            .tensor(PARAMS_TENSOR)
            .map_err(|e| format_err(e.to_string()))?;

        if view.dtype() != Dtype::F32 {
            return Err(format_err(format!("expected F32 params, got {:?}", view.dtype())));
        }

        let params: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());

        if params.len() != expected_len {
            return Err(format_err(format!(
                "the model has {expected_len} parameters, the checkpoint holds {}",
                params.len()
            )));
        }

        info!(path:% = path.display(), params = params.len(); "restored checkpoint");
        Ok(params)
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> TrainErr + use<> {
    let path = path.to_path_buf();
    move |source| TrainErr::CheckpointIo { path, source }
}

/// Writes `bytes` to `tmp_path`, flushes it to disk and renames it to `path`.
///
/// On failure the temporary file is removed and `path` is left untouched.
fn replace_file(tmp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let result = File::create(tmp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(io_err(tmp_path))
        .and_then(|()| fs::rename(tmp_path, path).map_err(io_err(path)));

    if result.is_err() {
        let _ = fs::remove_file(tmp_path);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_follow_the_model_version() {
        let manager = CheckpointManager::new("models", DEFAULT_MODEL_VERSION);

        assert_eq!(
            manager.file_name(3, 0.123456),
            "model-v1.0.0-epoch-3-loss-0.1235.safetensors"
        );
        assert_eq!(
            manager.file_name(120, f32::INFINITY),
            "model-v1.0.0-epoch-120-loss-inf.safetensors"
        );
    }

    #[test]
    fn saves_only_strict_improvements() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(tmp.path().join("models"), "2.0.0");
        let params = [1.0, 2.0];

        assert!(manager.maybe_save(1, 0.5, f32::INFINITY, &params).unwrap().is_some());
        assert!(manager.maybe_save(2, 0.5, 0.5, &params).unwrap().is_none());
        assert!(manager.maybe_save(3, 0.6, 0.5, &params).unwrap().is_none());
        assert!(manager.maybe_save(4, 0.4, 0.5, &params).unwrap().is_some());

        assert_eq!(manager.saved().len(), 2);
    }

    #[test]
    fn saved_checkpoints_can_be_restored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(tmp.path(), DEFAULT_MODEL_VERSION);
        let params = [0.25, -1.5, 3.0];

        let path = manager.save_final(7, 0.75, &params).unwrap();

        assert!(path.ends_with("model-v1.0.0-epoch-7-loss-0.7500.safetensors"));
        assert_eq!(CheckpointManager::load(&path, 3).unwrap(), params);
        assert!(matches!(
            CheckpointManager::load(&path, 4),
            Err(TrainErr::CheckpointFormat { .. })
        ));
    }

    #[test]
    fn metadata_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(tmp.path(), "1.2.3");

        let path = manager.save_final(4, 0.5, &[1.0]).unwrap();
        let bytes = fs::read(path).unwrap();
        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        let metadata = header.metadata().as_ref().unwrap();

        assert_eq!(metadata["epoch"], "4");
        assert_eq!(metadata["val_loss"], "0.5");
        assert_eq!(metadata["version"], "1.2.3");
    }

    #[test]
    fn no_temporary_files_are_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(tmp.path(), DEFAULT_MODEL_VERSION);

        manager.save_final(1, 0.1, &[1.0]).unwrap();
        manager.save_final(1, 0.1, &[2.0]).unwrap();

        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();

        assert_eq!(names.len(), 1);
        assert_eq!(CheckpointManager::load(&tmp.path().join(&names[0]), 1).unwrap(), [2.0]);
    }

    fn entries(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn unwritable_directory_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let models = tmp.path().join("models");
        fs::write(&models, b"not a directory").unwrap();
        let mut manager = CheckpointManager::new(&models, DEFAULT_MODEL_VERSION);

        let err = manager.save_final(1, 0.1, &[1.0]).unwrap_err();

        assert!(matches!(err, TrainErr::CheckpointIo { .. }));
        assert!(manager.saved().is_empty());
        assert_eq!(entries(tmp.path()), ["models"]);
    }

    #[test]
    fn failed_rename_removes_the_temporary_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(tmp.path(), DEFAULT_MODEL_VERSION);
        let name = manager.file_name(1, 0.1);
        let blocker = tmp.path().join(&name);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"").unwrap();

        let err = manager.save_final(1, 0.1, &[1.0]).unwrap_err();

        assert!(matches!(err, TrainErr::CheckpointIo { .. }));
        assert!(manager.saved().is_empty());
        assert_eq!(entries(tmp.path()), [name]);
        assert!(blocker.is_dir());
    }

    #[test]
    fn missing_checkpoint_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = CheckpointManager::load(&tmp.path().join("missing.safetensors"), 1).unwrap_err();
        assert!(matches!(err, TrainErr::CheckpointIo { .. }));
    }
}
