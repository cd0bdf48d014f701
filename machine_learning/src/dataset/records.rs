use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::info;
use ndarray::{Array4, Axis, concatenate};
use safetensors::{Dtype, SafeTensors};

use super::InMemoryDataset;
use crate::{MlErr, Result};

/// Name of the image tensor inside a record file.
pub const IMAGES_TENSOR: &str = "images";

/// Name of the heatmap tensor inside a record file.
pub const HEATMAPS_TENSOR: &str = "heatmaps";

/// Loads every `<prefix>*.safetensors` record file in `dir` into a single dataset.
///
/// Each file must hold an `images` tensor shaped `[n, H, W, 3]` and a `heatmaps` tensor shaped
/// `[n, Hh, Wh, K]`, both `f32`. Files are concatenated in lexicographic order.
///
/// # Arguments
/// * `dir` - The directory containing the record files.
/// * `prefix` - The file name prefix to match, e.g. `train` or `val`.
/// * `batch_size` - The global batch size of the resulting dataset.
///
/// # Returns
/// The loaded dataset, or an error if no file matched or any of them is malformed.
pub fn load_records(dir: &Path, prefix: &str, batch_size: NonZeroUsize) -> Result<InMemoryDataset> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let matches_prefix = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix));

            matches_prefix && path.extension().is_some_and(|ext| ext == "safetensors")
        })
        .collect();

    paths.sort();

    if paths.is_empty() {
        return Err(MlErr::Record {
            path: dir.to_path_buf(),
            detail: format!("no `{prefix}*.safetensors` files found"),
        });
    }

    let mut images = Vec::with_capacity(paths.len());
    let mut heatmaps = Vec::with_capacity(paths.len());

    for path in &paths {
        let bytes = fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| MlErr::Record {
            path: path.clone(),
            detail: e.to_string(),
        })?;

        images.push(read_tensor(&tensors, IMAGES_TENSOR, path)?);
        heatmaps.push(read_tensor(&tensors, HEATMAPS_TENSOR, path)?);
    }

    let images = concat_records(&images, dir, IMAGES_TENSOR)?;
    let heatmaps = concat_records(&heatmaps, dir, HEATMAPS_TENSOR)?;

    info!(
        dir:% = dir.display(), prefix = prefix, files = paths.len(), samples = images.len_of(Axis(0));
        "loaded records"
    );

    InMemoryDataset::new(images, heatmaps, batch_size)
}

fn read_tensor(tensors: &SafeTensors<'_>, name: &str, path: &Path) -> Result<Array4<f32>> {
    let record_err = |detail: String| MlErr::Record {
        path: path.to_path_buf(),
        detail,
    };

    let view = tensors
        .tensor(name)
        .map_err(|e| record_err(format!("tensor `{name}`: {e}")))?;

    if view.dtype() != Dtype::F32 {
        return Err(record_err(format!(
            "tensor `{name}` has dtype {:?}, expected F32",
            view.dtype()
        )));
    }

    let &[n, h, w, c] = view.shape() else {
        return Err(record_err(format!(
            "tensor `{name}` has shape {:?}, expected 4 dimensions",
            view.shape()
        )));
    };

    let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
    Array4::from_shape_vec((n, h, w, c), data).map_err(|e| record_err(e.to_string()))
}

fn concat_records(parts: &[Array4<f32>], dir: &Path, name: &str) -> Result<Array4<f32>> {
    let views: Vec<_> = parts.iter().map(|part| part.view()).collect();

    concatenate(Axis(0), &views).map_err(|e| MlErr::Record {
        path: dir.to_path_buf(),
        detail: format!("tensors `{name}` can't be concatenated: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use safetensors::tensor::TensorView;

    use super::*;
    use crate::dataset::BatchSource;

    fn write_record(dir: &Path, name: &str, images: &Array4<f32>, heatmaps: &Array4<f32>) {
        let tensors = [
            (
                IMAGES_TENSOR,
                TensorView::new(
                    Dtype::F32,
                    images.shape().to_vec(),
                    bytemuck::cast_slice(images.as_slice().unwrap()),
                )
                .unwrap(),
            ),
            (
                HEATMAPS_TENSOR,
                TensorView::new(
                    Dtype::F32,
                    heatmaps.shape().to_vec(),
                    bytemuck::cast_slice(heatmaps.as_slice().unwrap()),
                )
                .unwrap(),
            ),
        ];

        let bytes = safetensors::serialize(tensors, &None::<HashMap<String, String>>).unwrap();
        fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn loads_and_concatenates_matching_files() {
        let tmp = tempfile::tempdir().unwrap();
        let images = Array4::from_elem((2, 4, 4, 3), 1.0);
        let heatmaps = Array4::from_elem((2, 2, 2, 5), 0.5);

        write_record(tmp.path(), "train-00.safetensors", &images, &heatmaps);
        write_record(tmp.path(), "train-01.safetensors", &images, &heatmaps);
        write_record(tmp.path(), "val-00.safetensors", &images, &heatmaps);

        let batch_size = NonZeroUsize::new(3).unwrap();
        let mut train = load_records(tmp.path(), "train", batch_size).unwrap();
        let val = load_records(tmp.path(), "val", batch_size).unwrap();

        assert_eq!(train.len(), 4);
        assert_eq!(val.len(), 2);

        let batch = train.batches().next().unwrap();
        assert_eq!(batch.images.shape(), [3, 4, 4, 3]);
        assert_eq!(batch.labels.shape(), [3, 2, 2, 5]);
        assert!(batch.labels.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn missing_records_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let batch_size = NonZeroUsize::new(1).unwrap();

        let err = load_records(tmp.path(), "train", batch_size).unwrap_err();
        assert!(matches!(err, MlErr::Record { .. }));
    }
}
