use std::num::NonZeroUsize;

use ndarray::{concatenate, linalg, parallel::prelude::*, prelude::*};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{Mode, Model};
use crate::{MlErr, Result};

const INIT_STD: f32 = 0.01;

/// A stack of heatmap heads with intermediate supervision.
///
/// The image is average-pooled down to the heatmap resolution, then every stage applies a 1x1
/// convolution. The first stage only sees the pooled features, each following stage sees the pooled
/// features concatenated with the previous stage's heatmaps and refines them.
///
/// Parameters are laid out stage after stage, each stage as `[weights | biases]` with the weights
/// stored row-major as `(inputs, channels)`.
#[derive(Debug, Clone)]
pub struct HeatmapHeads {
    image_shape: (usize, usize, usize),
    heatmap_shape: (usize, usize, usize),
    stages: usize,
    size: usize,

    // Forward metadata
    inputs: Vec<Array2<f32>>,
}

impl HeatmapHeads {
    /// Creates a new `HeatmapHeads`.
    ///
    /// # Arguments
    /// * `image_shape` - The `(height, width, channels)` of the input images.
    /// * `heatmap_shape` - The `(height, width, keypoints)` of the predicted heatmaps.
    /// * `stages` - The amount of supervised stages.
    ///
    /// # Returns
    /// A new `HeatmapHeads` or an error if the image can't be pooled down to the heatmap size.
    pub fn new(
        image_shape: (usize, usize, usize),
        heatmap_shape: (usize, usize, usize),
        stages: NonZeroUsize,
    ) -> Result<Self> {
        let (h, w, c) = image_shape;
        let (hh, wh, k) = heatmap_shape;

        if c == 0 || k == 0 || hh == 0 || wh == 0 {
            return Err(MlErr::InvalidInput("image and heatmap shapes can't be empty"));
        }

        if h % hh != 0 || w % wh != 0 {
            return Err(MlErr::InvalidInput(
                "the image size must be a multiple of the heatmap size",
            ));
        }

        let mut heads = Self {
            image_shape,
            heatmap_shape,
            stages: stages.get(),
            size: 0,
            inputs: Vec::new(),
        };

        let size = (0..heads.stages).map(|s| heads.stage_size(s)).sum();
        heads.size = size;
        Ok(heads)
    }

    /// Returns the amount of supervised stages.
    pub fn stages(&self) -> usize {
        self.stages
    }

    fn stage_inputs(&self, stage: usize) -> usize {
        let (_, _, c) = self.image_shape;
        let (_, _, k) = self.heatmap_shape;
        if stage == 0 { c } else { c + k }
    }

    fn stage_size(&self, stage: usize) -> usize {
        (self.stage_inputs(stage) + 1) * self.heatmap_shape.2
    }

    fn stage_offset(&self, stage: usize) -> usize {
        (0..stage).map(|s| self.stage_size(s)).sum()
    }

    /// Average-pools the images into one feature row per heatmap pixel.
    fn pool(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (h, w, c) = self.image_shape;
        let (hh, wh, _) = self.heatmap_shape;

        if images.shape()[1..] != [h, w, c] {
            return Err(MlErr::ShapeMismatch {
                what: "images",
                got: images.shape().to_vec(),
                expected: vec![images.len_of(Axis(0)), h, w, c],
            });
        }

        let batch = images.len_of(Axis(0));
        let (fh, fw) = (h / hh, w / wh);
        let norm = (fh * fw) as f32;
        let mut pooled = Array2::zeros((batch * hh * wh, c));

        pooled
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut out)| {
                let (b, pixel) = (row / (hh * wh), row % (hh * wh));
                let (y, x) = (pixel / wh, pixel % wh);
                let window = images.slice(s![b, y * fh..(y + 1) * fh, x * fw..(x + 1) * fw, ..]);

                for px in window.rows() {
                    out += &px;
                }

                out /= norm;
            });

        Ok(pooled)
    }

    fn check_len(what: &'static str, got: usize, expected: usize) -> Result<()> {
        if got != expected {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected,
            });
        }

        Ok(())
    }

    /// Gives a view of the raw parameter slice as the weights and biases of a stage.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
        stage: usize,
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let k = self.heatmap_shape.2;
        let inputs = self.stage_inputs(stage);
        let offset = self.stage_offset(stage);
        let w_size = inputs * k;

        let raw = &params[offset..offset + w_size + k];
        let (w_raw, b_raw) = raw.split_at(w_size);
        let shape_err = |_| MlErr::SizeMismatch {
            what: "stage parameters",
            got: raw.len(),
            expected: w_size + k,
        };

        let weights = ArrayView2::from_shape((inputs, k), w_raw).map_err(shape_err)?;
        let biases = ArrayView1::from_shape(k, b_raw).map_err(shape_err)?;
        Ok((weights, biases))
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of a stage.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
        stage: usize,
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let k = self.heatmap_shape.2;
        let inputs = self.stage_inputs(stage);
        let offset = self.stage_offset(stage);
        let w_size = inputs * k;

        let raw = &mut grad[offset..offset + w_size + k];
        let (dw_raw, db_raw) = raw.split_at_mut(w_size);
        let shape_err = |_| MlErr::SizeMismatch {
            what: "stage gradient",
            got: w_size + k,
            expected: w_size + k,
        };

        let dw = ArrayViewMut2::from_shape((inputs, k), dw_raw).map_err(shape_err)?;
        let db = ArrayViewMut1::from_shape(k, db_raw).map_err(shape_err)?;
        Ok((dw, db))
    }
}

impl Model for HeatmapHeads {
    fn size(&self) -> usize {
        self.size
    }

    fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<f32> {
        let k = self.heatmap_shape.2;
        let mut params = Vec::with_capacity(self.size);

        for stage in 0..self.stages {
            let w_size = self.stage_inputs(stage) * k;
            params.extend((0..w_size).map(|_| rng.sample::<f32, _>(StandardNormal) * INIT_STD));
            params.extend(std::iter::repeat_n(0.0, k));
        }

        params
    }

    fn forward(
        &mut self,
        params: &[f32],
        images: ArrayView4<f32>,
        mode: Mode,
    ) -> Result<Vec<Array4<f32>>> {
        Self::check_len("params", params.len(), self.size)?;

        let (hh, wh, k) = self.heatmap_shape;
        let batch = images.len_of(Axis(0));
        let pooled = self.pool(images)?;

        let mut inputs = Vec::with_capacity(self.stages);
        let mut outputs: Vec<Array2<f32>> = Vec::with_capacity(self.stages);

        for stage in 0..self.stages {
            let x = match outputs.last() {
                None => pooled.clone(),
                Some(prev) => concatenate(Axis(1), &[pooled.view(), prev.view()]).map_err(|_| {
                    MlErr::ShapeMismatch {
                        what: "stage input",
                        got: prev.shape().to_vec(),
                        expected: vec![pooled.nrows(), k],
                    }
                })?,
            };

            let (w, b) = self.view_params(params, stage)?;
            let mut z = x.dot(&w);
            z += &b;

            inputs.push(x);
            outputs.push(z);
        }

        if mode == Mode::Train {
            self.inputs = inputs;
        }

        outputs
            .into_iter()
            .map(|z| {
                let got = z.shape().to_vec();
                z.into_shape_with_order((batch, hh, wh, k))
                    .map_err(|_| MlErr::ShapeMismatch {
                        what: "stage output",
                        got,
                        expected: vec![batch, hh, wh, k],
                    })
            })
            .collect()
    }

    fn backward(
        &mut self,
        params: &[f32],
        output_grads: &[Array4<f32>],
        grad: &mut [f32],
    ) -> Result<()> {
        Self::check_len("params", params.len(), self.size)?;
        Self::check_len("gradient", grad.len(), self.size)?;
        Self::check_len("output gradients", output_grads.len(), self.stages)?;

        let inputs = std::mem::take(&mut self.inputs);
        if inputs.len() != self.stages {
            return Err(MlErr::InvalidInput(
                "backward requires a previous forward pass in training mode",
            ));
        }

        let (_, _, channels) = self.image_shape;
        let k = self.heatmap_shape.2;
        let mut carry: Option<Array2<f32>> = None;

        for stage in (0..self.stages).rev() {
            let x = &inputs[stage];
            let rows = x.nrows();
            let output_grad = &output_grads[stage];

            let mut d = output_grad
                .to_shape((rows, k))
                .map_err(|_| MlErr::ShapeMismatch {
                    what: "output gradient",
                    got: output_grad.shape().to_vec(),
                    expected: vec![rows, k],
                })?
                .into_owned();

            if let Some(c) = carry.take() {
                d += &c;
            }

            let (mut dw, mut db) = self.view_grad(grad, stage)?;
            linalg::general_mat_mul(1.0, &x.t(), &d, 0.0, &mut dw);
            db.assign(&d.sum_axis(Axis(0)));

            if stage > 0 {
                let (w, _) = self.view_params(params, stage)?;
                let w_prev = w.slice(s![channels.., ..]);
                carry = Some(d.dot(&w_prev.t()));
            }
        }

        Ok(())
    }
}
