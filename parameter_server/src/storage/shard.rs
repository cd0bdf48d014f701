use parking_lot::{Mutex, RwLock};

use super::{Result, SizeMismatchErr};
use crate::optimization::Optimizer;

/// A slice of the model's parameters with its own gradient buffers and optimizer.
///
/// Gradients are double-buffered: replicas keep accumulating into the active buffer while the
/// frozen one is consumed by the optimizer and cleared.
#[derive(Debug)]
pub struct ParameterShard<O: Optimizer> {
    len: usize,
    grads: [Mutex<Box<[f32]>>; 2],
    params: RwLock<Box<[f32]>>,
    optimizer: Mutex<O>,
}

impl<O: Optimizer> ParameterShard<O> {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `params` - The initial state of the parameters.
    /// * `optimizer` - The optimization algorithm for this slice.
    pub fn new(params: Vec<f32>, optimizer: O) -> Self {
        let len = params.len();

        Self {
            len,
            grads: [
                Mutex::new(vec![0.; len].into_boxed_slice()),
                Mutex::new(vec![0.; len].into_boxed_slice()),
            ],
            params: RwLock::new(params.into_boxed_slice()),
            optimizer: Mutex::new(optimizer),
        }
    }

    /// Accumulates `grad` into the active gradient buffer.
    ///
    /// # Arguments
    /// * `active_idx` - The index of the active buffer, `0` or `1`.
    /// * `grad` - This shard's slice of a gradient.
    pub fn accumulate(&self, active_idx: usize, grad: &[f32]) -> Result<()> {
        if self.len != grad.len() {
            return Err(SizeMismatchErr);
        }

        self.grads[active_idx]
            .lock()
            .iter_mut()
            .zip(grad)
            .for_each(|(acc, g)| *acc += g);

        Ok(())
    }

    /// Applies the frozen gradient buffer through the optimizer and clears it.
    ///
    /// # Arguments
    /// * `frozen_idx` - The index of the frozen buffer, `0` or `1`.
    pub fn update_params(&self, frozen_idx: usize) -> Result<()> {
        let mut params = self.params.write();
        let mut grad = self.grads[frozen_idx].lock();

        self.optimizer.lock().update_params(&grad, &mut params)?;
        grad.fill(0.);
        Ok(())
    }

    /// Copies the shard's parameters into `out`.
    pub fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        if self.len != out.len() {
            return Err(SizeMismatchErr);
        }

        out.copy_from_slice(&self.params.read());
        Ok(())
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.lock().learning_rate()
    }

    pub fn set_learning_rate(&self, learning_rate: f32) {
        self.optimizer.lock().set_learning_rate(learning_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AddOptimizer;

    impl Optimizer for AddOptimizer {
        fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
            params.iter_mut().zip(grad).for_each(|(w, g)| *w += g);
            Ok(())
        }

        fn learning_rate(&self) -> f32 {
            1.
        }

        fn set_learning_rate(&mut self, _: f32) {}
    }

    #[test]
    fn accumulation_only_touches_the_active_buffer() {
        let shard = ParameterShard::new(vec![0.; 3], AddOptimizer);

        shard.accumulate(0, &[1.0, 2.0, 3.0]).unwrap();
        shard.accumulate(0, &[1.0, 1.0, 1.0]).unwrap();

        assert_eq!(**shard.grads[0].lock(), [2., 3., 4.]);
        assert_eq!(**shard.grads[1].lock(), [0., 0., 0.]);

        shard.update_params(0).unwrap();
        assert_eq!(**shard.grads[0].lock(), [0., 0., 0.]);

        let mut out = [0.; 3];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [2., 3., 4.]);
    }

    #[test]
    fn wrong_sizes_fail() {
        let shard = ParameterShard::new(vec![0.; 2], AddOptimizer);
        assert_eq!(shard.accumulate(0, &[1.0]), Err(SizeMismatchErr));
        assert_eq!(shard.pull_params(&mut [0.; 3]), Err(SizeMismatchErr));
    }
}
