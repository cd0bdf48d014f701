use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use log::warn;
use rayon::prelude::*;

use super::{ParameterShard, Result, SizeMismatchErr};
use crate::optimization::Optimizer;

/// The primary storage of parameters and accumulated gradients.
///
/// The parameters are partitioned in shards so that accumulating, updating and pulling run in
/// parallel. Every successful update bumps the store's version, replicas use it to tell whether
/// they all observed the same parameters.
///
/// Cloning a store yields another reference to the same shards.
#[derive(Debug)]
pub struct ParameterStore<O: Optimizer> {
    len: usize,
    active_idx: Arc<AtomicU8>,
    updating: Arc<AtomicBool>,
    version: Arc<AtomicU64>,
    shards: Arc<[ParameterShard<O>]>,
    shard_size: NonZeroUsize,
}

impl<O: Optimizer> Clone for ParameterStore<O> {
    fn clone(&self) -> Self {
        Self {
            len: self.len,
            active_idx: Arc::clone(&self.active_idx),
            updating: Arc::clone(&self.updating),
            version: Arc::clone(&self.version),
            shards: Arc::clone(&self.shards),
            shard_size: self.shard_size,
        }
    }
}

impl<O: Optimizer> ParameterStore<O> {
    /// Creates a new `ParameterStore`.
    ///
    /// # Arguments
    /// * `shard_size` - The maximum amount of parameters per shard.
    /// * `params` - The initial parameters of the model.
    /// * `optimizer_factory` - Builds the optimizer of a shard given its amount of parameters.
    ///
    /// # Returns
    /// A new `ParameterStore` at version `0`.
    pub fn new<F>(shard_size: NonZeroUsize, params: Vec<f32>, mut optimizer_factory: F) -> Self
    where
        F: FnMut(usize) -> O,
    {
        let len = params.len();
        let shards: Vec<_> = params
            .chunks(shard_size.get())
            .map(|chunk| ParameterShard::new(chunk.to_vec(), optimizer_factory(chunk.len())))
            .collect();

        Self {
            len,
            active_idx: Arc::new(AtomicU8::new(0)),
            updating: Arc::new(AtomicBool::new(false)),
            version: Arc::new(AtomicU64::new(0)),
            shards: Arc::from(shards),
            shard_size,
        }
    }

    /// Returns the amount of parameters in the storage.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the amount of optimizer updates applied so far.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Returns the learning rate of the optimizers, `None` if the store holds no parameters.
    pub fn learning_rate(&self) -> Option<f32> {
        self.shards.first().map(ParameterShard::learning_rate)
    }

    /// Sets the learning rate of every shard's optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The learning rate for the following updates.
    pub fn set_learning_rate(&self, learning_rate: f32) {
        self.shards
            .iter()
            .for_each(|shard| shard.set_learning_rate(learning_rate));
    }

    /// Accumulates a full model gradient into the active gradient buffers.
    ///
    /// # Arguments
    /// * `grad` - A flat gradient of `len()` values.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `grad` doesn't match the size of the storage.
    pub fn accumulate(&self, grad: &[f32]) -> Result<()>
    where
        O: Send,
    {
        if grad.len() != self.len {
            return Err(SizeMismatchErr);
        }

        let active_idx = self.active_idx.load(Ordering::Acquire) as usize;

        self.shards
            .par_iter()
            .zip(grad.par_chunks(self.shard_size.get()))
            .try_for_each(|(shard, grad_slice)| shard.accumulate(active_idx, grad_slice))
    }

    /// Swaps the gradient buffers and applies the frozen one through every shard's optimizer.
    ///
    /// Only one caller at a time performs the update, concurrent callers return immediately.
    pub fn update_params(&self) -> Result<()>
    where
        O: Send,
    {
        let acquired = self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();

        if !acquired {
            warn!("skipping a parameter update, another one is in progress");
            return Ok(());
        }

        let frozen_idx = self.active_idx.fetch_xor(1, Ordering::AcqRel) as usize;

        let updated = self
            .shards
            .par_iter()
            .try_for_each(|shard| shard.update_params(frozen_idx));

        if updated.is_ok() {
            self.version.fetch_add(1, Ordering::AcqRel);
        }

        self.updating.store(false, Ordering::Release);
        updated
    }

    /// Copies the current parameters into `out`.
    ///
    /// # Arguments
    /// * `out` - A buffer of `len()` values.
    ///
    /// # Returns
    /// The version of the copied parameters, or a `SizeMismatchErr` if `out` doesn't match
    /// the size of the storage.
    pub fn pull_params(&self, out: &mut [f32]) -> Result<u64>
    where
        O: Send,
    {
        if out.len() != self.len {
            return Err(SizeMismatchErr);
        }

        self.shards
            .par_iter()
            .zip(out.par_chunks_mut(self.shard_size.get()))
            .try_for_each(|(shard, out_slice)| shard.pull_params(out_slice))?;

        Ok(self.version())
    }

    /// Returns an owned copy of the current parameters.
    pub fn snapshot(&self) -> Vec<f32>
    where
        O: Send,
    {
        let mut params = vec![0.; self.len];

        // The buffer is sized after the store, pulling can't mismatch.
        let _ = self.pull_params(&mut params);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AddOptimizer(f32);

    impl Optimizer for AddOptimizer {
        fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
            params.iter_mut().zip(grad).for_each(|(w, g)| *w += self.0 * g);
            Ok(())
        }

        fn learning_rate(&self) -> f32 {
            self.0
        }

        fn set_learning_rate(&mut self, learning_rate: f32) {
            self.0 = learning_rate;
        }
    }

    fn create_test_store(params: usize, shard_size: usize) -> ParameterStore<AddOptimizer> {
        let shard_size = NonZeroUsize::new(shard_size).unwrap();
        ParameterStore::new(shard_size, vec![0.; params], |_| AddOptimizer(1.))
    }

    #[test]
    fn ragged_shards_cover_every_parameter() {
        const PARAMS: usize = 15;
        const SHARD_SIZE: usize = 8;

        let store = create_test_store(PARAMS, SHARD_SIZE);
        assert_eq!(store.shards.len(), 2);

        store.accumulate(&[1.0; PARAMS]).unwrap();
        store.update_params().unwrap();

        let mut out = [0.0; PARAMS];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [1.0; PARAMS]);
    }

    #[test]
    fn gradients_of_every_contributor_are_summed() {
        let store = create_test_store(4, 3);

        store.accumulate(&[1.0; 4]).unwrap();
        store.accumulate(&[0.5; 4]).unwrap();
        store.update_params().unwrap();

        assert_eq!(store.snapshot(), vec![1.5; 4]);
    }

    #[test]
    fn buffers_swap_on_every_update() {
        const PARAMS: usize = 10;

        let store = create_test_store(PARAMS, 1);
        store.accumulate(&[1.0; PARAMS]).unwrap();

        store.update_params().unwrap();
        assert_eq!(store.active_idx.load(Ordering::Acquire), 1);
        store.accumulate(&[5.0; PARAMS]).unwrap();

        let mut params = [0.0; PARAMS];
        store.pull_params(&mut params).unwrap();
        assert_eq!(params, [1.0; PARAMS]);

        store.update_params().unwrap();
        store.pull_params(&mut params).unwrap();
        assert_eq!(params, [6.0; PARAMS]);
    }

    #[test]
    fn concurrent_update_is_skipped() {
        let store = create_test_store(10, 1);
        store.updating.store(true, Ordering::SeqCst);

        let active_idx = store.active_idx.load(Ordering::Acquire);
        store.update_params().unwrap();
        assert_eq!(store.active_idx.load(Ordering::Acquire), active_idx);
        assert_eq!(store.version(), 0);

        store.updating.store(false, Ordering::Release);
        store.update_params().unwrap();
        assert_ne!(store.active_idx.load(Ordering::SeqCst), active_idx);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn pull_reports_the_version() {
        let store = create_test_store(3, 2);
        let mut out = [0.0; 3];

        assert_eq!(store.pull_params(&mut out).unwrap(), 0);
        store.update_params().unwrap();
        store.update_params().unwrap();
        assert_eq!(store.pull_params(&mut out).unwrap(), 2);
    }

    #[test]
    fn learning_rate_reaches_every_shard() {
        let store = create_test_store(5, 2);
        store.set_learning_rate(0.5);

        assert_eq!(store.learning_rate(), Some(0.5));
        assert!(store.shards.iter().all(|s| s.learning_rate() == 0.5));

        store.accumulate(&[1.0; 5]).unwrap();
        store.update_params().unwrap();
        assert_eq!(store.snapshot(), vec![0.5; 5]);
    }

    #[test]
    fn size_mismatches_fail() {
        let store = create_test_store(4, 2);

        assert_eq!(store.accumulate(&[1.0; 3]), Err(SizeMismatchErr));
        assert_eq!(store.pull_params(&mut [0.0; 5]), Err(SizeMismatchErr));
    }
}
