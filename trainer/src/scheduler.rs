use log::info;
use parameter_server::{optimization::Optimizer, storage::ParameterStore};

use crate::state::TrainingState;

pub const DEFAULT_MAX_PATIENCE: usize = 5;
pub const DEFAULT_DECAY_FACTOR: f32 = 5.;

/// Decays the learning rate once the validation loss stops improving for a while.
///
/// The policy is run at the start of every epoch:
/// - if `patience_count` reached `max_patience` the learning rate is divided by the decay factor
///   and the patience restarts,
/// - otherwise, if the last validation loss is exactly the lowest one, the patience restarts,
/// - then `patience_count` is always incremented.
///
/// The comparison is an exact float equality, which in practice only holds on the epoch right
/// after a new minimum.
#[derive(Debug, Clone, Copy)]
pub struct PlateauScheduler {
    decay_factor: f32,
}

impl Default for PlateauScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_FACTOR)
    }
}

impl PlateauScheduler {
    /// Creates a new `PlateauScheduler`.
    ///
    /// # Arguments
    /// * `decay_factor` - The learning rate is divided by this value on every decay.
    pub fn new(decay_factor: f32) -> Self {
        Self { decay_factor }
    }

    /// Runs the policy over `state`.
    ///
    /// # Returns
    /// The learning rate for the upcoming epoch.
    pub fn update(&self, state: &mut TrainingState) -> f32 {
        if state.patience_count >= state.max_patience {
            state.current_learning_rate /= self.decay_factor;
            state.patience_count = 0;

            info!(
                epoch = state.current_epoch, learning_rate = state.current_learning_rate;
                "validation loss plateaued, decaying learning rate"
            );
        } else if state.last_val_loss == state.lowest_val_loss {
            state.patience_count = 0;
        }

        state.patience_count += 1;
        state.current_learning_rate
    }

    /// Runs the policy and applies the resulting learning rate to every optimizer of `store`.
    ///
    /// # Returns
    /// The applied learning rate.
    pub fn apply<O: Optimizer>(&self, state: &mut TrainingState, store: &ParameterStore<O>) -> f32 {
        let learning_rate = self.update(state);
        store.set_learning_rate(learning_rate);
        learning_rate
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use parameter_server::optimization::GradientDescent;

    use super::*;

    fn plateaued_state() -> TrainingState {
        let mut state = TrainingState::new(1, 1.0, DEFAULT_MAX_PATIENCE);
        state.lowest_val_loss = 0.5;
        state.last_val_loss = 0.7;
        state
    }

    #[test]
    fn sixth_call_without_improvement_decays() {
        let scheduler = PlateauScheduler::default();
        let mut state = plateaued_state();

        for call in 1..=5 {
            assert_eq!(scheduler.update(&mut state), 1.0);
            assert_eq!(state.patience_count, call);
        }

        assert!((scheduler.update(&mut state) - 0.2).abs() < 1e-7);
        assert_eq!(state.patience_count, 1);
    }

    #[test]
    fn equal_losses_reset_patience() {
        let scheduler = PlateauScheduler::default();
        let mut state = plateaued_state();
        state.patience_count = 3;
        state.last_val_loss = state.lowest_val_loss;

        scheduler.update(&mut state);
        assert_eq!(state.patience_count, 1);
        assert_eq!(state.current_learning_rate, 1.0);
    }

    #[test]
    fn decay_takes_precedence_over_equality() {
        let scheduler = PlateauScheduler::new(2.);
        let mut state = plateaued_state();
        state.patience_count = DEFAULT_MAX_PATIENCE;
        state.last_val_loss = state.lowest_val_loss;

        assert_eq!(scheduler.update(&mut state), 0.5);
        assert_eq!(state.patience_count, 1);
    }

    #[test]
    fn fresh_state_counts_from_one() {
        let scheduler = PlateauScheduler::default();
        let mut state = TrainingState::new(1, 0.1, DEFAULT_MAX_PATIENCE);

        // Both losses start at +inf, so they compare equal.
        scheduler.update(&mut state);
        assert_eq!(state.patience_count, 1);
    }

    #[test]
    fn learning_rate_reaches_the_store() {
        let scheduler = PlateauScheduler::default();
        let mut state = plateaued_state();
        state.patience_count = DEFAULT_MAX_PATIENCE;

        let shard_size = NonZeroUsize::new(2).unwrap();
        let store = ParameterStore::new(shard_size, vec![0.; 5], |_| GradientDescent::new(1.0));

        let learning_rate = scheduler.apply(&mut state, &store);
        assert_eq!(store.learning_rate(), Some(learning_rate));
        assert!((learning_rate - 0.2).abs() < 1e-7);
    }
}
