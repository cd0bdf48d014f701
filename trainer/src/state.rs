/// The mutable bookkeeping of a training run, owned by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub current_epoch: usize,
    pub current_learning_rate: f32,
    pub last_val_loss: f32,
    pub lowest_val_loss: f32,
    pub patience_count: usize,
    pub max_patience: usize,
}

impl TrainingState {
    /// Creates a new `TrainingState` before any epoch ran.
    ///
    /// # Arguments
    /// * `start_epoch` - The first epoch of the run.
    /// * `learning_rate` - The initial learning rate.
    /// * `max_patience` - The amount of epochs without improvement tolerated before decaying the
    ///   learning rate.
    ///
    /// # Returns
    /// A new `TrainingState` with both validation losses at `+inf`.
    pub fn new(start_epoch: usize, learning_rate: f32, max_patience: usize) -> Self {
        Self {
            current_epoch: start_epoch,
            current_learning_rate: learning_rate,
            last_val_loss: f32::INFINITY,
            lowest_val_loss: f32::INFINITY,
            patience_count: 0,
            max_patience,
        }
    }

    /// Records the validation loss of the epoch that just finished.
    ///
    /// # Returns
    /// Whether `val_loss` is a new minimum.
    pub fn record_val_loss(&mut self, val_loss: f32) -> bool {
        self.last_val_loss = val_loss;

        let improved = val_loss < self.lowest_val_loss;
        if improved {
            self.lowest_val_loss = val_loss;
        }

        improved
    }
}
