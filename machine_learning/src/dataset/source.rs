use super::Batch;

/// A data source yielding already decoded batches, one pass per epoch.
pub trait BatchSource {
    /// Starts a new pass over the data.
    ///
    /// # Returns
    /// An iterator over every batch of this pass.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_>;

    /// Returns the amount of batches per pass, if known upfront.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

impl<T: BatchSource + ?Sized> BatchSource for Box<T> {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_> {
        (**self).batches()
    }

    fn len_hint(&self) -> Option<usize> {
        (**self).len_hint()
    }
}
