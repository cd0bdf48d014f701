mod error;
mod handle;
mod shard;
mod store;

pub use error::{Result, SizeMismatchErr};
pub use handle::ParameterHandle;
use shard::ParameterShard;
pub use store::ParameterStore;
