mod batch;
mod memory;
mod records;
mod shard;
mod source;

pub use batch::Batch;
pub use memory::InMemoryDataset;
pub use records::{HEATMAPS_TENSOR, IMAGES_TENSOR, load_records};
pub use shard::shard_range;
pub use source::BatchSource;
