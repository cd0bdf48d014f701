mod heatmap;
pub mod loss;
mod model;

pub use heatmap::HeatmapHeads;
pub use model::{Mode, Model};
