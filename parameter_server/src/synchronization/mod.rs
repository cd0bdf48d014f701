mod barrier;
mod non_blocking;
mod strategy;
mod synchronizer;

pub use barrier::BarrierSync;
pub use non_blocking::NoBlockingSync;
pub use strategy::SyncStrategy;
pub use synchronizer::Synchronizer;
