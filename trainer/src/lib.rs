pub mod checkpoint;
pub mod config;
pub mod epoch;
pub mod error;
pub mod metrics;
pub mod replica;
pub mod scheduler;
pub mod session;
pub mod state;

pub use error::{Result, TrainErr};
