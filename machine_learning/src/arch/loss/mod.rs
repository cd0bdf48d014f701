mod loss_fn;
mod mse;
mod staged;

pub use loss_fn::LossFn;
pub use mse::Mse;
pub use staged::StagedLoss;
