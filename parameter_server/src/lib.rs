pub mod optimization;
pub mod storage;
pub mod synchronization;
