pub mod config;
pub mod schedule;
pub mod storage;
pub mod utils;

pub use config::WorkerConfig;
