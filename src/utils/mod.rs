pub mod logger;
pub mod shutdown;
