pub mod queue;
pub mod task;
