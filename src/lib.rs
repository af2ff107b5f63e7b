//! A fixed-size pool of OS worker threads executing shared tasks from a FIFO
//! queue, with per-task completion signaling, skip-on-shutdown and
//! restartable workers.

mod config;
mod error;
mod manager;
mod notifier;
mod task;

pub use config::{default_thread_count, PoolConfig};
pub use error::PoolError;
pub use manager::ThreadPoolManager;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use task::{Task, TaskLabel, TaskOutcome, TaskStatus, TaskWork};
