use thiserror::Error;

/// Errors that can occur within the `thread_orchestra` pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Pool is already running, stop it before calling run_work again")]
  AlreadyRunning,

  #[error("A pool needs at least one worker thread")]
  InvalidThreadCount,

  #[error("Failed to spawn worker thread: {0}")]
  ThreadSpawn(String),

  #[error("{0} worker thread(s) panicked outside of task execution")]
  WorkerPanicked(usize),

  #[error("Task is already queued or running")]
  TaskAlreadyQueued,

  #[error("Task has already finished, call redo() before enqueuing it again")]
  TaskAlreadyFinished,

  #[error("Task is queued or running and cannot be reset")]
  TaskInFlight,

  #[error("Task was skipped before it could run")]
  TaskSkipped,

  #[error("Task panicked during execution: {0}")]
  TaskPanicked(String),
}
