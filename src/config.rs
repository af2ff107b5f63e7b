use std::num::NonZeroUsize;
use std::thread;

/// Settings applied when a `ThreadPoolManager` spawns its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Worker count used by `run_default`.
  pub thread_count: usize,
  /// Workers are named `{prefix}-{index}`.
  pub thread_name_prefix: String,
  /// Stack size for each worker; `None` keeps the platform default.
  pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      thread_count: default_thread_count(),
      thread_name_prefix: "orchestra-worker".to_string(),
      stack_size: None,
    }
  }
}

impl PoolConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn thread_count(mut self, count: usize) -> Self {
    self.thread_count = count;
    self
  }

  pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.thread_name_prefix = prefix.into();
    self
  }

  pub fn stack_size(mut self, bytes: usize) -> Self {
    self.stack_size = Some(bytes);
    self
  }

  pub(crate) fn worker_name(&self, index: usize) -> String {
    format!("{}-{}", self.thread_name_prefix, index)
  }
}

/// Number of hardware threads, falling back to 1 when it cannot be queried.
pub fn default_thread_count() -> usize {
  thread::available_parallelism()
    .map(NonZeroUsize::get)
    .unwrap_or(1)
}
