use crate::error::PoolError;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{error, trace};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// A descriptive label for a task, typically a `String`.
pub type TaskLabel = String;

/// The work a task performs when a worker picks it up.
///
/// `run` may be called from any worker thread, at most once per run cycle.
pub trait TaskWork: Send + Sync + 'static {
  fn run(&self);
}

impl<F> TaskWork for F
where
  F: Fn() + Send + Sync + 'static,
{
  fn run(&self) {
    self()
  }
}

/// How a task reached its finished state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
  /// The work ran to completion.
  Completed,
  /// The task was marked finished without its work being run.
  Skipped,
  /// The work panicked; the payload message is kept for the waiter.
  Panicked(String),
}

/// Observable lifecycle position of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
  Idle,
  Queued,
  Running,
  Finished,
}

#[derive(Debug)]
enum TaskState {
  Pending,
  Running,
  Finished(TaskOutcome),
}

#[derive(Debug)]
struct TaskCell {
  state: TaskState,
  /// Set while a handle to this task sits in a manager queue.
  in_queue: bool,
}

struct TaskInner {
  task_id: u64,
  labels: Arc<HashSet<TaskLabel>>,
  work: Box<dyn TaskWork>,
  cell: Mutex<TaskCell>,
  finished_cv: Condvar,
  finished_notify: Notify,
}

/// A shareable handle to a unit of deferred work and its completion state.
///
/// Cloning the handle does not clone the work: all clones observe the same
/// completion. The submitter keeps a handle for as long as it wants to observe
/// the task; a manager only holds one while the task is queued or running.
#[derive(Clone)]
pub struct Task {
  inner: Arc<TaskInner>,
}

impl fmt::Debug for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("task_id", &self.inner.task_id)
      .field("labels", &self.inner.labels)
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

impl Task {
  pub fn new(work: impl TaskWork) -> Self {
    Self::with_labels(HashSet::new(), work)
  }

  pub fn from_fn(f: impl Fn() + Send + Sync + 'static) -> Self {
    Self::new(f)
  }

  pub fn with_labels(labels: HashSet<TaskLabel>, work: impl TaskWork) -> Self {
    let task_id = NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    Self {
      inner: Arc::new(TaskInner {
        task_id,
        labels: Arc::new(labels),
        work: Box::new(work),
        cell: Mutex::new(TaskCell {
          state: TaskState::Pending,
          in_queue: false,
        }),
        finished_cv: Condvar::new(),
        finished_notify: Notify::new(),
      }),
    }
  }

  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.inner.task_id
  }

  /// Returns a clone of the labels associated with this task.
  pub fn labels(&self) -> HashSet<TaskLabel> {
    (*self.inner.labels).clone()
  }

  pub(crate) fn shared_labels(&self) -> Arc<HashSet<TaskLabel>> {
    self.inner.labels.clone()
  }

  pub fn status(&self) -> TaskStatus {
    let cell = self.inner.cell.lock();
    match cell.state {
      TaskState::Finished(_) => TaskStatus::Finished,
      TaskState::Running => TaskStatus::Running,
      TaskState::Pending if cell.in_queue => TaskStatus::Queued,
      TaskState::Pending => TaskStatus::Idle,
    }
  }

  /// Non-blocking check of the completion flag.
  pub fn has_finished(&self) -> bool {
    matches!(self.inner.cell.lock().state, TaskState::Finished(_))
  }

  /// Non-blocking query of the outcome, `None` until the task has finished.
  pub fn outcome(&self) -> Option<TaskOutcome> {
    match &self.inner.cell.lock().state {
      TaskState::Finished(outcome) => Some(outcome.clone()),
      _ => None,
    }
  }

  /// Resets a finished task so it can be enqueued and run again.
  ///
  /// # Errors
  /// Returns `PoolError::TaskInFlight` while the task is queued or running.
  pub fn redo(&self) -> Result<(), PoolError> {
    let mut cell = self.inner.cell.lock();
    if cell.in_queue || matches!(cell.state, TaskState::Running) {
      return Err(PoolError::TaskInFlight);
    }
    if matches!(cell.state, TaskState::Finished(_)) {
      trace!(task_id = %self.inner.task_id, "Task reset for another run.");
      cell.state = TaskState::Pending;
    }
    Ok(())
  }

  /// Marks the task finished without running its work and releases every waiter.
  ///
  /// Returns `false` when the task is already running or finished; those are
  /// left untouched. A skipped task still sitting in a queue stays there until
  /// a worker or a drain removes it; completion handlers see the `Skipped`
  /// event at that point.
  pub fn skip(&self) -> bool {
    let mut cell = self.inner.cell.lock();
    if !matches!(cell.state, TaskState::Pending) {
      return false;
    }
    cell.state = TaskState::Finished(TaskOutcome::Skipped);
    drop(cell);
    trace!(task_id = %self.inner.task_id, "Task skipped.");
    self.wake_waiters();
    true
  }

  /// Blocks until the task has finished and returns how it finished.
  pub fn wait_until_finished(&self) -> TaskOutcome {
    let mut cell = self.inner.cell.lock();
    loop {
      if let TaskState::Finished(outcome) = &cell.state {
        return outcome.clone();
      }
      self.inner.finished_cv.wait(&mut cell);
    }
  }

  /// Like `wait_until_finished`, but gives up after `timeout`.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
    let deadline = Instant::now() + timeout;
    let mut cell = self.inner.cell.lock();
    loop {
      if let TaskState::Finished(outcome) = &cell.state {
        return Some(outcome.clone());
      }
      if self.inner.finished_cv.wait_until(&mut cell, deadline).timed_out() {
        return match &cell.state {
          TaskState::Finished(outcome) => Some(outcome.clone()),
          _ => None,
        };
      }
    }
  }

  /// Waits for completion and maps the outcome onto `PoolError`.
  ///
  /// # Errors
  /// Returns `PoolError::TaskSkipped` if the task never ran and
  /// `PoolError::TaskPanicked` if its work panicked.
  pub fn wait_result(&self) -> Result<(), PoolError> {
    match self.wait_until_finished() {
      TaskOutcome::Completed => Ok(()),
      TaskOutcome::Skipped => Err(PoolError::TaskSkipped),
      TaskOutcome::Panicked(message) => Err(PoolError::TaskPanicked(message)),
    }
  }

  /// Asynchronously waits for the task to finish.
  pub async fn finished(&self) -> TaskOutcome {
    loop {
      let notified = self.inner.finished_notify.notified();
      tokio::pin!(notified);
      // Register before checking so a completion in between is not lost.
      notified.as_mut().enable();
      if let Some(outcome) = self.outcome() {
        return outcome;
      }
      notified.await;
    }
  }

  /// Marks the task as handed to a queue. Called under the queue lock.
  pub(crate) fn mark_queued(&self) -> Result<(), PoolError> {
    let mut cell = self.inner.cell.lock();
    if cell.in_queue || matches!(cell.state, TaskState::Running) {
      return Err(PoolError::TaskAlreadyQueued);
    }
    if matches!(cell.state, TaskState::Finished(_)) {
      return Err(PoolError::TaskAlreadyFinished);
    }
    cell.in_queue = true;
    Ok(())
  }

  /// Takes the task out of its queue. Returns `true` if a worker should run it,
  /// `false` if it was skipped while queued. Called under the queue lock.
  pub(crate) fn take_for_run(&self) -> bool {
    let mut cell = self.inner.cell.lock();
    cell.in_queue = false;
    if matches!(cell.state, TaskState::Pending) {
      cell.state = TaskState::Running;
      true
    } else {
      false
    }
  }

  /// Takes the task out of its queue and skips it. Returns `true` if the task
  /// was still pending. Called under the queue lock.
  pub(crate) fn take_and_skip(&self) -> bool {
    self.inner.cell.lock().in_queue = false;
    self.skip()
  }

  /// Runs the work of a task previously claimed with `take_for_run`, records
  /// the outcome and wakes this task's waiters.
  pub(crate) fn solve(&self) -> TaskOutcome {
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.inner.work.run())) {
      Ok(()) => TaskOutcome::Completed,
      Err(payload) => {
        let message = panic_message(payload.as_ref());
        error!(task_id = %self.inner.task_id, %message, "Task panicked during execution.");
        TaskOutcome::Panicked(message)
      }
    };

    self.inner.cell.lock().state = TaskState::Finished(outcome.clone());
    self.wake_waiters();
    outcome
  }

  fn wake_waiters(&self) {
    self.inner.finished_cv.notify_all();
    self.inner.finished_notify.notify_waiters();
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::thread;

  fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
    let counter = counter.clone();
    Task::from_fn(move || {
      counter.fetch_add(1, AtomicOrdering::SeqCst);
    })
  }

  #[test]
  fn test_new_task_is_idle() {
    let task = Task::from_fn(|| {});
    assert_eq!(task.status(), TaskStatus::Idle);
    assert!(!task.has_finished());
    assert_eq!(task.outcome(), None);
  }

  #[test]
  fn test_task_ids_are_unique() {
    let a = Task::from_fn(|| {});
    let b = Task::from_fn(|| {});
    assert_ne!(a.id(), b.id());
    assert_eq!(a.clone().id(), a.id());
  }

  #[test]
  fn test_solve_runs_work_once_and_finishes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let task = counting_task(&counter);
    task.mark_queued().unwrap();
    assert_eq!(task.status(), TaskStatus::Queued);
    assert!(task.take_for_run());
    assert_eq!(task.status(), TaskStatus::Running);

    assert_eq!(task.solve(), TaskOutcome::Completed);
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    assert!(task.has_finished());
    assert_eq!(task.wait_until_finished(), TaskOutcome::Completed);
  }

  #[test]
  fn test_skip_finishes_without_running() {
    let counter = Arc::new(AtomicUsize::new(0));
    let task = counting_task(&counter);
    assert!(task.skip());
    assert!(!task.skip(), "second skip must not change anything");
    assert_eq!(task.wait_until_finished(), TaskOutcome::Skipped);
    assert_eq!(task.wait_result(), Err(PoolError::TaskSkipped));
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
  }

  #[test]
  fn test_skipped_queued_task_is_not_run_when_dequeued() {
    let counter = Arc::new(AtomicUsize::new(0));
    let task = counting_task(&counter);
    task.mark_queued().unwrap();
    assert!(task.skip());
    assert_eq!(task.redo(), Err(PoolError::TaskInFlight));
    assert!(!task.take_for_run());
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
    assert!(task.redo().is_ok());
  }

  #[test]
  fn test_panic_is_captured_as_outcome() {
    let task = Task::from_fn(|| panic!("boom"));
    task.mark_queued().unwrap();
    assert!(task.take_for_run());
    assert_eq!(task.solve(), TaskOutcome::Panicked("boom".to_string()));
    assert_eq!(
      task.wait_result(),
      Err(PoolError::TaskPanicked("boom".to_string()))
    );
  }

  #[test]
  fn test_redo_resets_finished_task() {
    let task = Task::from_fn(|| {});
    task.skip();
    assert!(task.has_finished());
    task.redo().unwrap();
    assert!(!task.has_finished());
    assert_eq!(task.status(), TaskStatus::Idle);
    // Redo of an idle task is a no-op.
    task.redo().unwrap();
  }

  #[test]
  fn test_double_queue_is_rejected() {
    let task = Task::from_fn(|| {});
    task.mark_queued().unwrap();
    assert_eq!(task.mark_queued(), Err(PoolError::TaskAlreadyQueued));
    assert!(task.take_and_skip());
    assert_eq!(task.mark_queued(), Err(PoolError::TaskAlreadyFinished));
  }

  #[test]
  fn test_wait_timeout_expires_on_pending_task() {
    let task = Task::from_fn(|| {});
    assert_eq!(task.wait_timeout(Duration::from_millis(20)), None);
    task.skip();
    assert_eq!(
      task.wait_timeout(Duration::from_millis(20)),
      Some(TaskOutcome::Skipped)
    );
  }

  #[test]
  fn test_waiter_thread_is_released_by_solve() {
    let task = Task::from_fn(|| thread::sleep(Duration::from_millis(20)));
    task.mark_queued().unwrap();
    let waiter = {
      let task = task.clone();
      thread::spawn(move || task.wait_until_finished())
    };
    assert!(task.take_for_run());
    task.solve();
    assert_eq!(waiter.join().unwrap(), TaskOutcome::Completed);
  }

  #[tokio::test]
  async fn test_async_wait_observes_skip_from_other_thread() {
    let task = Task::from_fn(|| {});
    let skipper = {
      let task = task.clone();
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        task.skip();
      })
    };
    assert_eq!(task.finished().await, TaskOutcome::Skipped);
    skipper.join().unwrap();
  }
}
