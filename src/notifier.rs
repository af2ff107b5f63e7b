use crate::task::{TaskLabel, TaskOutcome};

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, info_span, trace, warn};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Skipped,
  Panicked,
}

impl From<&TaskOutcome> for TaskCompletionStatus {
  fn from(outcome: &TaskOutcome) -> Self {
    match outcome {
      TaskOutcome::Completed => TaskCompletionStatus::Success,
      TaskOutcome::Skipped => TaskCompletionStatus::Skipped,
      TaskOutcome::Panicked(_) => TaskCompletionStatus::Panicked,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub pool_name: Arc<String>,
  pub labels: Arc<HashSet<TaskLabel>>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

// --- Internal Message (crate-public) ---
#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) task_id: u64,
  pub(crate) labels: Arc<HashSet<TaskLabel>>,
  pub(crate) status: TaskCompletionStatus,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

struct NotifierInternalState {
  rx_for_init: Option<UnboundedReceiver<InternalCompletionMessage>>,
  tx: Option<UnboundedSender<InternalCompletionMessage>>,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Delivers completion events to user handlers on a dedicated thread.
///
/// The thread is only started once the first handler is added, so pools that
/// never register a handler pay nothing beyond an `is_completed` check.
pub(crate) struct CompletionNotifier {
  pool_name: Arc<String>,
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  init_once: Once,
  state: Mutex<NotifierInternalState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(pool_name: Arc<String>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      pool_name,
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      state: Mutex::new(NotifierInternalState {
        rx_for_init: Some(rx),
        tx: Some(tx),
        worker_join_handle: None,
      }),
    }
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let mut state = self.state.lock();
      let Some(rx) = state.rx_for_init.take() else {
        warn!(pool_name = %*self.pool_name, "Notifier initialization: receiver already taken.");
        return;
      };
      info!(pool_name = %*self.pool_name, "First completion handler added. Starting notification worker.");

      let handlers = self.handlers.clone();
      let pool_name = self.pool_name.clone();
      let spawn_result = thread::Builder::new()
        .name(format!("{}-notifier", self.pool_name))
        .spawn(move || Self::run_notification_worker_loop(rx, handlers, pool_name));

      match spawn_result {
        Ok(handle) => state.worker_join_handle = Some(handle),
        Err(e) => {
          error!(pool_name = %*self.pool_name, "Failed to spawn notification worker: {}", e);
          // Without a consumer the channel would only grow.
          state.tx = None;
        }
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.ensure_worker_initialized();
    let mut handlers = self.handlers.write();
    handlers.push(Arc::new(handler));
    info!(pool_name = %*self.pool_name, "Notifier: Added new completion handler. Total handlers: {}", handlers.len());
  }

  /// Queues a completion event. Dropped silently when no handler was ever added.
  pub(crate) fn notify(&self, message: InternalCompletionMessage) {
    if !self.init_once.is_completed() {
      return;
    }
    let state = self.state.lock();
    if let Some(tx) = &state.tx {
      if tx.send(message).is_err() {
        warn!(pool_name = %*self.pool_name, "Notifier: Notification worker is gone, event dropped.");
      }
    }
  }

  fn run_notification_worker_loop(
    mut queue_rx: UnboundedReceiver<InternalCompletionMessage>,
    handlers: Arc<RwLock<Vec<CompletionHandler>>>,
    pool_name: Arc<String>,
  ) {
    let _span = info_span!("notification_worker_loop", pool_name = %*pool_name).entered();
    info!("Notification worker started.");

    // `None` means every sender is gone and the channel is drained.
    while let Some(message) = queue_rx.blocking_recv() {
      let handlers_guard = handlers.read();
      if handlers_guard.is_empty() {
        trace!(task_id = %message.task_id, "No completion handlers registered, dropping notification.");
        continue;
      }

      let info = TaskCompletionInfo {
        task_id: message.task_id,
        pool_name: pool_name.clone(),
        labels: message.labels,
        status: message.status,
        completion_time: SystemTime::now(),
      };
      debug!(task_id = %info.task_id, "Dispatching notification to {} handlers.", handlers_guard.len());

      for handler in handlers_guard.iter() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(info.clone())));
        if result.is_err() {
          error!(task_id = %info.task_id, "A completion handler panicked during execution.");
        }
      }
    }

    info!("Notification worker stopped (input queue closed and processed).");
  }

  /// Closes the event channel and joins the notification worker, delivering
  /// every event queued before the call.
  pub(crate) fn shutdown(&self) {
    let handle = {
      let mut state = self.state.lock();
      state.tx = None;
      state.worker_join_handle.take()
    };

    if let Some(handle) = handle {
      if handle.thread().id() == thread::current().id() {
        // Dropped from inside a handler; the loop ends once the channel drains.
        debug!(pool_name = %*self.pool_name, "Notifier: Shutdown requested from the notification worker; not joining itself.");
        return;
      }
      debug!(pool_name = %*self.pool_name, "Notifier: Waiting for notification worker to join.");
      if handle.join().is_err() {
        error!(pool_name = %*self.pool_name, "Notifier: Notification worker panicked.");
      }
    } else {
      trace!(pool_name = %*self.pool_name, "Notifier: Worker was not started; no join needed.");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn message(task_id: u64, status: TaskCompletionStatus) -> InternalCompletionMessage {
    InternalCompletionMessage {
      task_id,
      labels: Arc::new(HashSet::new()),
      status,
    }
  }

  #[test]
  fn test_events_without_handlers_are_dropped() {
    let notifier = CompletionNotifier::new(Arc::new("idle".to_string()));
    notifier.notify(message(1, TaskCompletionStatus::Success));
    assert!(notifier.state.lock().worker_join_handle.is_none());
    notifier.shutdown();
  }

  #[test]
  fn test_shutdown_delivers_pending_events() {
    let notifier = CompletionNotifier::new(Arc::new("drain".to_string()));
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();
    notifier.add_handler(move |_| {
      seen_clone.fetch_add(1, Ordering::SeqCst);
    });
    for id in 0..5 {
      notifier.notify(message(id, TaskCompletionStatus::Skipped));
    }
    notifier.shutdown();
    assert_eq!(seen.load(Ordering::SeqCst), 5);
  }

  #[test]
  fn test_panicking_handler_does_not_stop_others() {
    let notifier = CompletionNotifier::new(Arc::new("panicky".to_string()));
    let seen = Arc::new(AtomicUsize::new(0));
    notifier.add_handler(|_| panic!("handler failure"));
    let seen_clone = seen.clone();
    notifier.add_handler(move |_| {
      seen_clone.fetch_add(1, Ordering::SeqCst);
    });
    notifier.notify(message(7, TaskCompletionStatus::Panicked));
    notifier.notify(message(8, TaskCompletionStatus::Success));
    notifier.shutdown();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_status_from_outcome() {
    assert_eq!(
      TaskCompletionStatus::from(&TaskOutcome::Completed),
      TaskCompletionStatus::Success
    );
    assert_eq!(
      TaskCompletionStatus::from(&TaskOutcome::Panicked("x".into())),
      TaskCompletionStatus::Panicked
    );
  }
}
