use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::notifier::{CompletionNotifier, InternalCompletionMessage, TaskCompletionInfo};
use crate::task::{Task, TaskLabel, TaskOutcome, TaskWork};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

/// Pending tasks and the running flag share one lock so that draining the
/// queue and stopping the workers is a single atomic step.
struct QueueState {
  tasks: VecDeque<Task>,
  running: bool,
  /// Bumped by every `run_work`; workers of an older run exit instead of
  /// serving the queue.
  generation: u64,
}

struct PoolShared {
  pool_name: Arc<String>,
  queue: Mutex<QueueState>,
  work_available: Condvar,
  active_task_info: DashMap<u64, Arc<HashSet<TaskLabel>>>,
  notifier: CompletionNotifier,
}

impl PoolShared {
  fn notify_completion(&self, task: &Task, outcome: &TaskOutcome) {
    self.notifier.notify(InternalCompletionMessage {
      task_id: task.id(),
      labels: task.shared_labels(),
      status: outcome.into(),
    });
  }
}

struct WorkerHandle {
  worker_id: usize,
  thread: JoinHandle<()>,
}

#[derive(Default)]
struct WorkerSet {
  active: Vec<WorkerHandle>,
  /// Workers of a previous run that could not be joined yet because
  /// `stop_work` was called from inside one of their tasks.
  retired: Vec<WorkerHandle>,
}

/// A fixed-size pool of OS worker threads executing [`Task`]s in FIFO order.
///
/// The manager is constructed without workers. `run_work` starts them and
/// `stop_work` skips whatever is still queued, then joins every worker; the
/// pair may be repeated any number of times. Dropping the manager stops it.
pub struct ThreadPoolManager {
  config: PoolConfig,
  shared: Arc<PoolShared>,
  workers: Mutex<WorkerSet>,
  thread_count: AtomicUsize,
  shutdown_token: Mutex<CancellationToken>,
}

impl std::fmt::Debug for ThreadPoolManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ThreadPoolManager")
      .field("pool_name", &self.shared.pool_name)
      .field("thread_count", &self.thread_count())
      .field("queued_task_count", &self.queued_task_count())
      .field("active_task_count", &self.active_task_count())
      .finish_non_exhaustive()
  }
}

impl ThreadPoolManager {
  pub fn new(pool_name: &str) -> Self {
    Self::with_config(pool_name, PoolConfig::default())
  }

  pub fn with_config(pool_name: &str, config: PoolConfig) -> Self {
    let pool_name = Arc::new(pool_name.to_string());
    Self {
      config,
      shared: Arc::new(PoolShared {
        pool_name: pool_name.clone(),
        queue: Mutex::new(QueueState {
          tasks: VecDeque::new(),
          running: false,
          generation: 0,
        }),
        work_available: Condvar::new(),
        active_task_info: DashMap::new(),
        notifier: CompletionNotifier::new(pool_name),
      }),
      workers: Mutex::new(WorkerSet::default()),
      thread_count: AtomicUsize::new(0),
      shutdown_token: Mutex::new(CancellationToken::new()),
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  /// Number of worker threads currently spawned, 0 while stopped.
  pub fn thread_count(&self) -> usize {
    self.thread_count.load(AtomicOrdering::Acquire)
  }

  pub fn is_running(&self) -> bool {
    self.shared.queue.lock().running
  }

  /// Returns the current number of tasks in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.shared.queue.lock().tasks.len()
  }

  /// Returns the number of tasks a worker is executing right now.
  pub fn active_task_count(&self) -> usize {
    self.shared.active_task_info.len()
  }

  /// Token cancelled when `stop_work` begins. Long-running work can poll it to
  /// return early; the pool never interrupts running work on its own.
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown_token.lock().clone()
  }

  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.shared.notifier.add_handler(handler);
  }

  /// Starts `config.thread_count` workers.
  pub fn run_default(&self) -> Result<(), PoolError> {
    self.run_work(self.config.thread_count)
  }

  /// Spawns `thread_count` workers that drain the queue until `stop_work`.
  ///
  /// # Errors
  /// `PoolError::AlreadyRunning` if the pool is running,
  /// `PoolError::InvalidThreadCount` for a zero count, and
  /// `PoolError::ThreadSpawn` if the OS refuses a thread, in which case the
  /// workers spawned so far are joined again and the queue is left as it was.
  pub fn run_work(&self, thread_count: usize) -> Result<(), PoolError> {
    if thread_count == 0 {
      return Err(PoolError::InvalidThreadCount);
    }

    let mut workers = self.workers.lock();
    let generation = {
      let mut queue = self.shared.queue.lock();
      if queue.running {
        warn!(pool_name = %self.shared.pool_name, "run_work: Pool is already running.");
        return Err(PoolError::AlreadyRunning);
      }
      queue.running = true;
      queue.generation += 1;
      queue.generation
    };
    self.reap_retired(&mut workers);

    {
      let mut token = self.shutdown_token.lock();
      if token.is_cancelled() {
        *token = CancellationToken::new();
      }
    }

    info!(pool_name = %self.shared.pool_name, thread_count, "Starting worker threads.");
    for worker_id in 0..thread_count {
      let mut builder = thread::Builder::new().name(self.config.worker_name(worker_id));
      if let Some(stack_size) = self.config.stack_size {
        builder = builder.stack_size(stack_size);
      }

      let shared = self.shared.clone();
      match builder.spawn(move || Self::run_worker_loop(shared, worker_id, generation)) {
        Ok(thread) => workers.active.push(WorkerHandle { worker_id, thread }),
        Err(e) => {
          error!(pool_name = %self.shared.pool_name, worker_id, "Failed to spawn worker thread: {}", e);
          self.abort_start(&mut workers);
          return Err(PoolError::ThreadSpawn(e.to_string()));
        }
      }
    }

    self.thread_count.store(workers.active.len(), AtomicOrdering::Release);
    // Tasks enqueued while stopped are waiting; make sure enough workers look.
    self.shared.work_available.notify_all();
    Ok(())
  }

  /// Appends a task to the back of the queue and wakes one idle worker.
  ///
  /// Tasks may be enqueued while the pool is stopped; they run after the next
  /// `run_work` or are skipped by the next `stop_work`.
  ///
  /// # Errors
  /// `PoolError::TaskAlreadyQueued` if the task is queued or running and
  /// `PoolError::TaskAlreadyFinished` if it finished and was not `redo`ne.
  pub fn enqueue(&self, task: &Task) -> Result<(), PoolError> {
    let mut queue = self.shared.queue.lock();
    if let Err(e) = task.mark_queued() {
      warn!(pool_name = %self.shared.pool_name, task_id = %task.id(), "Enqueue rejected: {}", e);
      return Err(e);
    }
    queue.tasks.push_back(task.clone());
    let running = queue.running;
    drop(queue);

    debug!(pool_name = %self.shared.pool_name, task_id = %task.id(), labels = ?task.labels(), running, "Task enqueued.");
    self.shared.work_available.notify_one();
    Ok(())
  }

  /// Creates a task from `work`, enqueues it and returns its handle.
  pub fn submit(&self, work: impl TaskWork) -> Result<Task, PoolError> {
    self.submit_with_labels(HashSet::new(), work)
  }

  pub fn submit_with_labels(&self, labels: HashSet<TaskLabel>, work: impl TaskWork) -> Result<Task, PoolError> {
    let task = Task::with_labels(labels, work);
    self.enqueue(&task)?;
    Ok(task)
  }

  pub fn skip_tasks_by_label(&self, label_to_skip: &TaskLabel) -> usize {
    self.skip_tasks_by_labels(&HashSet::from_iter([label_to_skip.clone()]))
  }

  /// Removes every queued task carrying one of `labels_to_skip` and skips it.
  /// Running tasks are not affected. Returns the number of tasks skipped.
  pub fn skip_tasks_by_labels(&self, labels_to_skip: &HashSet<TaskLabel>) -> usize {
    if labels_to_skip.is_empty() {
      return 0;
    }

    // Tasks already skipped by their owner are removed too and reported here.
    let skipped: Vec<Task> = {
      let mut queue = self.shared.queue.lock();
      let (matching, kept): (VecDeque<Task>, VecDeque<Task>) = queue
        .tasks
        .drain(..)
        .partition(|task| !task.shared_labels().is_disjoint(labels_to_skip));
      queue.tasks = kept;
      for task in &matching {
        task.take_and_skip();
      }
      matching.into_iter().collect()
    };

    info!(
      pool_name = %self.shared.pool_name,
      labels = ?labels_to_skip,
      "Skipped {} queued task(s) by label.",
      skipped.len()
    );
    for task in &skipped {
      self.shared.notify_completion(task, &TaskOutcome::Skipped);
    }
    skipped.len()
  }

  /// Skips every queued task, stops and joins all workers.
  ///
  /// Tasks already picked up by a worker are not interrupted; this call blocks
  /// until they return. On a stopped pool it only drains the queue.
  ///
  /// # Errors
  /// `PoolError::WorkerPanicked` if a worker thread died outside of task
  /// execution. All workers are joined regardless.
  pub fn stop_work(&self) -> Result<(), PoolError> {
    let mut workers = self.workers.lock();
    self.stop_locked(&mut workers)
  }

  fn stop_locked(&self, workers: &mut WorkerSet) -> Result<(), PoolError> {
    let (skipped, was_running) = {
      let mut queue = self.shared.queue.lock();
      let skipped: Vec<Task> = queue.tasks.drain(..).collect();
      for task in &skipped {
        task.take_and_skip();
      }
      let was_running = std::mem::replace(&mut queue.running, false);
      (skipped, was_running)
    };

    if was_running {
      info!(pool_name = %self.shared.pool_name, skipped = skipped.len(), "Stopping pool.");
    } else {
      debug!(pool_name = %self.shared.pool_name, skipped = skipped.len(), "stop_work on a stopped pool; queue drained.");
    }
    for task in &skipped {
      self.shared.notify_completion(task, &TaskOutcome::Skipped);
    }

    self.shutdown_token.lock().cancel();
    self.shared.work_available.notify_all();

    let panicked = self.join_workers(workers);
    self.thread_count.store(0, AtomicOrdering::Release);

    if was_running {
      info!(pool_name = %self.shared.pool_name, "Pool stopped.");
    }
    if panicked > 0 {
      Err(PoolError::WorkerPanicked(panicked))
    } else {
      Ok(())
    }
  }

  /// Joins every active and retired worker except the calling thread, which
  /// is kept as retired. Returns how many workers panicked.
  fn join_workers(&self, workers: &mut WorkerSet) -> usize {
    let current = thread::current().id();
    let mut panicked = 0;
    let handles: Vec<WorkerHandle> = workers.active.drain(..).chain(workers.retired.drain(..)).collect();
    for handle in handles {
      if handle.thread.thread().id() == current {
        warn!(pool_name = %self.shared.pool_name, worker_id = handle.worker_id, "stop_work called from a worker; it is joined once its task returns.");
        workers.retired.push(handle);
        continue;
      }
      match handle.thread.join() {
        Ok(()) => trace!(pool_name = %self.shared.pool_name, worker_id = handle.worker_id, "Worker joined."),
        Err(_) => {
          error!(pool_name = %self.shared.pool_name, worker_id = handle.worker_id, "Worker thread panicked.");
          panicked += 1;
        }
      }
    }
    panicked
  }

  /// Joins retired workers that have already exited; running ones stay retired.
  fn reap_retired(&self, workers: &mut WorkerSet) {
    let (finished, pending): (Vec<WorkerHandle>, Vec<WorkerHandle>) =
      workers.retired.drain(..).partition(|handle| handle.thread.is_finished());
    workers.retired = pending;
    for handle in finished {
      if handle.thread.join().is_err() {
        error!(pool_name = %self.shared.pool_name, worker_id = handle.worker_id, "Retired worker thread panicked.");
      }
    }
  }

  /// Undoes a partially failed `run_work`. Queued tasks stay queued.
  fn abort_start(&self, workers: &mut WorkerSet) {
    self.shared.queue.lock().running = false;
    self.shutdown_token.lock().cancel();
    self.shared.work_available.notify_all();
    let panicked = self.join_workers(workers);
    if panicked > 0 {
      error!(pool_name = %self.shared.pool_name, panicked, "Workers panicked while aborting start.");
    }
    self.thread_count.store(0, AtomicOrdering::Release);
  }

  fn run_worker_loop(shared: Arc<PoolShared>, worker_id: usize, generation: u64) {
    let _span = info_span!("pool_worker", pool_name = %*shared.pool_name, worker_id, generation).entered();
    debug!("Worker started.");

    loop {
      let (task, should_run) = {
        let mut queue = shared.queue.lock();
        while queue.running && queue.generation == generation && queue.tasks.is_empty() {
          shared.work_available.wait(&mut queue);
        }
        if !queue.running || queue.generation != generation {
          break;
        }
        let Some(task) = queue.tasks.pop_front() else {
          continue;
        };
        let should_run = task.take_for_run();
        (task, should_run)
      };

      if !should_run {
        trace!(task_id = %task.id(), "Dequeued task was skipped while queued, discarding.");
        shared.notify_completion(&task, &TaskOutcome::Skipped);
        continue;
      }

      let task_id = task.id();
      shared.active_task_info.insert(task_id, task.shared_labels());
      let outcome = info_span!("managed_task", %task_id).in_scope(|| {
        trace!("Running task.");
        task.solve()
      });
      shared.active_task_info.remove(&task_id);
      debug!(%task_id, ?outcome, "Task finished.");
      shared.notify_completion(&task, &outcome);
    }

    debug!("Worker stopped.");
  }
}

impl Drop for ThreadPoolManager {
  fn drop(&mut self) {
    let has_retired = !self.workers.lock().retired.is_empty();
    let needs_stop = {
      let queue = self.shared.queue.lock();
      queue.running || !queue.tasks.is_empty() || has_retired
    };
    if needs_stop {
      info!(pool_name = %*self.shared.pool_name, "ThreadPoolManager dropped. Stopping pool.");
      if let Err(e) = self.stop_work() {
        error!(pool_name = %*self.shared.pool_name, "Error while stopping pool on drop: {}", e);
      }
    }
    self.shared.notifier.shutdown();
  }
}
