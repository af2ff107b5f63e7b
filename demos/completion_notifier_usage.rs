use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thread_orchestra::{Task, TaskCompletionInfo, TaskCompletionStatus, TaskLabel, ThreadPoolManager};
use tracing::info;

fn my_notified_task(id: usize, delay_ms: u64, should_panic: bool) {
  info!("NotifiedTask {}: Starting, will sleep for {}ms. Panic: {}", id, delay_ms, should_panic);
  thread::sleep(Duration::from_millis(delay_ms));
  if should_panic {
    panic!("NotifiedTask {} panicked!", id);
  }
  info!("NotifiedTask {} finished successfully after {}ms", id, delay_ms);
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Completion Notifier Example ---");

  let manager = ThreadPoolManager::new("notifier_example_pool");

  let successful_tasks_count = Arc::new(AtomicUsize::new(0));
  let other_tasks_count = Arc::new(AtomicUsize::new(0)); // Panicked or Skipped

  // Handler 1: Simple logger
  manager.add_completion_handler(|info: TaskCompletionInfo| {
    info!(
      "[Handler 1 - Logger] Task {} (Pool: {}) finished. Status: {:?}, Labels: {:?}",
      info.task_id, info.pool_name, info.status, info.labels
    );
  });

  // Handler 2: Counter
  let s_clone = successful_tasks_count.clone();
  let o_clone = other_tasks_count.clone();
  manager.add_completion_handler(move |info: TaskCompletionInfo| match info.status {
    TaskCompletionStatus::Success => {
      s_clone.fetch_add(1, Ordering::Relaxed);
    }
    _ => {
      o_clone.fetch_add(1, Ordering::Relaxed);
    }
  });

  let label_batch: TaskLabel = "batch_job".to_string();
  let tasks = vec![
    Task::from_fn(|| my_notified_task(0, 200, false)),
    Task::from_fn(|| my_notified_task(1, 100, true)),
    Task::with_labels(HashSet::from([label_batch.clone()]), || my_notified_task(2, 50, false)),
  ];
  for task in &tasks {
    manager.enqueue(task).expect("Failed to enqueue task");
  }

  // The batch job is skipped before any worker exists.
  manager.skip_tasks_by_label(&label_batch);
  manager.run_work(2).expect("Failed to start workers");

  for task in &tasks {
    task.wait_until_finished();
  }
  manager.stop_work().expect("Pool shutdown failed");
  // Dropping the manager joins the notifier, so every event is delivered.
  drop(manager);

  info!(
    "Successful: {}, panicked or skipped: {}",
    successful_tasks_count.load(Ordering::Relaxed),
    other_tasks_count.load(Ordering::Relaxed)
  );
  info!("--- Completion Notifier Example End ---");
}
