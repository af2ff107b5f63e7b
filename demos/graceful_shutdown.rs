use std::thread;
use std::time::Duration;
use thread_orchestra::{Task, ThreadPoolManager};
use tracing::info;

fn work_task_fn(id: usize, duration_s: u64) {
  info!("Task {} starting (will run for {}s)", id, duration_s);
  thread::sleep(Duration::from_secs(duration_s));
  info!("Task {} finished after {}s", id, duration_s);
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Graceful Shutdown Example ---");

  let manager = ThreadPoolManager::new("graceful_shutdown_pool");
  manager.run_work(2).expect("Failed to start workers");

  // Tasks 0 and 1 start right away; 2, 3 and 4 wait in the queue.
  let tasks: Vec<Task> = (0..5)
    .map(|i| {
      let task = Task::from_fn(move || work_task_fn(i, 2));
      manager.enqueue(&task).expect("Failed to enqueue task");
      task
    })
    .collect();

  thread::sleep(Duration::from_millis(100)); // Let some tasks start
  info!(
    "Queue size: {}, Active: {}",
    manager.queued_task_count(),
    manager.active_task_count()
  );

  info!("Calling stop_work(); queued tasks are skipped, running ones finish.");
  manager.stop_work().expect("Graceful shutdown failed");

  for task in &tasks {
    info!("Task {} outcome: {:?}", task.id(), task.outcome());
  }

  info!("Restarting the pool with a single worker.");
  manager.run_work(1).expect("Failed to restart workers");
  let late = Task::from_fn(|| work_task_fn(99, 1));
  manager.enqueue(&late).expect("Failed to enqueue task");
  info!("Late task outcome: {:?}", late.wait_until_finished());
  manager.stop_work().expect("Graceful shutdown failed");

  info!("--- Graceful Shutdown Example End ---");
}
