use std::thread;
use std::time::Duration;
use thread_orchestra::{Task, ThreadPoolManager};
use tracing::info;

fn my_task_fn(id: usize, delay_ms: u64) {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  thread::sleep(Duration::from_millis(delay_ms));
  info!("Task {} finished successfully after {}ms", id, delay_ms);
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let manager = ThreadPoolManager::new("basic_pool");
  manager.run_work(2).expect("Failed to start workers");

  let mut tasks: Vec<Task> = Vec::new();
  for i in 0..5 {
    // Alternate sleep times for variety
    let sleep_duration: u64 = 500 + (i as u64 % 3 * 250);
    let task = Task::from_fn(move || my_task_fn(i, sleep_duration));
    match manager.enqueue(&task) {
      Ok(()) => {
        info!("Enqueued task {} with id {}", i, task.id());
        tasks.push(task);
      }
      Err(e) => tracing::error!("Failed to enqueue task {}: {:?}", i, e),
    }
  }

  info!("All tasks enqueued. Waiting for completion...");
  for task in &tasks {
    let outcome = task.wait_until_finished();
    info!("Task {} finished: {:?}", task.id(), outcome);
  }

  info!("All tasks finished. Stopping pool.");
  manager.stop_work().expect("Pool shutdown failed");
  info!("--- Basic Usage Example End ---");
}
