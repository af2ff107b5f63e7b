use std::collections::HashSet;
use std::thread;
use std::time::Duration;
use thread_orchestra::{Task, TaskLabel, ThreadPoolManager};
use tracing::info;

fn labeled_task(id: usize) {
  info!("Labeled task {} running", id);
  thread::sleep(Duration::from_millis(300));
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Label Skipping Example ---");

  let manager = ThreadPoolManager::new("label_pool");
  manager.run_work(1).expect("Failed to start workers");

  let label_a: TaskLabel = "group_a".to_string();
  let label_b: TaskLabel = "group_b".to_string();

  let tasks: Vec<Task> = (0..6)
    .map(|i| {
      let label = if i % 2 == 0 { label_a.clone() } else { label_b.clone() };
      manager
        .submit_with_labels(HashSet::from([label]), move || labeled_task(i))
        .expect("Failed to submit task")
    })
    .collect();

  thread::sleep(Duration::from_millis(50));
  let skipped = manager.skip_tasks_by_label(&label_b);
  info!("Skipped {} queued task(s) labeled {}", skipped, label_b);

  for task in &tasks {
    info!("Task {} {:?}: {:?}", task.id(), task.labels(), task.wait_until_finished());
  }

  manager.stop_work().expect("Pool shutdown failed");
  info!("--- Label Skipping Example End ---");
}
