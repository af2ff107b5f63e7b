use std::thread;
use std::time::Duration;
use thread_orchestra::{PoolError, Task, ThreadPoolManager};
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Task Panic Example ---");

  let manager = ThreadPoolManager::new("panic_pool");
  manager.run_work(1).expect("Failed to start workers");

  let panicking = Task::from_fn(|| {
    info!("Panicking Task: Starting...");
    thread::sleep(Duration::from_millis(100));
    info!("Panicking Task: About to panic!");
    panic!("This task is designed to panic!");
  });
  manager.enqueue(&panicking).expect("Failed to enqueue panicking task");
  info!("Panicking task {} enqueued. Waiting...", panicking.id());

  match panicking.wait_result() {
    Ok(()) => info!("Task {} completed UNEXPECTEDLY.", panicking.id()),
    Err(PoolError::TaskPanicked(message)) => {
      info!("Task {} correctly resulted in TaskPanicked: {}", panicking.id(), message);
    }
    Err(e) => info!("Task {} resulted in unexpected error: {:?}", panicking.id(), e),
  }

  // The worker that caught the panic keeps serving the queue.
  let follow_up = Task::from_fn(|| info!("Follow-up task ran on the surviving worker."));
  manager.enqueue(&follow_up).expect("Failed to enqueue follow-up task");
  follow_up.wait_until_finished();

  manager.stop_work().expect("Pool shutdown failed");
  info!("--- Task Panic Example End ---");
}
