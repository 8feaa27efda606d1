/// Task Dispatcher - High-Level Orchestration
///
/// **Responsibility:**
/// Turn one inbound message into exactly one result.
///
/// **Architecture:**
/// 1. Decode and validate the message (malformed input is dropped, not answered)
/// 2. Pick the execution strategy from the task's mode (engine.rs)
/// 3. Run it on its own tokio task, bounded by a semaphore, so the
///    connection loop keeps reading
/// 4. Map the outcome to a result (evaluator.rs) and hand it to the
///    connection through a channel, in completion order
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How results are classified (evaluator's job)
/// - How results travel back (connection's job)

use std::sync::Arc;
use testmachine_common::protocol::{decode_task, ProtocolError};
use testmachine_common::types::{ExecutionMode, Task, TestResult};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, info_span, warn, Instrument};

use crate::engine::Executor;
use crate::evaluator;

/// Where finished results go; the connection session owns the receiver
pub type ResultSender = mpsc::UnboundedSender<TestResult>;

pub struct TaskDispatcher {
    local: Arc<dyn Executor>,
    docker: Arc<dyn Executor>,
    permits: Arc<Semaphore>,
}

impl TaskDispatcher {
    pub fn new(local: Arc<dyn Executor>, docker: Arc<dyn Executor>, max_concurrent: usize) -> Self {
        Self {
            local,
            docker,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    fn executor_for(&self, mode: ExecutionMode) -> Arc<dyn Executor> {
        match mode {
            ExecutionMode::Docker => Arc::clone(&self.docker),
            ExecutionMode::Local => Arc::clone(&self.local),
        }
    }

    /// Decode `raw` and start executing it in the background
    ///
    /// Returns immediately. The result is sent on `results` once the
    /// execution finishes.
    pub fn dispatch(&self, raw: &str, results: ResultSender) -> Result<JoinHandle<()>, ProtocolError> {
        let task = decode_task(raw)?;
        let task_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let executor = self.executor_for(task.mode);
        let permits = Arc::clone(&self.permits);

        info!(
            task_id = %task_id,
            mode = %task.mode,
            strategy = executor.name(),
            class_size = task.class_code.len(),
            test_size = task.test_code.len(),
            "Received task"
        );

        let span = info_span!("task", task_id = %task_id, mode = %task.mode);
        Ok(tokio::spawn(
            async move {
                let result = run_task(executor, task, permits).await;
                info!(
                    status = %result.status(),
                    exit_code = result.exit_code(),
                    "Execution completed"
                );
                if results.send(result).is_err() {
                    warn!("Connection gone before the result could be sent; result dropped");
                }
            }
            .instrument(span),
        ))
    }
}

/// Run one task under a concurrency permit; never fails
async fn run_task(executor: Arc<dyn Executor>, task: Task, permits: Arc<Semaphore>) -> TestResult {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return TestResult::internal_error("Internal Error: execution pool closed"),
    };

    // Nested task so a panicking executor still produces a result
    let handle = tokio::spawn(async move { executor.execute(&task).await });
    match handle.await {
        Ok(outcome) => evaluator::evaluate(outcome),
        Err(e) => {
            let message = describe_join_error(e);
            error!(error = %message, "Executor crashed");
            TestResult::internal_error(format!("Internal Error: {}", message))
        }
    }
}

fn describe_join_error(error: JoinError) -> String {
    if error.is_cancelled() {
        return "execution was cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use testmachine_common::types::TestStatus;

    enum Behavior {
        Exit(i64),
        Panic,
        /// Sleep for the given time, then echo the first line of the test code as logs
        Slow(Duration),
    }

    struct FakeExecutor {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl FakeExecutor {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, task: &Task) -> ExecutionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Exit(code) => ExecutionOutcome::Completed {
                    exit_code: code,
                    logs: self.name.to_string(),
                },
                Behavior::Panic => panic!("guest blew up the executor"),
                Behavior::Slow(delay) => {
                    let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_running.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    ExecutionOutcome::Completed {
                        exit_code: 0,
                        logs: task.test_code.clone(),
                    }
                }
            }
        }
    }

    fn message(test_code: &str, mode: Option<&str>) -> String {
        let mut value = serde_json::json!({
            "class_code": "class A:\n    pass\n",
            "test_code": test_code,
        });
        if let Some(mode) = mode {
            value["mode"] = serde_json::Value::String(mode.to_string());
        }
        value.to_string()
    }

    #[tokio::test]
    async fn test_routes_by_mode() {
        let local = FakeExecutor::new("local", Behavior::Exit(0));
        let docker = FakeExecutor::new("docker", Behavior::Exit(1));
        let dispatcher = TaskDispatcher::new(local.clone(), docker.clone(), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.dispatch(&message("t", Some("docker")), tx.clone()).unwrap().await.unwrap();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.status(), TestStatus::Failure);
        assert_eq!(result.logs(), "docker");

        dispatcher.dispatch(&message("t", None), tx.clone()).unwrap().await.unwrap();
        dispatcher.dispatch(&message("t", Some("kubernetes")), tx).unwrap().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().logs(), "local");
        assert_eq!(rx.recv().await.unwrap().logs(), "local");

        assert_eq!(local.calls.load(Ordering::SeqCst), 2);
        assert_eq!(docker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let local = FakeExecutor::new("local", Behavior::Exit(0));
        let dispatcher = TaskDispatcher::new(local.clone(), FakeExecutor::new("docker", Behavior::Exit(0)), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(dispatcher.dispatch("{not json", tx.clone()).is_err());
        assert!(dispatcher.dispatch(r#"{"class_code":"only half"}"#, tx).is_err());

        assert!(rx.recv().await.is_none());
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_executor_panic_becomes_internal_error() {
        let dispatcher = TaskDispatcher::new(
            FakeExecutor::new("local", Behavior::Panic),
            FakeExecutor::new("docker", Behavior::Exit(0)),
            1,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.dispatch(&message("t", None), tx).unwrap().await.unwrap();

        let result = rx.recv().await.unwrap();
        assert_eq!(result.status(), TestStatus::Error);
        assert_eq!(result.exit_code(), 500);
        assert!(result.logs().contains("guest blew up the executor"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let local = FakeExecutor::new("local", Behavior::Slow(Duration::from_millis(50)));
        let dispatcher = TaskDispatcher::new(local.clone(), FakeExecutor::new("docker", Behavior::Exit(0)), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handles: Vec<_> = (0..5)
            .map(|i| dispatcher.dispatch(&message(&format!("task {}", i), None), tx.clone()).unwrap())
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        drop(tx);

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 5);
        assert!(local.max_running.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_results_arrive_in_completion_order() {
        let slow = FakeExecutor::new("docker", Behavior::Slow(Duration::from_millis(300)));
        let fast = FakeExecutor::new("local", Behavior::Slow(Duration::from_millis(10)));
        let dispatcher = TaskDispatcher::new(fast, slow, 4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.dispatch(&message("first", Some("docker")), tx.clone()).unwrap();
        dispatcher.dispatch(&message("second", Some("local")), tx).unwrap();

        assert_eq!(rx.recv().await.unwrap().logs(), "second");
        assert_eq!(rx.recv().await.unwrap().logs(), "first");
    }
}
