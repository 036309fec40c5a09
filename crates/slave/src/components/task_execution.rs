use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::Message;
use orchestrator_domain::ports::MessageChannel;

use crate::handlers::{ProgressReporter, TaskContext};
use crate::registry::HandlerRegistry;

struct RunningTask {
    task_id: String,
    handle: JoinHandle<()>,
}

/// Executes assigned tasks, one at a time.
///
/// Single-task-per-slave model: a second assignment while busy is rejected
/// by the caller based on `try_start` returning false. Exactly one terminal
/// report (result or error) leaves this component per accepted task; the
/// current slot is cleared before reporting so a concurrent shutdown can
/// never produce a duplicate.
pub struct TaskExecutionManager {
    slave_id: String,
    master_id: String,
    channel: Arc<dyn MessageChannel>,
    handlers: Arc<HandlerRegistry>,
    current: Arc<RwLock<Option<RunningTask>>>,
}

impl TaskExecutionManager {
    pub fn new(
        slave_id: String,
        master_id: String,
        channel: Arc<dyn MessageChannel>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            slave_id,
            master_id,
            channel,
            handlers,
            current: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn is_busy(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn current_task(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|t| t.task_id.clone())
    }

    /// Accept the assignment unless already busy. Returns false on rejection.
    pub async fn try_start(
        &self,
        task_id: &str,
        task_type: &str,
        parameters: serde_json::Value,
    ) -> bool {
        let mut current = self.current.write().await;
        if current.is_some() {
            return false;
        }

        info!("Starting task {} (type: {})", task_id, task_type);

        let slave_id = self.slave_id.clone();
        let master_id = self.master_id.clone();
        let channel = Arc::clone(&self.channel);
        let handlers = Arc::clone(&self.handlers);
        let slot = Arc::clone(&self.current);
        let task_id_owned = task_id.to_string();
        let task_type_owned = task_type.to_string();

        let handle = tokio::spawn(async move {
            Self::execute(
                slave_id,
                master_id,
                channel,
                handlers,
                slot,
                task_id_owned,
                task_type_owned,
                parameters,
            )
            .await;
        });

        *current = Some(RunningTask {
            task_id: task_id.to_string(),
            handle,
        });
        true
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        slave_id: String,
        master_id: String,
        channel: Arc<dyn MessageChannel>,
        handlers: Arc<HandlerRegistry>,
        slot: Arc<RwLock<Option<RunningTask>>>,
        task_id: String,
        task_type: String,
        parameters: serde_json::Value,
    ) {
        let outcome = match handlers.get(&task_type).await {
            Some(handler) => {
                let ctx = TaskContext {
                    task_id: task_id.clone(),
                    parameters,
                    progress: ProgressReporter::new(
                        slave_id.clone(),
                        master_id.clone(),
                        task_id.clone(),
                        Arc::clone(&channel),
                    ),
                };
                handler.run(ctx).await
            }
            None => Err(OrchestratorError::handler_not_found(task_type.clone())),
        };

        // Free the slot before reporting: a shutdown arriving after this
        // point sees no in-flight task and will not double-report.
        {
            let mut current = slot.write().await;
            *current = None;
        }

        let message = match outcome {
            Ok(result) => {
                info!("Task {} completed", task_id);
                Message::task_result(&slave_id, &master_id, &task_id, result)
            }
            Err(e) => {
                warn!("Task {} failed: {}", task_id, e);
                Message::task_error(&slave_id, &master_id, Some(task_id.clone()), e.to_string())
            }
        };

        if let Err(e) = channel.send(message).await {
            error!("Failed to report task {} outcome: {}", task_id, e);
        }
    }

    /// Abort the in-flight task, if any, returning its id. The caller is
    /// responsible for reporting the interruption as a failure.
    pub async fn abort_current(&self) -> Option<String> {
        let mut current = self.current.write().await;
        current.take().map(|running| {
            running.handle.abort();
            running.task_id
        })
    }

    pub async fn report_interrupted(&self, task_id: &str, reason: &str) -> OrchestratorResult<()> {
        self.channel
            .send(Message::task_error(
                &self.slave_id,
                &self.master_id,
                Some(task_id.to_string()),
                reason,
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::AsyncFnHandler;
    use orchestrator_domain::entities::MessagePayload;
    use orchestrator_infrastructure::InMemoryChannel;
    use serde_json::json;
    use std::time::Duration;

    async fn manager_with_handler() -> (TaskExecutionManager, Arc<InMemoryChannel>) {
        let channel = Arc::new(InMemoryChannel::new());
        channel.register_endpoint("master-001").await.unwrap();

        let handlers = Arc::new(HandlerRegistry::new());
        handlers
            .register(
                "echo",
                Arc::new(AsyncFnHandler::new("echo", |ctx: TaskContext| async move {
                    Ok(json!({"echo": ctx.parameters}))
                })),
            )
            .await;
        handlers
            .register(
                "slow",
                Arc::new(AsyncFnHandler::new("slow", |_ctx: TaskContext| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!(null))
                })),
            )
            .await;

        let manager = TaskExecutionManager::new(
            "slave-1".into(),
            "master-001".into(),
            channel.clone() as Arc<dyn MessageChannel>,
            handlers,
        );
        (manager, channel)
    }

    #[tokio::test]
    async fn test_executes_and_reports_result() {
        let (manager, channel) = manager_with_handler().await;

        assert!(manager.try_start("t-1", "echo", json!({"n": 1})).await);

        let msg = channel
            .receive("master-001", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        match msg.payload {
            MessagePayload::TaskResult { task_id, result } => {
                assert_eq!(task_id, "t-1");
                assert_eq!(result, json!({"echo": {"n": 1}}));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        // slot is freed after completion
        assert!(!manager.is_busy().await);
    }

    #[tokio::test]
    async fn test_double_assignment_rejected_while_busy() {
        let (manager, _channel) = manager_with_handler().await;

        assert!(manager.try_start("t-1", "slow", json!({})).await);
        assert!(!manager.try_start("t-2", "echo", json!({})).await);
        assert_eq!(manager.current_task().await.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_unknown_task_type_reports_error() {
        let (manager, channel) = manager_with_handler().await;

        assert!(manager.try_start("t-1", "transcode", json!({})).await);

        let msg = channel
            .receive("master-001", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        match msg.payload {
            MessagePayload::Error { task_id, error } => {
                assert_eq!(task_id.as_deref(), Some("t-1"));
                assert!(error.contains("transcode"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_returns_in_flight_task() {
        let (manager, _channel) = manager_with_handler().await;

        assert!(manager.try_start("t-1", "slow", json!({})).await);
        assert_eq!(manager.abort_current().await.as_deref(), Some("t-1"));
        assert!(!manager.is_busy().await);
        // nothing left to abort
        assert!(manager.abort_current().await.is_none());
    }
}
