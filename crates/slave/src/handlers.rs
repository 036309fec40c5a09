use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::Message;
use orchestrator_domain::ports::MessageChannel;

/// Best-effort progress reporting back to the master.
///
/// Handlers may call this at any point; delivery failures are logged and
/// swallowed so a flaky channel never fails an otherwise healthy task.
#[derive(Clone)]
pub struct ProgressReporter {
    slave_id: String,
    master_id: String,
    task_id: String,
    channel: Arc<dyn MessageChannel>,
}

impl ProgressReporter {
    pub fn new(
        slave_id: String,
        master_id: String,
        task_id: String,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            slave_id,
            master_id,
            task_id,
            channel,
        }
    }

    pub async fn report(&self, stage: &str, percent: u8) {
        let msg = Message::task_progress(
            &self.slave_id,
            &self.master_id,
            &self.task_id,
            stage,
            percent.min(100),
        );
        if let Err(e) = self.channel.send(msg).await {
            warn!("Failed to report progress for task {}: {}", self.task_id, e);
        }
    }
}

/// Everything a handler gets to work with for one task execution.
pub struct TaskContext {
    pub task_id: String,
    pub parameters: serde_json::Value,
    pub progress: ProgressReporter,
}

/// The single execution contract for all task handlers.
///
/// Synchronous and asynchronous handler styles are unified behind this trait
/// via the adapters below, so the agent never branches on calling convention.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> OrchestratorResult<serde_json::Value>;

    fn name(&self) -> &str;
}

/// Adapter for async closures.
pub struct AsyncFnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> AsyncFnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = OrchestratorResult<serde_json::Value>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for AsyncFnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = OrchestratorResult<serde_json::Value>> + Send,
{
    async fn run(&self, ctx: TaskContext) -> OrchestratorResult<serde_json::Value> {
        (self.f)(ctx).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Adapter for synchronous closures, executed on the blocking thread pool
/// so a long-running computation never stalls the agent's runtime.
pub struct BlockingFnHandler {
    name: String,
    f: Arc<dyn Fn(serde_json::Value) -> OrchestratorResult<serde_json::Value> + Send + Sync>,
}

impl BlockingFnHandler {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> OrchestratorResult<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl TaskHandler for BlockingFnHandler {
    async fn run(&self, ctx: TaskContext) -> OrchestratorResult<serde_json::Value> {
        let f = Arc::clone(&self.f);
        let parameters = ctx.parameters;
        tokio::task::spawn_blocking(move || f(parameters))
            .await
            .map_err(|e| OrchestratorError::execution(format!("blocking handler panicked: {e}")))?
    }

    fn name(&self) -> &str {
        &self.name
    }
}
