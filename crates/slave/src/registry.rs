use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::handlers::TaskHandler;

/// Maps task-type tags to their executable handlers.
///
/// Registration is expected before the agent starts; looking up an
/// unregistered type at execution time yields a task failure, not a crash.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        info!("Registered handler '{}' for task type '{}'", handler.name(), task_type);
        self.handlers.write().await.insert(task_type, handler);
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    pub async fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}
