use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use orchestrator_core::OrchestratorResult;
use orchestrator_domain::entities::{SlaveInfo, Task};
use orchestrator_domain::ports::{RingChange, StateStore};

/// 内存版状态留存实现
///
/// 核心按约定在注册、任务终态和环变更时写入。该实现只在进程内留存，
/// 主要用于审计查询和测试断言；持久化实现由宿主应用提供。
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    slaves: RwLock<HashMap<String, SlaveInfo>>,
    tasks: RwLock<HashMap<String, Task>>,
    ring_changes: RwLock<Vec<RingChange>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn slave_snapshot(&self, slave_id: &str) -> Option<SlaveInfo> {
        self.slaves.read().await.get(slave_id).cloned()
    }

    pub async fn task_snapshot(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn ring_changes(&self) -> Vec<RingChange> {
        self.ring_changes.read().await.clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn record_slave(&self, slave: &SlaveInfo) -> OrchestratorResult<()> {
        debug!("Recording slave snapshot: {}", slave.id);
        self.slaves
            .write()
            .await
            .insert(slave.id.clone(), slave.clone());
        Ok(())
    }

    async fn record_task(&self, task: &Task) -> OrchestratorResult<()> {
        debug!("Recording task snapshot: {} ({})", task.id, task.status);
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn record_ring_change(&self, change: RingChange) -> OrchestratorResult<()> {
        debug!(
            "Recording ring change: {} -> {} ({})",
            change.slave_id, change.to, change.reason
        );
        self.ring_changes.write().await.push(change);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orchestrator_domain::entities::{DeviceStatus, Ring};

    #[tokio::test]
    async fn test_records_are_queryable() {
        let store = InMemoryStateStore::new();

        let slave = SlaveInfo::new(
            "slave-1".into(),
            vec!["health_check".into()],
            DeviceStatus::new("dev-1"),
            Ring::Canary,
        );
        store.record_slave(&slave).await.unwrap();

        let change = RingChange {
            slave_id: "slave-1".into(),
            from: Some(Ring::Canary),
            to: Ring::Prod,
            reason: "manual".into(),
            changed_at: Utc::now(),
        };
        store.record_ring_change(change).await.unwrap();

        assert!(store.slave_snapshot("slave-1").await.is_some());
        let changes = store.ring_changes().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, Ring::Prod);
    }
}
