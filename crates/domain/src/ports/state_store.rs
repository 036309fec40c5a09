use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{Ring, SlaveInfo, Task};
use orchestrator_core::OrchestratorResult;

/// 环变更审计记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingChange {
    pub slave_id: String,
    pub from: Option<Ring>,
    pub to: Ring,
    pub reason: String,
    pub changed_at: DateTime<Utc>,
}

/// 可选的持久化接口
///
/// 核心只依赖内存状态即可正确运行；宿主应用可以接入数据库实现
/// 以便在进程生命周期之外留存Slave/任务/环变更记录。
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn record_slave(&self, slave: &SlaveInfo) -> OrchestratorResult<()>;

    async fn record_task(&self, task: &Task) -> OrchestratorResult<()>;

    async fn record_ring_change(&self, change: RingChange) -> OrchestratorResult<()>;
}
