use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{DeviceStatus, Ring, SlaveInfo, SlaveStatus};

/// 各状态Slave数量汇总
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlaveCounts {
    pub total: usize,
    pub registered: usize,
    pub idle: usize,
    pub busy: usize,
    pub dead: usize,
}

/// Slave节点登记表
///
/// 死亡节点保留在表中供审计查询，但被排除在派发和环成员之外，
/// 不做物理删除。
pub struct SlaveRegistry {
    slaves: RwLock<HashMap<String, SlaveInfo>>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self {
            slaves: RwLock::new(HashMap::new()),
        }
    }

    /// 注册新节点。存活节点重复注册报错；
    /// 已死亡的同名节点允许重新上线，覆盖旧记录。
    pub async fn register(
        &self,
        slave_id: &str,
        capabilities: Vec<String>,
        device: DeviceStatus,
        ring: Ring,
    ) -> OrchestratorResult<SlaveInfo> {
        let mut slaves = self.slaves.write().await;
        if let Some(existing) = slaves.get(slave_id) {
            if existing.is_alive() {
                return Err(OrchestratorError::SlaveAlreadyRegistered {
                    id: slave_id.to_string(),
                });
            }
            info!("死亡节点 {} 重新上线，覆盖旧记录", slave_id);
        }

        let slave = SlaveInfo::new(slave_id.to_string(), capabilities, device, ring);
        slaves.insert(slave_id.to_string(), slave.clone());
        Ok(slave)
    }

    /// 刷新心跳时间，可携带最新设备快照
    pub async fn heartbeat(
        &self,
        slave_id: &str,
        device: Option<DeviceStatus>,
    ) -> OrchestratorResult<()> {
        let mut slaves = self.slaves.write().await;
        let slave = alive_mut(&mut slaves, slave_id)?;
        slave.last_heartbeat = Utc::now();
        if let Some(device) = device {
            slave.device = device;
        }
        Ok(())
    }

    pub async fn update_device(
        &self,
        slave_id: &str,
        device: DeviceStatus,
    ) -> OrchestratorResult<()> {
        let mut slaves = self.slaves.write().await;
        let slave = alive_mut(&mut slaves, slave_id)?;
        debug!(
            "更新设备状态 {}: 电量={:.0}% CPU={:.1}% 内存={:.1}%",
            slave_id, device.battery_level, device.cpu_usage, device.memory_usage
        );
        slave.device = device;
        Ok(())
    }

    /// REGISTERED|BUSY -> IDLE
    pub async fn mark_idle(&self, slave_id: &str) -> OrchestratorResult<()> {
        let mut slaves = self.slaves.write().await;
        let slave = alive_mut(&mut slaves, slave_id)?;
        slave.status = SlaveStatus::Idle;
        slave.current_task = None;
        Ok(())
    }

    /// IDLE -> BUSY，非空闲节点拒绝占用
    pub async fn mark_busy(&self, slave_id: &str, task_id: &str) -> OrchestratorResult<()> {
        let mut slaves = self.slaves.write().await;
        let slave = alive_mut(&mut slaves, slave_id)?;
        if slave.status != SlaveStatus::Idle {
            return Err(OrchestratorError::Internal(format!(
                "Slave {} 当前状态为 {}，不能接收新任务",
                slave_id, slave.status
            )));
        }
        slave.status = SlaveStatus::Busy;
        slave.current_task = Some(task_id.to_string());
        Ok(())
    }

    /// 任务完结后释放节点。只有当该节点确实持有这个任务时才生效，
    /// 迟到的过期上报（节点已被判死并重新分配）不会扰乱状态。
    pub async fn task_finished(
        &self,
        slave_id: &str,
        task_id: &str,
        success: bool,
    ) -> OrchestratorResult<()> {
        let mut slaves = self.slaves.write().await;
        let Some(slave) = slaves.get_mut(slave_id) else {
            return Err(OrchestratorError::slave_not_found(slave_id));
        };
        if slave.current_task.as_deref() != Some(task_id) {
            debug!("忽略Slave {} 的过期任务完结上报: {}", slave_id, task_id);
            return Ok(());
        }
        if success {
            slave.completed_tasks += 1;
        } else {
            slave.failed_tasks += 1;
        }
        if slave.is_alive() {
            slave.status = SlaveStatus::Idle;
        }
        slave.current_task = None;
        Ok(())
    }

    /// 判死节点，返回其持有的任务id（如有）
    pub async fn mark_dead(&self, slave_id: &str) -> OrchestratorResult<Option<String>> {
        let mut slaves = self.slaves.write().await;
        let Some(slave) = slaves.get_mut(slave_id) else {
            return Err(OrchestratorError::slave_not_found(slave_id));
        };
        slave.status = SlaveStatus::Dead;
        Ok(slave.current_task.take())
    }

    /// 变更环归属，仅对存活节点有效。返回原环
    pub async fn set_ring(&self, slave_id: &str, ring: Ring) -> OrchestratorResult<Ring> {
        let mut slaves = self.slaves.write().await;
        let slave = alive_mut(&mut slaves, slave_id)?;
        let old = slave.ring;
        slave.ring = ring;
        Ok(old)
    }

    pub async fn get(&self, slave_id: &str) -> Option<SlaveInfo> {
        self.slaves.read().await.get(slave_id).cloned()
    }

    pub async fn list(&self) -> Vec<SlaveInfo> {
        self.slaves.read().await.values().cloned().collect()
    }

    /// 空闲且具备指定能力的节点，按完成任务数和id排序保证选择稳定
    pub async fn idle_capable(&self, task_type: &str) -> Vec<SlaveInfo> {
        let slaves = self.slaves.read().await;
        let mut result: Vec<SlaveInfo> = slaves
            .values()
            .filter(|s| s.is_idle() && s.can_run(task_type))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.completed_tasks
                .cmp(&b.completed_tasks)
                .then_with(|| a.id.cmp(&b.id))
        });
        result
    }

    /// 所有空闲节点快照，派发循环使用
    pub async fn idle_snapshot(&self) -> Vec<SlaveInfo> {
        let slaves = self.slaves.read().await;
        let mut result: Vec<SlaveInfo> = slaves.values().filter(|s| s.is_idle()).cloned().collect();
        result.sort_by(|a, b| {
            a.completed_tasks
                .cmp(&b.completed_tasks)
                .then_with(|| a.id.cmp(&b.id))
        });
        result
    }

    /// 心跳超时的存活节点
    pub async fn timed_out(&self, now: DateTime<Utc>, timeout_seconds: i64) -> Vec<String> {
        let slaves = self.slaves.read().await;
        slaves
            .values()
            .filter(|s| s.is_alive() && (now - s.last_heartbeat).num_seconds() > timeout_seconds)
            .map(|s| s.id.clone())
            .collect()
    }

    /// 各环的存活成员数。死亡节点不参与环成员统计
    pub async fn ring_counts(&self) -> HashMap<Ring, usize> {
        let slaves = self.slaves.read().await;
        let mut counts: HashMap<Ring, usize> = Ring::ALL.iter().map(|r| (*r, 0)).collect();
        for slave in slaves.values().filter(|s| s.is_alive()) {
            *counts.entry(slave.ring).or_insert(0) += 1;
        }
        counts
    }

    pub async fn counts(&self) -> SlaveCounts {
        let slaves = self.slaves.read().await;
        let mut counts = SlaveCounts {
            total: slaves.len(),
            ..Default::default()
        };
        for slave in slaves.values() {
            match slave.status {
                SlaveStatus::Registered => counts.registered += 1,
                SlaveStatus::Idle => counts.idle += 1,
                SlaveStatus::Busy => counts.busy += 1,
                SlaveStatus::Dead => counts.dead += 1,
            }
        }
        counts
    }
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn alive_mut<'a>(
    slaves: &'a mut HashMap<String, SlaveInfo>,
    slave_id: &str,
) -> OrchestratorResult<&'a mut SlaveInfo> {
    match slaves.get_mut(slave_id) {
        Some(slave) if slave.is_alive() => Ok(slave),
        _ => Err(OrchestratorError::slave_not_found(slave_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn register(registry: &SlaveRegistry, id: &str) -> SlaveInfo {
        registry
            .register(
                id,
                vec!["health_check".into()],
                DeviceStatus::new(id),
                Ring::Dev,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_duplicate_rejection() {
        let registry = SlaveRegistry::new();
        let slave = register(&registry, "slave-1").await;
        assert_eq!(slave.status, SlaveStatus::Registered);

        let err = registry
            .register("slave-1", vec![], DeviceStatus::new("x"), Ring::Dev)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::SlaveAlreadyRegistered { .. }
        ));
    }

    #[tokio::test]
    async fn test_dead_slave_can_reregister() {
        let registry = SlaveRegistry::new();
        register(&registry, "slave-1").await;
        registry.mark_dead("slave-1").await.unwrap();

        // 死亡节点重新上线
        let revived = registry
            .register(
                "slave-1",
                vec!["monitor".into()],
                DeviceStatus::new("slave-1"),
                Ring::Canary,
            )
            .await
            .unwrap();
        assert_eq!(revived.status, SlaveStatus::Registered);
        assert_eq!(registry.counts().await.dead, 0);
    }

    #[tokio::test]
    async fn test_busy_requires_idle() {
        let registry = SlaveRegistry::new();
        register(&registry, "slave-1").await;

        // 刚注册尚未就绪，不能直接占用
        assert!(registry.mark_busy("slave-1", "t-1").await.is_err());

        registry.mark_idle("slave-1").await.unwrap();
        registry.mark_busy("slave-1", "t-1").await.unwrap();

        // 单任务模型：忙碌节点拒绝第二个任务
        assert!(registry.mark_busy("slave-1", "t-2").await.is_err());
    }

    #[tokio::test]
    async fn test_task_finished_ignores_stale_reports() {
        let registry = SlaveRegistry::new();
        register(&registry, "slave-1").await;
        registry.mark_idle("slave-1").await.unwrap();
        registry.mark_busy("slave-1", "t-1").await.unwrap();

        // 与当前持有任务不符的上报被忽略
        registry
            .task_finished("slave-1", "t-other", true)
            .await
            .unwrap();
        let slave = registry.get("slave-1").await.unwrap();
        assert_eq!(slave.status, SlaveStatus::Busy);
        assert_eq!(slave.completed_tasks, 0);

        registry.task_finished("slave-1", "t-1", true).await.unwrap();
        let slave = registry.get("slave-1").await.unwrap();
        assert_eq!(slave.status, SlaveStatus::Idle);
        assert_eq!(slave.completed_tasks, 1);
        assert!(slave.current_task.is_none());
    }

    #[tokio::test]
    async fn test_mark_dead_returns_held_task() {
        let registry = SlaveRegistry::new();
        register(&registry, "slave-1").await;
        registry.mark_idle("slave-1").await.unwrap();
        registry.mark_busy("slave-1", "t-1").await.unwrap();

        let held = registry.mark_dead("slave-1").await.unwrap();
        assert_eq!(held.as_deref(), Some("t-1"));

        // 死亡节点不再出现在空闲集合或环统计中
        assert!(registry.idle_capable("health_check").await.is_empty());
        let rings = registry.ring_counts().await;
        assert_eq!(rings.values().sum::<usize>(), 0);
        // 但保留在表中供审计
        assert!(registry.get("slave-1").await.is_some());
        assert_eq!(registry.counts().await.dead, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_detection() {
        let registry = SlaveRegistry::new();
        register(&registry, "slave-1").await;
        register(&registry, "slave-2").await;

        registry.heartbeat("slave-1", None).await.unwrap();

        let later = Utc::now() + Duration::seconds(30);
        let timed_out = registry.timed_out(later, 20).await;
        assert_eq!(timed_out.len(), 2);

        let soon = Utc::now() + Duration::seconds(5);
        assert!(registry.timed_out(soon, 20).await.is_empty());
    }

    #[tokio::test]
    async fn test_set_ring_rejected_for_dead() {
        let registry = SlaveRegistry::new();
        register(&registry, "slave-1").await;

        let old = registry.set_ring("slave-1", Ring::Prod).await.unwrap();
        assert_eq!(old, Ring::Dev);

        registry.mark_dead("slave-1").await.unwrap();
        assert!(registry.set_ring("slave-1", Ring::Canary).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_capable_filters_and_orders() {
        let registry = SlaveRegistry::new();
        for id in ["slave-a", "slave-b"] {
            register(&registry, id).await;
            registry.mark_idle(id).await.unwrap();
        }
        registry
            .register(
                "slave-c",
                vec!["transcode".into()],
                DeviceStatus::new("slave-c"),
                Ring::Dev,
            )
            .await
            .unwrap();
        registry.mark_idle("slave-c").await.unwrap();

        let capable = registry.idle_capable("health_check").await;
        let ids: Vec<&str> = capable.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["slave-a", "slave-b"]);
    }
}
