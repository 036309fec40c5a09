use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Notify};
use tokio::time::interval;
use tracing::{error, info, warn};

use orchestrator_core::OrchestratorResult;

use crate::slave_registry::SlaveRegistry;
use crate::task_registry::{RetryDecision, TaskRegistry};

/// 存活监控配置
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// 心跳超时时间（秒）
    pub slave_timeout_seconds: i64,
    /// 检测间隔（秒）
    pub check_interval_seconds: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            slave_timeout_seconds: 20,
            check_interval_seconds: 5,
        }
    }
}

/// Slave存活监控
///
/// 周期扫描心跳超时的存活节点并判死。节点死亡对集群非致命：
/// 其持有的任务走与执行失败完全相同的重试路径，保证不丢任务。
/// 心跳丢失即视为死亡，接受网络分区下的误判换取自愈能力。
pub struct LivenessMonitor {
    slaves: Arc<SlaveRegistry>,
    tasks: Arc<TaskRegistry>,
    dispatch_notify: Arc<Notify>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(
        slaves: Arc<SlaveRegistry>,
        tasks: Arc<TaskRegistry>,
        dispatch_notify: Arc<Notify>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            slaves,
            tasks,
            dispatch_notify,
            config,
        }
    }

    /// 检测心跳超时的节点
    pub async fn detect_timed_out(&self) -> Vec<String> {
        self.slaves
            .timed_out(Utc::now(), self.config.slave_timeout_seconds)
            .await
    }

    /// 处理死亡节点：判死、移出环成员、回收其任务
    pub async fn handle_dead_slave(&self, slave_id: &str) -> OrchestratorResult<()> {
        warn!(
            "节点 {} 超过 {} 秒未上报心跳，标记为死亡",
            slave_id, self.config.slave_timeout_seconds
        );

        let held = self.slaves.mark_dead(slave_id).await?;

        // 以任务注册表为准收集该节点持有的任务，与登记的当前任务合并去重
        let mut orphaned: BTreeSet<String> =
            self.tasks.assigned_to_slave(slave_id).await.into_iter().collect();
        if let Some(task_id) = held {
            orphaned.insert(task_id);
        }

        for task_id in orphaned {
            let error = format!("节点 {slave_id} 心跳超时");
            match self.tasks.handle_failure(&task_id, error).await {
                Ok((_, RetryDecision::Requeued { retry_count })) => {
                    info!(
                        "任务 {} 因节点死亡重新排队（第 {} 次重试）",
                        task_id, retry_count
                    );
                    self.dispatch_notify.notify_one();
                }
                Ok((_, RetryDecision::Exhausted)) => {
                    warn!("任务 {} 重试次数用尽，进入终态失败", task_id);
                }
                Err(e) => {
                    error!("回收死亡节点 {} 的任务 {} 失败: {}", slave_id, task_id, e);
                }
            }
        }
        Ok(())
    }

    /// 单轮扫描
    pub async fn scan_once(&self) {
        let dead = self.detect_timed_out().await;
        if dead.is_empty() {
            return;
        }
        info!("检测到 {} 个心跳超时的节点", dead.len());
        for slave_id in dead {
            if let Err(e) = self.handle_dead_slave(&slave_id).await {
                error!("处理死亡节点 {} 时出错: {}", slave_id, e);
            }
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = interval(Duration::from_secs(self.config.check_interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => self.scan_once().await,
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，退出存活监控循环");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::entities::{DeviceStatus, Ring, TaskStatus};
    use serde_json::json;

    fn monitor(
        slaves: &Arc<SlaveRegistry>,
        tasks: &Arc<TaskRegistry>,
        timeout_seconds: i64,
    ) -> LivenessMonitor {
        LivenessMonitor::new(
            Arc::clone(slaves),
            Arc::clone(tasks),
            Arc::new(Notify::new()),
            LivenessConfig {
                slave_timeout_seconds: timeout_seconds,
                check_interval_seconds: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_dead_slave_task_is_requeued_with_retry_increment() {
        let slaves = Arc::new(SlaveRegistry::new());
        let tasks = Arc::new(TaskRegistry::new());
        let monitor = monitor(&slaves, &tasks, 20);

        slaves
            .register(
                "slave-1",
                vec!["health_check".into()],
                DeviceStatus::new("slave-1"),
                Ring::Dev,
            )
            .await
            .unwrap();
        slaves.mark_idle("slave-1").await.unwrap();

        let task = tasks.submit("health_check".into(), json!({}), 0, 3).await;
        tasks.mark_assigned(&task.id, "slave-1").await.unwrap();
        slaves.mark_busy("slave-1", &task.id).await.unwrap();

        monitor.handle_dead_slave("slave-1").await.unwrap();

        // 任务回到PENDING，重试计数加一
        let task = tasks.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.assigned_to.is_none());

        // 节点被判死并移出环成员
        let slave = slaves.get("slave-1").await.unwrap();
        assert!(!slave.is_alive());
        assert_eq!(slaves.ring_counts().await.values().sum::<usize>(), 0);
    }

    #[tokio::test]
    async fn test_dead_slave_with_exhausted_task_yields_failed() {
        let slaves = Arc::new(SlaveRegistry::new());
        let tasks = Arc::new(TaskRegistry::new());
        let monitor = monitor(&slaves, &tasks, 20);

        slaves
            .register(
                "slave-1",
                vec!["health_check".into()],
                DeviceStatus::new("slave-1"),
                Ring::Dev,
            )
            .await
            .unwrap();
        slaves.mark_idle("slave-1").await.unwrap();

        // 重试上限为0：节点一死任务即终态失败
        let task = tasks.submit("health_check".into(), json!({}), 0, 0).await;
        tasks.mark_assigned(&task.id, "slave-1").await.unwrap();
        slaves.mark_busy("slave-1", &task.id).await.unwrap();

        monitor.handle_dead_slave("slave-1").await.unwrap();

        let task = tasks.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("心跳超时"));
    }

    #[tokio::test]
    async fn test_idle_dead_slave_requeues_nothing() {
        let slaves = Arc::new(SlaveRegistry::new());
        let tasks = Arc::new(TaskRegistry::new());
        let monitor = monitor(&slaves, &tasks, 20);

        slaves
            .register(
                "slave-1",
                vec!["health_check".into()],
                DeviceStatus::new("slave-1"),
                Ring::Dev,
            )
            .await
            .unwrap();
        slaves.mark_idle("slave-1").await.unwrap();

        monitor.handle_dead_slave("slave-1").await.unwrap();
        assert_eq!(tasks.counts().await.total, 0);
    }

    #[tokio::test]
    async fn test_detect_respects_timeout_threshold() {
        let slaves = Arc::new(SlaveRegistry::new());
        let tasks = Arc::new(TaskRegistry::new());
        // 超时阈值非常大时，刚注册的节点不会被检出
        let monitor = monitor(&slaves, &tasks, 3600);

        slaves
            .register(
                "slave-1",
                vec!["health_check".into()],
                DeviceStatus::new("slave-1"),
                Ring::Dev,
            )
            .await
            .unwrap();

        assert!(monitor.detect_timed_out().await.is_empty());
    }
}
