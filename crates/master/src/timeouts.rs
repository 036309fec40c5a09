use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Notify};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::slave_registry::SlaveRegistry;
use crate::task_registry::{RetryDecision, TaskRegistry};

/// 任务超时监控配置
#[derive(Debug, Clone)]
pub struct TaskTimeoutConfig {
    /// 任务在无任何进展的情况下允许占用节点的最长时间（秒）
    pub task_timeout_seconds: i64,
    /// 检测间隔（秒）
    pub check_interval_seconds: u64,
}

impl Default for TaskTimeoutConfig {
    fn default() -> Self {
        Self {
            task_timeout_seconds: 60,
            check_interval_seconds: 10,
        }
    }
}

/// 任务超时监控
///
/// 派发出去后长时间没有结果也没有进度上报的任务按执行失败处理，
/// 走统一的重试路径，同时释放被占用的节点。
/// 进度上报会刷新任务活动时间，长任务只要持续汇报就不会被误杀。
pub struct TaskTimeoutMonitor {
    tasks: Arc<TaskRegistry>,
    slaves: Arc<SlaveRegistry>,
    dispatch_notify: Arc<Notify>,
    config: TaskTimeoutConfig,
}

impl TaskTimeoutMonitor {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        slaves: Arc<SlaveRegistry>,
        dispatch_notify: Arc<Notify>,
        config: TaskTimeoutConfig,
    ) -> Self {
        Self {
            tasks,
            slaves,
            dispatch_notify,
            config,
        }
    }

    /// 单轮扫描，返回处理的超时任务数
    pub async fn scan_once(&self) -> usize {
        let stale = self
            .tasks
            .stale_tasks(Utc::now(), self.config.task_timeout_seconds)
            .await;
        if stale.is_empty() {
            return 0;
        }

        info!("检测到 {} 个超时任务", stale.len());
        let mut handled = 0;

        for task_id in stale {
            // 先取持有者，失败处理会清空assigned_to
            let holder = self
                .tasks
                .get(&task_id)
                .await
                .and_then(|t| t.assigned_to);

            match self
                .tasks
                .handle_failure(&task_id, "任务执行超时".to_string())
                .await
            {
                Ok((_, RetryDecision::Requeued { retry_count })) => {
                    warn!("任务 {} 超时，重新排队（第 {} 次重试）", task_id, retry_count);
                    self.dispatch_notify.notify_one();
                    handled += 1;
                }
                Ok((_, RetryDecision::Exhausted)) => {
                    warn!("任务 {} 超时且重试用尽，进入终态失败", task_id);
                    handled += 1;
                }
                Err(e) => {
                    error!("处理超时任务 {} 失败: {}", task_id, e);
                    continue;
                }
            }

            // 释放仍持有该任务的节点
            if let Some(slave_id) = holder {
                if let Err(e) = self.slaves.task_finished(&slave_id, &task_id, false).await {
                    warn!("释放节点 {} 失败: {}", slave_id, e);
                }
            }
        }
        handled
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = interval(Duration::from_secs(self.config.check_interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.scan_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，退出任务超时监控循环");
                    break;
                }
            }
        }
    }
}
