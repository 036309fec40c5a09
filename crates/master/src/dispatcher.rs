use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use orchestrator_core::OrchestratorResult;
use orchestrator_domain::entities::Message;
use orchestrator_domain::ports::MessageChannel;

use crate::slave_registry::SlaveRegistry;
use crate::task_registry::TaskRegistry;

/// 任务派发循环
///
/// 贪心单遍匹配：每次取优先级最高的可派发任务，交给一个空闲且
/// 具备对应能力的节点，不做跨任务的全局最优装箱。
/// 由提交事件和节点空闲事件唤醒，另有兜底定时触发。
pub struct TaskDispatcher {
    master_id: String,
    tasks: Arc<TaskRegistry>,
    slaves: Arc<SlaveRegistry>,
    channel: Arc<dyn MessageChannel>,
    notify: Arc<Notify>,
    interval_ms: u64,
}

impl TaskDispatcher {
    pub fn new(
        master_id: String,
        tasks: Arc<TaskRegistry>,
        slaves: Arc<SlaveRegistry>,
        channel: Arc<dyn MessageChannel>,
        notify: Arc<Notify>,
        interval_ms: u64,
    ) -> Self {
        Self {
            master_id,
            tasks,
            slaves,
            channel,
            notify,
            interval_ms,
        }
    }

    /// 单轮派发，返回本轮派出的任务数
    pub async fn dispatch_once(&self) -> OrchestratorResult<usize> {
        let mut assigned = 0;

        loop {
            let idle_slaves = self.slaves.idle_snapshot().await;
            if idle_slaves.is_empty() {
                break;
            }

            let Some(task) = self
                .tasks
                .next_dispatchable(|task_type| idle_slaves.iter().any(|s| s.can_run(task_type)))
                .await
            else {
                break;
            };

            // 候选按完成任务数排序，取首个即为负载最轻者
            let candidates = self.slaves.idle_capable(&task.task_type).await;
            let Some(slave) = candidates.first() else {
                // 快照与登记表之间的瞬时不一致，重新快照
                continue;
            };

            // 存活监控可能在快照之后判死该节点，占用失败则重新快照
            if let Err(e) = self.slaves.mark_busy(&slave.id, &task.id).await {
                debug!("占用节点 {} 失败，重新选择: {}", slave.id, e);
                continue;
            }

            let task = match self.tasks.mark_assigned(&task.id, &slave.id).await {
                Ok(task) => task,
                Err(e) => {
                    // 任务状态已被并发事件改变，释放节点后继续
                    warn!("任务 {} 标记派发失败: {}", task.id, e);
                    let _ = self.slaves.mark_idle(&slave.id).await;
                    continue;
                }
            };

            self.channel
                .send(Message::task_assignment(&self.master_id, &slave.id, &task))
                .await?;

            info!(
                "任务 {} 已派发给节点 {} (类型: {}, 优先级: {})",
                task.id, slave.id, task.task_type, task.priority
            );
            assigned += 1;
        }

        Ok(assigned)
    }

    /// 派发循环主体，收到关闭信号后退出
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = interval(Duration::from_millis(self.interval_ms));
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tick.tick() => {}
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，退出任务派发循环");
                    break;
                }
            }

            if let Err(e) = self.dispatch_once().await {
                error!("任务派发出错: {}", e);
            }
        }
    }
}
