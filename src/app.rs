use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info};

use orchestrator_core::AppConfig;
use orchestrator_domain::ports::{MessageChannel, StateStore};
use orchestrator_infrastructure::{InMemoryChannel, InMemoryStateStore};
use orchestrator_master::MasterOrchestrator;
use orchestrator_slave::{
    AsyncFnHandler, BlockingFnHandler, SimulatedDeviceProbe, SlaveAgent, TaskContext,
};

use crate::shutdown::ShutdownManager;

/// 嵌入式演示应用：一个Master加若干模拟设备Slave，跑在内存通道上
pub struct Application {
    config: AppConfig,
    master: Arc<MasterOrchestrator>,
    agents: Vec<Arc<SlaveAgent>>,
}

impl Application {
    pub async fn new(config: AppConfig, agent_count: usize) -> Result<Self> {
        info!("初始化应用程序，Slave数量: {}", agent_count);

        let channel: Arc<InMemoryChannel> = Arc::new(InMemoryChannel::new());
        let state_store: Arc<InMemoryStateStore> = Arc::new(InMemoryStateStore::new());

        let master = MasterOrchestrator::new(
            config.clone(),
            Arc::clone(&channel) as Arc<dyn MessageChannel>,
            state_store as Arc<dyn StateStore>,
        )
        .await
        .context("创建Master编排器失败")?;

        let mut agents = Vec::with_capacity(agent_count);
        for i in 0..agent_count {
            let agent_id = format!("slave-{:03}", i + 1);
            let probe = Arc::new(SimulatedDeviceProbe::new(
                format!("Agent-{:03}", i + 1),
                "Android 14",
            ));
            let agent = SlaveAgent::new(
                agent_id,
                config.master.master_id.clone(),
                Vec::new(),
                Arc::clone(&channel) as Arc<dyn MessageChannel>,
                probe,
                config.slave.clone(),
            );
            register_demo_handlers(&agent).await;
            agents.push(agent);
        }

        Ok(Self {
            config,
            master,
            agents,
        })
    }

    /// 启动集群，周期提交演示任务并打印集群状态，直到收到关闭信号
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<()> {
        self.master.start().await.context("启动Master失败")?;

        for agent in &self.agents {
            // 单个Slave注册失败对集群非致命
            if let Err(e) = agent.start().await {
                error!("Slave {} 启动失败: {}", agent.id(), e);
            }
        }

        let mut shutdown_rx = shutdown.subscribe();
        let mut status_tick = tokio::time::interval(Duration::from_secs(5));
        let mut submit_tick = tokio::time::interval(Duration::from_secs(3));
        let mut round = 0u32;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止集群");
                    break;
                }
                _ = submit_tick.tick() => {
                    round += 1;
                    let task_id = self
                        .master
                        .submit_task(
                            if round % 2 == 0 { "checksum" } else { "health_check" },
                            json!({"round": round, "target": "fleet"}),
                            (round % 5) as i32,
                            2,
                        )
                        .await;
                    info!("演示任务已提交: {}", task_id);
                }
                _ = status_tick.tick() => {
                    let status = self.master.get_cluster_status().await;
                    info!(
                        "集群状态: {}个节点 (空闲{} 忙碌{} 死亡{}) 健康设备{} 任务[待派发{} 执行中{} 完成{} 失败{}] 环分布{:?}",
                        status.slaves.total,
                        status.slaves.idle,
                        status.slaves.busy,
                        status.slaves.dead,
                        status.healthy_devices,
                        status.tasks.pending,
                        status.tasks.assigned + status.tasks.running,
                        status.tasks.completed,
                        status.tasks.failed,
                        status.ring_distribution,
                    );
                }
            }
        }

        self.master.stop().await;
        for agent in &self.agents {
            agent.stop().await;
        }
        // 留一点时间让Slave上报中断任务后退出
        tokio::time::sleep(Duration::from_millis(
            self.config.slave.receive_timeout_ms * 2,
        ))
        .await;

        let status = self.master.get_cluster_status().await;
        info!(
            "集群已停止，最终任务统计: 完成{} 失败{} 未完结{}",
            status.tasks.completed,
            status.tasks.failed,
            status.tasks.total - status.tasks.completed - status.tasks.failed,
        );
        Ok(())
    }
}

/// 注册演示用的任务处理器：一个异步风格，一个同步阻塞风格
async fn register_demo_handlers(agent: &Arc<SlaveAgent>) {
    agent
        .register_handler(
            "health_check",
            Arc::new(AsyncFnHandler::new(
                "health_check",
                |ctx: TaskContext| async move {
                    ctx.progress.report("checking", 50).await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(json!({"healthy": true, "checked": ctx.parameters}))
                },
            )),
        )
        .await;

    agent
        .register_handler(
            "checksum",
            Arc::new(BlockingFnHandler::new("checksum", |params| {
                let payload = params.to_string();
                let checksum = payload
                    .bytes()
                    .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                Ok(json!({"checksum": checksum, "length": payload.len()}))
            })),
        )
        .await;
}
