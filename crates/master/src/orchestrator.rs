use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use orchestrator_core::{AppConfig, OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{
    DeviceStatus, Message, MessagePayload, Ring, SlaveInfo, TaskStatus,
};
use orchestrator_domain::ports::{ChannelStats, MessageChannel, StateStore};

use crate::dispatcher::TaskDispatcher;
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::rebalancer::{apply_ring_change, RingRebalancer};
use crate::ring_policy::RingPolicy;
use crate::slave_registry::{SlaveCounts, SlaveRegistry};
use crate::task_registry::{RetryDecision, TaskCounts, TaskRegistry};
use crate::timeouts::{TaskTimeoutConfig, TaskTimeoutMonitor};

/// 集群状态汇总，按需实时计算，不做缓存
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub master_id: String,
    pub slaves: SlaveCounts,
    pub healthy_devices: usize,
    pub ring_distribution: HashMap<Ring, usize>,
    pub tasks: TaskCounts,
    pub channel: ChannelStats,
}

/// 任务状态查询视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_to: Option<String>,
}

/// Master编排器：集群的中枢决策者
///
/// 持有Slave/任务两张登记表（内部串行访问），运行互相独立的
/// 消息处理、任务派发、存活监控、任务超时、环重平衡五个循环。
/// Slave只能通过消息与Master交互，从不直接改动Master状态。
pub struct MasterOrchestrator {
    master_id: String,
    config: AppConfig,
    channel: Arc<dyn MessageChannel>,
    state_store: Arc<dyn StateStore>,
    tasks: Arc<TaskRegistry>,
    slaves: Arc<SlaveRegistry>,
    policy: Arc<RingPolicy>,
    dispatch_notify: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    running: RwLock<bool>,
    placement_rng: Mutex<StdRng>,
    rng_seed: Option<u64>,
}

impl MasterOrchestrator {
    pub async fn new(
        config: AppConfig,
        channel: Arc<dyn MessageChannel>,
        state_store: Arc<dyn StateStore>,
    ) -> OrchestratorResult<Arc<Self>> {
        Self::with_seed(config, channel, state_store, None).await
    }

    /// 注入随机种子的构造方式，测试用
    pub async fn with_seed(
        config: AppConfig,
        channel: Arc<dyn MessageChannel>,
        state_store: Arc<dyn StateStore>,
        seed: Option<u64>,
    ) -> OrchestratorResult<Arc<Self>> {
        config.validate()?;
        let master_id = config.master.master_id.clone();
        channel.register_endpoint(&master_id).await?;

        let (shutdown_tx, _) = broadcast::channel(8);
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        info!("Master编排器初始化完成: {}", master_id);
        Ok(Arc::new(Self {
            master_id,
            policy: Arc::new(RingPolicy::new(config.rings.clone())),
            config,
            channel,
            state_store,
            tasks: Arc::new(TaskRegistry::new()),
            slaves: Arc::new(SlaveRegistry::new()),
            dispatch_notify: Arc::new(Notify::new()),
            shutdown_tx,
            running: RwLock::new(false),
            placement_rng: Mutex::new(rng),
            rng_seed: seed,
        }))
    }

    /// 启动全部后台循环
    pub async fn start(self: &Arc<Self>) -> OrchestratorResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(OrchestratorError::Internal(
                    "Master编排器已经在运行".to_string(),
                ));
            }
            *running = true;
        }

        info!("启动Master编排器: {}", self.master_id);

        let dispatcher = TaskDispatcher::new(
            self.master_id.clone(),
            Arc::clone(&self.tasks),
            Arc::clone(&self.slaves),
            Arc::clone(&self.channel),
            Arc::clone(&self.dispatch_notify),
            self.config.master.dispatch_interval_ms,
        );
        let liveness = LivenessMonitor::new(
            Arc::clone(&self.slaves),
            Arc::clone(&self.tasks),
            Arc::clone(&self.dispatch_notify),
            LivenessConfig {
                slave_timeout_seconds: self.config.master.slave_timeout_seconds,
                check_interval_seconds: self.config.master.liveness_check_interval_seconds,
            },
        );
        let timeouts = TaskTimeoutMonitor::new(
            Arc::clone(&self.tasks),
            Arc::clone(&self.slaves),
            Arc::clone(&self.dispatch_notify),
            TaskTimeoutConfig {
                task_timeout_seconds: self.config.master.task_timeout_seconds,
                check_interval_seconds: self.config.master.task_check_interval_seconds,
            },
        );
        let rebalancer = RingRebalancer::new(
            self.master_id.clone(),
            Arc::clone(&self.slaves),
            Arc::clone(&self.policy),
            Arc::clone(&self.channel),
            Arc::clone(&self.state_store),
            self.config.rings.rebalance_interval_seconds,
            self.rng_seed,
        );

        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { liveness.run(shutdown_rx).await });

        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { timeouts.run(shutdown_rx).await });

        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { rebalancer.run(shutdown_rx).await });

        let this = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { this.run_message_loop(shutdown_rx).await });

        Ok(())
    }

    /// 停止编排器：通知所有存活Slave后停掉各循环
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }

        info!("停止Master编排器: {}", self.master_id);

        if let Err(e) = self
            .channel
            .send(Message::shutdown_broadcast(
                &self.master_id,
                "Master正在关闭",
            ))
            .await
        {
            warn!("广播关闭消息失败: {}", e);
        }

        let _ = self.shutdown_tx.send(());
    }

    async fn run_message_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("启动消息处理循环");
        let timeout = Duration::from_millis(self.config.master.receive_timeout_ms);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，退出消息处理循环");
                    break;
                }
                received = self.channel.receive(&self.master_id, timeout) => {
                    match received {
                        Ok(Some(message)) => self.handle_message(message).await,
                        Ok(None) => {}
                        Err(e) => {
                            error!("接收消息出错: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// 处理来自Slave的单条消息
    pub async fn handle_message(&self, message: Message) {
        let sender = message.sender.clone();
        debug!("处理来自 {} 的消息: {:?}", sender, message.payload);

        match message.payload {
            MessagePayload::Registration {
                capabilities,
                device,
            } => {
                self.register_slave(&sender, capabilities, device).await;
            }
            MessagePayload::Heartbeat { device } => {
                if let Err(e) = self.slaves.heartbeat(&sender, device).await {
                    // 注册竞态下的心跳按瞬态情况容忍
                    debug!("忽略未知节点 {} 的心跳: {}", sender, e);
                }
            }
            MessagePayload::DeviceStatusUpdate { device } => {
                if let Err(e) = self.slaves.update_device(&sender, device).await {
                    debug!("忽略未知节点 {} 的设备状态: {}", sender, e);
                }
            }
            MessagePayload::TaskProgress {
                task_id,
                stage,
                percent,
            } => {
                debug!(
                    "任务 {} 进度上报: {} ({}%) 来自 {}",
                    task_id, stage, percent, sender
                );
                if let Err(e) = self.tasks.mark_running(&task_id).await {
                    debug!("忽略过期的进度上报 {}: {}", task_id, e);
                }
            }
            MessagePayload::TaskResult { task_id, result } => {
                self.handle_task_result(&sender, &task_id, result).await;
            }
            MessagePayload::Error { task_id, error } => {
                self.handle_task_error(&sender, task_id, error).await;
            }
            other => {
                warn!("Master收到未预期的消息类型，已忽略: {:?}", other);
            }
        }
    }

    /// 注册新Slave：按设备健康放置到环，回复确认并通知环归属
    async fn register_slave(
        &self,
        slave_id: &str,
        capabilities: Vec<String>,
        device: DeviceStatus,
    ) {
        let ring = {
            let counts = self.slaves.ring_counts().await;
            let mut rng = self.placement_rng.lock().await;
            self.policy.initial_ring(&device, &counts, &mut *rng)
        };

        match self
            .slaves
            .register(slave_id, capabilities, device, ring)
            .await
        {
            Ok(slave) => {
                info!(
                    "节点注册成功: {} (能力: {:?}, 环: {})",
                    slave_id, slave.capabilities, ring
                );
                if let Err(e) = self.state_store.record_slave(&slave).await {
                    warn!("写入节点注册记录失败: {}", e);
                }

                let ack = Message::ack(&self.master_id, slave_id, true, "欢迎加入集群");
                if let Err(e) = self.channel.send(ack).await {
                    warn!("发送注册确认失败: {}", e);
                }
                let assignment = Message::ring_assignment(
                    &self.master_id,
                    slave_id,
                    ring,
                    "注册时按设备健康自动分配",
                );
                if let Err(e) = self.channel.send(assignment).await {
                    warn!("发送环归属通知失败: {}", e);
                }

                // 注册完成即进入可派发状态
                if let Err(e) = self.slaves.mark_idle(slave_id).await {
                    error!("节点 {} 进入空闲状态失败: {}", slave_id, e);
                }
                self.dispatch_notify.notify_one();
            }
            Err(e) => {
                warn!("节点 {} 注册被拒绝: {}", slave_id, e);
                let ack = Message::ack(&self.master_id, slave_id, false, e.to_string());
                if let Err(e) = self.channel.send(ack).await {
                    warn!("发送注册拒绝失败: {}", e);
                }
            }
        }
    }

    async fn handle_task_result(&self, slave_id: &str, task_id: &str, result: serde_json::Value) {
        match self.tasks.mark_completed(task_id, result).await {
            Ok(task) => {
                info!("任务 {} 执行成功 (节点: {})", task_id, slave_id);
                if let Err(e) = self.state_store.record_task(&task).await {
                    warn!("写入任务终态记录失败: {}", e);
                }
            }
            Err(e) => {
                // 节点被判死后任务已重新排队，迟到的结果直接丢弃，
                // 绝不把已重派的任务错标为完成
                warn!("丢弃来自 {} 的过期任务结果 {}: {}", slave_id, task_id, e);
            }
        }

        if let Err(e) = self.slaves.task_finished(slave_id, task_id, true).await {
            debug!("释放节点 {} 失败: {}", slave_id, e);
        }
        self.dispatch_notify.notify_one();
    }

    async fn handle_task_error(&self, slave_id: &str, task_id: Option<String>, error: String) {
        let Some(task_id) = task_id else {
            // 与具体任务无关的节点级错误只记录
            error!("节点 {} 上报错误: {}", slave_id, error);
            return;
        };

        match self.tasks.handle_failure(&task_id, error).await {
            Ok((_, RetryDecision::Requeued { retry_count })) => {
                info!(
                    "任务 {} 执行失败，重新排队（第 {} 次重试）",
                    task_id, retry_count
                );
                self.dispatch_notify.notify_one();
            }
            Ok((task, RetryDecision::Exhausted)) => {
                warn!(
                    "任务 {} 重试次数用尽，进入终态失败: {:?}",
                    task_id, task.error
                );
                if let Err(e) = self.state_store.record_task(&task).await {
                    warn!("写入任务终态记录失败: {}", e);
                }
            }
            Err(e) => {
                warn!("丢弃来自 {} 的过期错误上报 {}: {}", slave_id, task_id, e);
            }
        }

        if let Err(e) = self.slaves.task_finished(slave_id, &task_id, false).await {
            debug!("释放节点 {} 失败: {}", slave_id, e);
        }
    }

    /// 提交任务，返回任务id。提交时不校验能力匹配，
    /// 允许任务先于可执行节点排队。
    pub async fn submit_task(
        &self,
        task_type: impl Into<String>,
        parameters: serde_json::Value,
        priority: i32,
        max_retries: u32,
    ) -> String {
        let task = self
            .tasks
            .submit(task_type.into(), parameters, priority, max_retries)
            .await;
        info!(
            "任务提交: {} (类型: {}, 优先级: {})",
            task.id, task.task_type, task.priority
        );
        self.dispatch_notify.notify_one();
        task.id
    }

    pub async fn get_task_status(&self, task_id: &str) -> OrchestratorResult<TaskStatusView> {
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        Ok(TaskStatusView {
            task_id: task.id,
            status: task.status,
            result: task.result,
            error: task.error,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            assigned_to: task.assigned_to,
        })
    }

    pub async fn list_slaves(&self) -> Vec<SlaveInfo> {
        self.slaves.list().await
    }

    /// 手动指定节点环归属，绕过策略，仅对存活节点有效
    pub async fn assign_slave_to_ring(
        &self,
        slave_id: &str,
        ring: Ring,
        reason: &str,
    ) -> OrchestratorResult<()> {
        apply_ring_change(
            &self.master_id,
            &self.slaves,
            self.channel.as_ref(),
            self.state_store.as_ref(),
            slave_id,
            ring,
            reason,
        )
        .await?;
        Ok(())
    }

    pub async fn get_cluster_status(&self) -> ClusterStatus {
        let slave_list = self.slaves.list().await;
        let healthy_devices = slave_list
            .iter()
            .filter(|s| s.is_alive() && self.policy.is_healthy(&s.device))
            .count();

        ClusterStatus {
            master_id: self.master_id.clone(),
            slaves: self.slaves.counts().await,
            healthy_devices,
            ring_distribution: self.slaves.ring_counts().await,
            tasks: self.tasks.counts().await,
            channel: self.channel.stats(),
        }
    }

    pub fn master_id(&self) -> &str {
        &self.master_id
    }
}
