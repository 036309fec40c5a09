use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;
use tracing::{error, info};

use orchestrator_core::OrchestratorResult;
use orchestrator_domain::entities::{Message, Ring};
use orchestrator_domain::ports::{MessageChannel, RingChange, StateStore};

use crate::ring_policy::RingPolicy;
use crate::slave_registry::SlaveRegistry;

/// 执行一次环变更：更新登记表、通知Slave、写入审计记录
///
/// 重平衡循环和手动指定共用此路径，保证两种入口的副作用一致。
pub async fn apply_ring_change(
    master_id: &str,
    slaves: &SlaveRegistry,
    channel: &dyn MessageChannel,
    state_store: &dyn StateStore,
    slave_id: &str,
    ring: Ring,
    reason: &str,
) -> OrchestratorResult<Ring> {
    let old = slaves.set_ring(slave_id, ring).await?;

    channel
        .send(Message::ring_assignment(master_id, slave_id, ring, reason))
        .await?;

    state_store
        .record_ring_change(RingChange {
            slave_id: slave_id.to_string(),
            from: Some(old),
            to: ring,
            reason: reason.to_string(),
            changed_at: Utc::now(),
        })
        .await?;

    info!("节点 {} 从环 {} 移入环 {}: {}", slave_id, old, ring, reason);
    Ok(old)
}

/// 环重平衡循环
///
/// 周期性地对每个存活节点评估环策略：不健康的PROD节点强制降级，
/// 其余节点按配置概率随机换环以分摊负载。随机项与健康无关，
/// 是刻意引入的噪声而非正确性步骤。
pub struct RingRebalancer {
    master_id: String,
    slaves: Arc<SlaveRegistry>,
    policy: Arc<RingPolicy>,
    channel: Arc<dyn MessageChannel>,
    state_store: Arc<dyn StateStore>,
    interval_seconds: u64,
    rng: Mutex<StdRng>,
}

impl RingRebalancer {
    pub fn new(
        master_id: String,
        slaves: Arc<SlaveRegistry>,
        policy: Arc<RingPolicy>,
        channel: Arc<dyn MessageChannel>,
        state_store: Arc<dyn StateStore>,
        interval_seconds: u64,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            master_id,
            slaves,
            policy,
            channel,
            state_store,
            interval_seconds,
            rng: Mutex::new(rng),
        }
    }

    /// 单轮重平衡，返回发生变更的节点数
    pub async fn rebalance_once(&self) -> OrchestratorResult<usize> {
        let live: Vec<_> = self
            .slaves
            .list()
            .await
            .into_iter()
            .filter(|s| s.is_alive())
            .collect();

        // 先在锁内收集决策，再逐一应用
        let decisions: Vec<_> = {
            let mut rng = self.rng.lock().await;
            live.iter()
                .filter_map(|slave| {
                    self.policy
                        .rebalance(slave.ring, &slave.device, &mut *rng)
                        .map(|decision| (slave.id.clone(), decision))
                })
                .collect()
        };

        let mut changed = 0;
        for (slave_id, decision) in decisions {
            match apply_ring_change(
                &self.master_id,
                &self.slaves,
                self.channel.as_ref(),
                self.state_store.as_ref(),
                &slave_id,
                decision.ring,
                &decision.reason,
            )
            .await
            {
                Ok(_) => changed += 1,
                Err(e) => error!("重平衡节点 {} 失败: {}", slave_id, e),
            }
        }

        if changed > 0 {
            info!("环重平衡完成，{} 个节点发生迁移", changed);
        }
        Ok(changed)
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = interval(Duration::from_secs(self.interval_seconds));
        // interval首次立即触发，跳过以免启动瞬间就重平衡
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.rebalance_once().await {
                        error!("环重平衡出错: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，退出环重平衡循环");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::RingConfig;
    use orchestrator_domain::entities::{DeviceStatus, MessagePayload};
    use orchestrator_infrastructure::{InMemoryChannel, InMemoryStateStore};

    fn unhealthy_device(name: &str) -> DeviceStatus {
        DeviceStatus {
            battery_level: 10.0,
            ..DeviceStatus::new(name)
        }
    }

    struct Fixture {
        rebalancer: RingRebalancer,
        slaves: Arc<SlaveRegistry>,
        channel: Arc<InMemoryChannel>,
        store: Arc<InMemoryStateStore>,
    }

    fn fixture(probability: f64) -> Fixture {
        let slaves = Arc::new(SlaveRegistry::new());
        let channel = Arc::new(InMemoryChannel::new());
        let store = Arc::new(InMemoryStateStore::new());
        let policy = Arc::new(RingPolicy::new(RingConfig {
            rebalance_probability: probability,
            ..RingConfig::default()
        }));
        let rebalancer = RingRebalancer::new(
            "master-001".into(),
            Arc::clone(&slaves),
            policy,
            channel.clone() as Arc<dyn MessageChannel>,
            store.clone() as Arc<dyn StateStore>,
            30,
            Some(42),
        );
        Fixture {
            rebalancer,
            slaves,
            channel,
            store,
        }
    }

    #[tokio::test]
    async fn test_unhealthy_prod_slave_is_demoted() {
        let f = fixture(0.0);
        f.channel.register_endpoint("slave-1").await.unwrap();
        f.slaves
            .register(
                "slave-1",
                vec!["health_check".into()],
                unhealthy_device("slave-1"),
                Ring::Prod,
            )
            .await
            .unwrap();
        f.slaves.mark_idle("slave-1").await.unwrap();

        let changed = f.rebalancer.rebalance_once().await.unwrap();
        assert_eq!(changed, 1);

        let slave = f.slaves.get("slave-1").await.unwrap();
        assert!(matches!(slave.ring, Ring::Canary | Ring::Dev));

        // Slave收到环变更通知
        let msg = f
            .channel
            .receive("slave-1", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg.payload, MessagePayload::RingAssignment { .. }));

        // 审计记录包含降级原因
        let changes = f.store.ring_changes().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].from, Some(Ring::Prod));
        assert!(changes[0].reason.contains("PROD"));
    }

    #[tokio::test]
    async fn test_probability_zero_leaves_healthy_cluster_alone() {
        let f = fixture(0.0);
        for (id, ring) in [("slave-1", Ring::Canary), ("slave-2", Ring::Prod)] {
            f.channel.register_endpoint(id).await.unwrap();
            f.slaves
                .register(id, vec![], DeviceStatus::new(id), ring)
                .await
                .unwrap();
            f.slaves.mark_idle(id).await.unwrap();
        }

        assert_eq!(f.rebalancer.rebalance_once().await.unwrap(), 0);
        assert!(f.store.ring_changes().await.is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_preserves_ring_partition() {
        let f = fixture(1.0);
        for i in 0..6 {
            let id = format!("slave-{i}");
            f.channel.register_endpoint(&id).await.unwrap();
            f.slaves
                .register(&id, vec![], DeviceStatus::new(&id), Ring::Stage)
                .await
                .unwrap();
            f.slaves.mark_idle(&id).await.unwrap();
        }

        f.rebalancer.rebalance_once().await.unwrap();

        // 每个存活节点任意时刻都恰好属于一个环
        let counts = f.slaves.ring_counts().await;
        assert_eq!(counts.values().sum::<usize>(), 6);
    }

    #[tokio::test]
    async fn test_dead_slaves_are_not_rebalanced() {
        let f = fixture(1.0);
        f.channel.register_endpoint("slave-1").await.unwrap();
        f.slaves
            .register("slave-1", vec![], unhealthy_device("slave-1"), Ring::Prod)
            .await
            .unwrap();
        f.slaves.mark_dead("slave-1").await.unwrap();

        assert_eq!(f.rebalancer.rebalance_once().await.unwrap(), 0);
    }
}
