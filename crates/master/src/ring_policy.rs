use std::collections::HashMap;

use rand::seq::IndexedRandom;
use rand::Rng;

use orchestrator_core::RingConfig;
use orchestrator_domain::entities::{DeviceStatus, Ring};

/// 环变更决定及审计理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingDecision {
    pub ring: Ring,
    pub reason: String,
}

/// 环分配策略：纯决策函数，初始放置与周期重平衡共用
///
/// 健康判定、降级目标、随机重平衡概率全部来自配置，
/// 随机源由调用方注入，测试可用种子RNG加0.0/1.0概率得到确定性行为。
pub struct RingPolicy {
    config: RingConfig,
}

/// 不健康节点的可选去向
const SAFE_RINGS: [Ring; 2] = [Ring::Canary, Ring::Dev];

impl RingPolicy {
    pub fn new(config: RingConfig) -> Self {
        Self { config }
    }

    /// 健康判定：电量、CPU、内存全部达标才算健康
    pub fn is_healthy(&self, device: &DeviceStatus) -> bool {
        device.battery_level > self.config.battery_min
            && device.cpu_usage < self.config.cpu_max
            && device.memory_usage < self.config.memory_max
    }

    /// 新注册节点的初始放置
    ///
    /// 健康节点放入当前成员最少的环以保持均匀分布；
    /// 不健康节点只允许进入CANARY或DEV。
    pub fn initial_ring<R: Rng + ?Sized>(
        &self,
        device: &DeviceStatus,
        ring_counts: &HashMap<Ring, usize>,
        rng: &mut R,
    ) -> Ring {
        if self.is_healthy(device) {
            Ring::ALL
                .iter()
                .copied()
                .min_by_key(|r| ring_counts.get(r).copied().unwrap_or(0))
                .unwrap_or(Ring::Canary)
        } else {
            *SAFE_RINGS.choose(rng).unwrap_or(&Ring::Canary)
        }
    }

    /// 不健康的PROD节点降级去向
    pub fn demotion_target<R: Rng + ?Sized>(&self, rng: &mut R) -> Ring {
        *SAFE_RINGS.choose(rng).unwrap_or(&Ring::Canary)
    }

    /// 周期重平衡决策
    ///
    /// 不健康且在PROD的节点必须降级；其余节点以配置概率随机换环
    /// 用于负载分摊，不健康节点的随机去向不包含PROD。
    /// 返回None表示保持现状。
    pub fn rebalance<R: Rng + ?Sized>(
        &self,
        current: Ring,
        device: &DeviceStatus,
        rng: &mut R,
    ) -> Option<RingDecision> {
        let healthy = self.is_healthy(device);

        if !healthy && current == Ring::Prod {
            let target = self.demotion_target(rng);
            return Some(RingDecision {
                ring: target,
                reason: format!(
                    "设备不健康，移出PROD (电量: {:.0}%, CPU: {:.1}%, 内存: {:.1}%)",
                    device.battery_level, device.cpu_usage, device.memory_usage
                ),
            });
        }

        if rng.random_bool(self.config.rebalance_probability) {
            let mut candidates = vec![Ring::Canary, Ring::Dev, Ring::Stage];
            if healthy {
                candidates.push(Ring::Prod);
            }
            let target = *candidates.choose(rng)?;
            if target != current {
                return Some(RingDecision {
                    ring: target,
                    reason: "随机重平衡，分摊负载".to_string(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn device(battery: f64, cpu: f64, memory: f64) -> DeviceStatus {
        DeviceStatus {
            battery_level: battery,
            cpu_usage: cpu,
            memory_usage: memory,
            ..DeviceStatus::new("test-device")
        }
    }

    fn policy() -> RingPolicy {
        RingPolicy::new(RingConfig::default())
    }

    fn policy_with_probability(p: f64) -> RingPolicy {
        RingPolicy::new(RingConfig {
            rebalance_probability: p,
            ..RingConfig::default()
        })
    }

    #[test]
    fn test_health_predicate_thresholds() {
        let p = policy();
        assert!(p.is_healthy(&device(80.0, 50.0, 60.0)));

        // 阈值边界：电量必须严格大于20，CPU/内存必须严格小于80/85
        assert!(!p.is_healthy(&device(20.0, 50.0, 60.0)));
        assert!(!p.is_healthy(&device(10.0, 50.0, 60.0)));
        assert!(!p.is_healthy(&device(80.0, 80.0, 60.0)));
        assert!(!p.is_healthy(&device(80.0, 85.0, 60.0)));
        assert!(!p.is_healthy(&device(80.0, 50.0, 85.0)));
        assert!(p.is_healthy(&device(20.1, 79.9, 84.9)));
    }

    #[test]
    fn test_healthy_placement_prefers_emptiest_ring() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(1);
        let mut counts: HashMap<Ring, usize> =
            [(Ring::Canary, 3), (Ring::Dev, 2), (Ring::Stage, 0), (Ring::Prod, 1)]
                .into_iter()
                .collect();

        let ring = p.initial_ring(&device(90.0, 10.0, 20.0), &counts, &mut rng);
        assert_eq!(ring, Ring::Stage);

        counts.insert(Ring::Stage, 5);
        let ring = p.initial_ring(&device(90.0, 10.0, 20.0), &counts, &mut rng);
        assert_eq!(ring, Ring::Prod);
    }

    #[test]
    fn test_unhealthy_placement_stays_in_safe_rings() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(7);
        let counts = HashMap::new();

        // 电量10%的设备无论随机结果如何都不能进入STAGE/PROD
        for _ in 0..50 {
            let ring = p.initial_ring(&device(10.0, 50.0, 50.0), &counts, &mut rng);
            assert!(matches!(ring, Ring::Canary | Ring::Dev), "unexpected ring {ring}");
        }
    }

    #[test]
    fn test_unhealthy_prod_is_demoted() {
        let p = policy_with_probability(0.0);
        let mut rng = StdRng::seed_from_u64(3);

        let decision = p
            .rebalance(Ring::Prod, &device(10.0, 50.0, 50.0), &mut rng)
            .expect("unhealthy prod must be demoted");
        assert!(matches!(decision.ring, Ring::Canary | Ring::Dev));
        assert!(decision.reason.contains("PROD"));
    }

    #[test]
    fn test_probability_zero_keeps_healthy_slaves_put() {
        let p = policy_with_probability(0.0);
        let mut rng = StdRng::seed_from_u64(3);

        for ring in Ring::ALL {
            assert_eq!(
                p.rebalance(ring, &device(90.0, 10.0, 20.0), &mut rng),
                None
            );
        }
        // 不健康但不在PROD的节点同样保持不动
        assert_eq!(
            p.rebalance(Ring::Dev, &device(10.0, 50.0, 50.0), &mut rng),
            None
        );
    }

    #[test]
    fn test_probability_one_shuffles_to_different_ring() {
        let p = policy_with_probability(1.0);
        let mut rng = StdRng::seed_from_u64(11);

        let mut moved = 0;
        for _ in 0..50 {
            if let Some(decision) = p.rebalance(Ring::Stage, &device(90.0, 10.0, 20.0), &mut rng) {
                assert_ne!(decision.ring, Ring::Stage);
                moved += 1;
            }
        }
        // 四个候选环中有三个不同于当前环，50次中必然发生迁移
        assert!(moved > 0);
    }

    #[test]
    fn test_unhealthy_shuffle_never_targets_prod() {
        let p = policy_with_probability(1.0);
        let mut rng = StdRng::seed_from_u64(13);

        for _ in 0..50 {
            if let Some(decision) = p.rebalance(Ring::Canary, &device(10.0, 50.0, 50.0), &mut rng) {
                assert_ne!(decision.ring, Ring::Prod);
            }
        }
    }
}
