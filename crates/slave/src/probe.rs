use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;

use orchestrator_domain::entities::DeviceStatus;

/// Source of the local device health snapshot.
///
/// The agent re-probes on every device-status tick; implementations decide
/// whether that means reading real OS counters or simulating a device.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn sample(&self) -> DeviceStatus;
}

/// Probe returning a fixed snapshot. Used in tests and for devices whose
/// telemetry is supplied externally.
pub struct StaticDeviceProbe {
    status: DeviceStatus,
}

impl StaticDeviceProbe {
    pub fn new(status: DeviceStatus) -> Self {
        Self { status }
    }
}

#[async_trait]
impl DeviceProbe for StaticDeviceProbe {
    async fn sample(&self) -> DeviceStatus {
        let mut status = self.status.clone();
        status.collected_at = Utc::now();
        status
    }
}

/// Probe simulating a real device: metrics start at plausible values and
/// drift a little on every sample, battery draining unless charging.
pub struct SimulatedDeviceProbe {
    state: Mutex<DeviceStatus>,
}

impl SimulatedDeviceProbe {
    pub fn new(device_name: impl Into<String>, os_version: impl Into<String>) -> Self {
        let mut rng = rand::rng();
        let status = DeviceStatus {
            battery_level: rng.random_range(40.0..95.0),
            battery_charging: rng.random_bool(0.5),
            cpu_usage: rng.random_range(5.0..25.0),
            memory_usage: rng.random_range(20.0..50.0),
            disk_usage: rng.random_range(30.0..70.0),
            device_name: device_name.into(),
            os_version: os_version.into(),
            collected_at: Utc::now(),
        };
        Self {
            state: Mutex::new(status),
        }
    }
}

#[async_trait]
impl DeviceProbe for SimulatedDeviceProbe {
    async fn sample(&self) -> DeviceStatus {
        let mut state = self.state.lock().await;
        let mut rng = rand::rng();

        if state.battery_charging {
            state.battery_level = (state.battery_level + rng.random_range(0.5..2.0)).min(100.0);
        } else {
            state.battery_level = (state.battery_level - rng.random_range(0.1..1.5)).max(1.0);
        }
        state.cpu_usage = (state.cpu_usage + rng.random_range(-8.0..8.0)).clamp(1.0, 99.0);
        state.memory_usage = (state.memory_usage + rng.random_range(-4.0..4.0)).clamp(5.0, 95.0);
        state.disk_usage = (state.disk_usage + rng.random_range(0.0..0.2)).min(99.0);
        state.collected_at = Utc::now();

        state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_probe_refreshes_timestamp_only() {
        let mut status = DeviceStatus::new("fixed");
        status.battery_level = 55.0;
        let probe = StaticDeviceProbe::new(status);

        let a = probe.sample().await;
        let b = probe.sample().await;
        assert_eq!(a.battery_level, 55.0);
        assert_eq!(b.battery_level, 55.0);
    }

    #[tokio::test]
    async fn test_simulated_probe_stays_in_bounds() {
        let probe = SimulatedDeviceProbe::new("sim-1", "Android 14");
        for _ in 0..100 {
            let s = probe.sample().await;
            assert!((1.0..=100.0).contains(&s.battery_level));
            assert!((1.0..=99.0).contains(&s.cpu_usage));
            assert!((5.0..=95.0).contains(&s.memory_usage));
        }
    }
}
