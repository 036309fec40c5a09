use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info};

use orchestrator_domain::entities::Message;
use orchestrator_domain::ports::MessageChannel;

use crate::probe::DeviceProbe;

/// Re-probes the local device health on a fixed interval and ships the
/// snapshot to the master. This feed is the sole input to ring placement.
pub struct DeviceStatusEmitter {
    slave_id: String,
    master_id: String,
    channel: Arc<dyn MessageChannel>,
    probe: Arc<dyn DeviceProbe>,
    interval_seconds: u64,
}

impl DeviceStatusEmitter {
    pub fn new(
        slave_id: String,
        master_id: String,
        channel: Arc<dyn MessageChannel>,
        probe: Arc<dyn DeviceProbe>,
        interval_seconds: u64,
    ) -> Self {
        Self {
            slave_id,
            master_id,
            channel,
            probe,
            interval_seconds,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = interval(Duration::from_secs(self.interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let device = self.probe.sample().await;
                    debug!(
                        "Device sample for {}: battery={:.0}% cpu={:.1}% mem={:.1}%",
                        self.slave_id, device.battery_level, device.cpu_usage, device.memory_usage
                    );
                    let msg = Message::device_status_update(&self.slave_id, &self.master_id, device);
                    if let Err(e) = self.channel.send(msg).await {
                        error!("Failed to send device status: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Device status loop for {} shutting down", self.slave_id);
                    break;
                }
            }
        }
    }
}
