use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info};

use orchestrator_domain::entities::Message;
use orchestrator_domain::ports::MessageChannel;

/// Emits heartbeats on a fixed interval, independent of task execution,
/// so a long-running handler never starves the master's liveness signal.
pub struct HeartbeatEmitter {
    slave_id: String,
    master_id: String,
    channel: Arc<dyn MessageChannel>,
    interval_seconds: u64,
}

impl HeartbeatEmitter {
    pub fn new(
        slave_id: String,
        master_id: String,
        channel: Arc<dyn MessageChannel>,
        interval_seconds: u64,
    ) -> Self {
        Self {
            slave_id,
            master_id,
            channel,
            interval_seconds,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = interval(Duration::from_secs(self.interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let msg = Message::heartbeat(&self.slave_id, &self.master_id, None);
                    if let Err(e) = self.channel.send(msg).await {
                        error!("Failed to send heartbeat: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat loop for {} shutting down", self.slave_id);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::entities::MessagePayload;
    use orchestrator_infrastructure::InMemoryChannel;

    #[tokio::test]
    async fn test_heartbeats_are_emitted_until_shutdown() {
        let channel = Arc::new(InMemoryChannel::new());
        channel.register_endpoint("master-001").await.unwrap();

        let emitter = HeartbeatEmitter::new(
            "slave-1".into(),
            "master-001".into(),
            channel.clone() as Arc<dyn MessageChannel>,
            1,
        );

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { emitter.run(rx).await });

        // first tick fires immediately
        let msg = channel
            .receive("master-001", Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg.payload, MessagePayload::Heartbeat { .. }));
        assert_eq!(msg.sender, "slave-1");

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
