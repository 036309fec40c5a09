use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use orchestrator_core::{OrchestratorError, OrchestratorResult, SlaveConfig};
use orchestrator_domain::entities::{Message, MessagePayload, Ring};
use orchestrator_domain::ports::MessageChannel;

use crate::components::{DeviceStatusEmitter, HeartbeatEmitter, TaskExecutionManager};
use crate::handlers::TaskHandler;
use crate::probe::DeviceProbe;
use crate::registry::HandlerRegistry;

/// A worker agent: registers with the master, executes assigned tasks and
/// keeps three independent activities running (heartbeat, device telemetry,
/// inbound message processing).
///
/// Startup is fail-fast: if the master does not acknowledge registration
/// within the configured attempts the agent surfaces a fatal error instead
/// of retrying forever. Worker death is the master's business, not ours.
pub struct SlaveAgent {
    id: String,
    master_id: String,
    capabilities: Vec<String>,
    channel: Arc<dyn MessageChannel>,
    probe: Arc<dyn DeviceProbe>,
    handlers: Arc<HandlerRegistry>,
    executor: Arc<TaskExecutionManager>,
    config: SlaveConfig,
    ring: RwLock<Option<Ring>>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    is_running: RwLock<bool>,
}

impl SlaveAgent {
    pub fn new(
        id: impl Into<String>,
        master_id: impl Into<String>,
        capabilities: Vec<String>,
        channel: Arc<dyn MessageChannel>,
        probe: Arc<dyn DeviceProbe>,
        config: SlaveConfig,
    ) -> Arc<Self> {
        let id = id.into();
        let master_id = master_id.into();
        let handlers = Arc::new(HandlerRegistry::new());
        let executor = Arc::new(TaskExecutionManager::new(
            id.clone(),
            master_id.clone(),
            Arc::clone(&channel),
            Arc::clone(&handlers),
        ));
        Arc::new(Self {
            id,
            master_id,
            capabilities,
            channel,
            probe,
            handlers,
            executor,
            config,
            ring: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
            is_running: RwLock::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn current_ring(&self) -> Option<Ring> {
        *self.ring.read().await
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Associate a task type with an executable handler. Expected before start.
    pub async fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.register(task_type, handler).await;
    }

    /// Capability tags advertised at registration: the explicit set passed at
    /// construction plus every task type with a registered handler.
    async fn effective_capabilities(&self) -> Vec<String> {
        let mut set: BTreeSet<String> = self.capabilities.iter().cloned().collect();
        set.extend(self.handlers.supported_types().await);
        set.into_iter().collect()
    }

    /// Register with the master and spawn the agent's activities.
    pub async fn start(self: &Arc<Self>) -> OrchestratorResult<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(OrchestratorError::Internal(format!(
                    "agent {} already running",
                    self.id
                )));
            }
            *running = true;
        }

        self.channel.register_endpoint(&self.id).await?;

        if let Err(e) = self.register_with_master().await {
            *self.is_running.write().await = false;
            return Err(e);
        }

        let (shutdown_tx, _) = broadcast::channel(4);

        let heartbeat = HeartbeatEmitter::new(
            self.id.clone(),
            self.master_id.clone(),
            Arc::clone(&self.channel),
            self.config.heartbeat_interval_seconds,
        );
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { heartbeat.run(rx).await });

        let device_monitor = DeviceStatusEmitter::new(
            self.id.clone(),
            self.master_id.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&self.probe),
            self.config.device_status_interval_seconds,
        );
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { device_monitor.run(rx).await });

        let this = Arc::clone(self);
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { this.run_message_loop(rx).await });

        *self.shutdown_tx.write().await = Some(shutdown_tx);

        info!("Agent {} started", self.id);
        Ok(())
    }

    /// Cooperative local stop: same path as a SHUTDOWN message from the master.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.read().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    async fn register_with_master(&self) -> OrchestratorResult<()> {
        let max_attempts = self.config.max_registration_attempts;
        let ack_timeout = Duration::from_millis(self.config.registration_timeout_ms);
        let mut backoff = Duration::from_millis(self.config.registration_backoff_ms);

        for attempt in 1..=max_attempts {
            let device = self.probe.sample().await;
            let capabilities = self.effective_capabilities().await;
            self.channel
                .send(Message::registration(
                    &self.id,
                    &self.master_id,
                    capabilities,
                    device,
                ))
                .await?;

            match self.channel.receive(&self.id, ack_timeout).await? {
                Some(msg) => match msg.payload {
                    MessagePayload::Ack { accepted: true, .. } => {
                        info!(
                            "Agent {} registered with {} (attempt {})",
                            self.id, self.master_id, attempt
                        );
                        return Ok(());
                    }
                    MessagePayload::Ack {
                        accepted: false,
                        detail,
                    } => {
                        warn!("Registration of {} rejected: {}", self.id, detail);
                        return Err(OrchestratorError::RegistrationFailed { attempts: attempt });
                    }
                    other => {
                        warn!(
                            "Unexpected message while awaiting registration ack: {:?}",
                            other
                        );
                    }
                },
                None => {
                    warn!(
                        "Registration attempt {}/{} for {} timed out",
                        attempt, max_attempts, self.id
                    );
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(OrchestratorError::RegistrationFailed {
            attempts: max_attempts,
        })
    }

    async fn run_message_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let timeout = Duration::from_millis(self.config.receive_timeout_ms);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.finish_shutdown("local stop requested").await;
                    break;
                }
                received = self.channel.receive(&self.id, timeout) => {
                    match received {
                        Ok(Some(message)) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("Agent {} failed to receive: {}", self.id, e);
                            break;
                        }
                    }
                }
            }
        }
        info!("Agent {} message loop exited", self.id);
    }

    /// Returns true when the agent should stop processing messages.
    async fn handle_message(&self, message: Message) -> bool {
        match message.payload {
            MessagePayload::TaskAssignment {
                task_id,
                task_type,
                parameters,
                ..
            } => {
                if !self.executor.try_start(&task_id, &task_type, parameters).await {
                    warn!(
                        "Agent {} is busy, rejecting assignment of task {}",
                        self.id, task_id
                    );
                    let reject = Message::task_error(
                        &self.id,
                        &self.master_id,
                        Some(task_id),
                        "slave is busy, double assignment rejected",
                    );
                    if let Err(e) = self.channel.send(reject).await {
                        error!("Failed to send rejection: {}", e);
                    }
                }
                false
            }
            MessagePayload::RingAssignment { ring, reason } => {
                info!("Agent {} assigned to ring {}: {}", self.id, ring, reason);
                *self.ring.write().await = Some(ring);
                false
            }
            MessagePayload::Shutdown { reason } => {
                self.finish_shutdown(&reason).await;
                true
            }
            MessagePayload::Ack { .. } => {
                debug!("Agent {} ignoring stray ack", self.id);
                false
            }
            other => {
                warn!("Agent {} received unexpected message: {:?}", self.id, other);
                false
            }
        }
    }

    /// Stop all activities. An in-flight task is reported as failed rather
    /// than left unresolved, then the agent exits cleanly.
    async fn finish_shutdown(&self, reason: &str) {
        info!("Agent {} shutting down: {}", self.id, reason);

        if let Some(task_id) = self.executor.abort_current().await {
            warn!(
                "Reporting in-flight task {} as failed due to shutdown",
                task_id
            );
            if let Err(e) = self
                .executor
                .report_interrupted(&task_id, "task interrupted by shutdown")
                .await
            {
                error!("Failed to report interrupted task {}: {}", task_id, e);
            }
        }

        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            let _ = tx.send(());
        }
        *self.is_running.write().await = false;
    }
}
