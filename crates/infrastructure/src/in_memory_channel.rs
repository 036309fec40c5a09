use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{Message, Recipient};
use orchestrator_domain::ports::{ChannelStats, MessageChannel};

/// 内存消息通道实现
///
/// 使用 Tokio channels 为每个已注册端点维护一个邮箱，适用于嵌入式部署场景。
/// 同一发送方到同一接收方的投递顺序由 mpsc 保证为FIFO。
/// 发往未注册端点的消息不报错，仅计入丢弃统计（容忍注册竞态）。
#[derive(Debug)]
pub struct InMemoryChannel {
    /// 邮箱存储：端点id -> (发送端, 接收端)
    mailboxes: RwLock<HashMap<String, Mailbox>>,
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug)]
struct Mailbox {
    sender: mpsc::UnboundedSender<Message>,
    /// 使用 Arc 包装接收端，receive调用方在锁外等待
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    /// 邮箱积压统计
    depth: Arc<AtomicUsize>,
}

impl Mailbox {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// 向单个邮箱投递，失败计入丢弃
    fn deliver(&self, mailbox: &Mailbox, message: Message) {
        match mailbox.sender.send(message) {
            Ok(()) => {
                mailbox.depth.fetch_add(1, Ordering::Relaxed);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // 接收端已经关闭，按未送达处理
                warn!("Mailbox closed, dropping message: {}", e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn register_endpoint(&self, agent_id: &str) -> OrchestratorResult<()> {
        let mut mailboxes = self.mailboxes.write().await;
        if mailboxes.contains_key(agent_id) {
            debug!("Endpoint '{}' already registered", agent_id);
            return Ok(());
        }
        mailboxes.insert(agent_id.to_string(), Mailbox::new());
        debug!("Registered endpoint '{}'", agent_id);
        Ok(())
    }

    async fn unregister_endpoint(&self, agent_id: &str) -> OrchestratorResult<()> {
        let mut mailboxes = self.mailboxes.write().await;
        if let Some(mailbox) = mailboxes.remove(agent_id) {
            // 尚未消费的消息随邮箱一起丢弃
            let backlog = mailbox.depth.load(Ordering::Relaxed) as u64;
            if backlog > 0 {
                self.dropped.fetch_add(backlog, Ordering::Relaxed);
            }
            drop(mailbox.sender);
            debug!("Unregistered endpoint '{}' ({} undelivered)", agent_id, backlog);
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> OrchestratorResult<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let mailboxes = self.mailboxes.read().await;

        match &message.recipient {
            Recipient::Agent(agent_id) => match mailboxes.get(agent_id) {
                Some(mailbox) => self.deliver(mailbox, message),
                None => {
                    // 接收方未注册：瞬态竞态，计数后静默返回
                    debug!(
                        "Recipient '{}' not registered, message from '{}' dropped",
                        agent_id, message.sender
                    );
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            Recipient::Broadcast => {
                for (agent_id, mailbox) in mailboxes.iter() {
                    if agent_id == &message.sender {
                        continue;
                    }
                    self.deliver(mailbox, message.clone());
                }
            }
        }
        Ok(())
    }

    async fn receive(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> OrchestratorResult<Option<Message>> {
        let (receiver, depth) = {
            let mailboxes = self.mailboxes.read().await;
            let mailbox = mailboxes
                .get(agent_id)
                .ok_or_else(|| OrchestratorError::EndpointNotFound {
                    id: agent_id.to_string(),
                })?;
            (Arc::clone(&mailbox.receiver), Arc::clone(&mailbox.depth))
        };

        let mut rx = receiver.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => {
                depth.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(message))
            }
            Ok(None) => Err(OrchestratorError::ChannelClosed(agent_id.to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn queue_depth(&self, agent_id: &str) -> OrchestratorResult<usize> {
        let mailboxes = self.mailboxes.read().await;
        let mailbox = mailboxes
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::EndpointNotFound {
                id: agent_id.to_string(),
            })?;
        Ok(mailbox.depth.load(Ordering::Relaxed))
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
