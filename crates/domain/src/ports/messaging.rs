use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::Message;
use orchestrator_core::OrchestratorResult;

/// 通道投递统计
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub delivered: u64,
    /// 接收方未注册或邮箱已关闭时丢弃的消息数
    pub dropped: u64,
}

/// 消息通道抽象
///
/// 内存实现用于嵌入式部署；替换为持久化broker时Master/Slave逻辑不变。
/// 同一发送方到同一接收方的消息保证FIFO投递，跨接收方无顺序保证。
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// 注册收件邮箱，幂等
    async fn register_endpoint(&self, agent_id: &str) -> OrchestratorResult<()>;

    /// 注销收件邮箱，之后发往该端点的消息按丢弃计数
    async fn unregister_endpoint(&self, agent_id: &str) -> OrchestratorResult<()>;

    /// 异步投递，立即返回。接收方未注册是可容忍的瞬态情况：
    /// 计入丢弃统计，不报错。
    async fn send(&self, message: Message) -> OrchestratorResult<()>;

    /// 阻塞等待下一条消息，超时返回None。
    /// 从未注册的端点接收属于编程契约错误。
    async fn receive(&self, agent_id: &str, timeout: Duration)
        -> OrchestratorResult<Option<Message>>;

    /// 指定端点当前积压的消息数
    async fn queue_depth(&self, agent_id: &str) -> OrchestratorResult<usize>;

    fn stats(&self) -> ChannelStats;
}
