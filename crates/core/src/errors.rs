use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("Slave节点未找到: {id}")]
    SlaveNotFound { id: String },
    #[error("Slave节点已注册: {id}")]
    SlaveAlreadyRegistered { id: String },
    #[error("非法的任务状态转换: 任务 {task_id} 不能从 {from} 转换为 {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error("通信端点未注册: {id}")]
    EndpointNotFound { id: String },
    #[error("消息通道已关闭: {0}")]
    ChannelClosed(String),
    #[error("未注册的任务类型处理器: {task_type}")]
    HandlerNotFound { task_type: String },
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("注册失败: 尝试 {attempts} 次后未收到Master确认")]
    RegistrationFailed { attempts: u32 },
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn slave_not_found<S: Into<String>>(id: S) -> Self {
        Self::SlaveNotFound { id: id.into() }
    }
    pub fn invalid_transition<S: Into<String>>(task_id: S, from: S, to: S) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }
    pub fn handler_not_found<S: Into<String>>(task_type: S) -> Self {
        Self::HandlerNotFound {
            task_type: task_type.into(),
        }
    }
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    /// 瞬态错误，调用方可以选择重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TaskExecution(_) | OrchestratorError::ChannelClosed(_)
        )
    }
    /// 致命错误，表明编程契约被破坏或启动失败
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InvalidTransition { .. }
                | OrchestratorError::RegistrationFailed { .. }
                | OrchestratorError::Configuration(_)
                | OrchestratorError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
