use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentShellError>;

#[derive(Debug, Error)]
pub enum AgentShellError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("protocol anomaly for task `{task_id}`: {detail}")]
    ProtocolAnomaly { task_id: String, detail: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Interaction(#[from] InteractionError),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentShellError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn anomaly(task_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ProtocolAnomaly {
            task_id: task_id.into(),
            detail: detail.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// 单行 SSE 数据解析失败（非致命，记录后跳过）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {reason}")]
    InvalidJson { reason: String },
    #[error("event `{event}` has malformed content: {reason}")]
    InvalidContent { event: String, reason: String },
    #[error("event payload is missing the `event` tag")]
    MissingTag,
    #[error("event `{0}` is missing a taskId")]
    MissingTaskId(String),
}

/// 交互决策被拒绝的原因，同步返回给调用方
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InteractionError {
    #[error("interaction for task `{task_id}` step `{step_id}` was already resolved")]
    AlreadyResolved { task_id: String, step_id: String },
    #[error("no pending interaction for task `{task_id}` step `{step_id}`")]
    Unknown { task_id: String, step_id: String },
    #[error("decision does not match the pending `{expected}` interaction")]
    KindMismatch { expected: &'static str },
}
