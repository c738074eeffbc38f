// 远端服务的调用抽象

#[cfg(feature = "http-client")]
pub mod http;
pub mod replay;
pub mod request;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
pub use crate::stream::ByteStream;

#[cfg(feature = "http-client")]
pub use http::HermesHttpBackend;
pub use replay::{ReplayBackend, ReplayScript, StreamFeeder};
pub use request::{AppRequest, ChatRequest, ResumeRequest, ResumeResponse};

/// 流程服务端：发起对话、恢复等待中的步骤、取消任务
#[async_trait]
pub trait FlowBackend: Send + Sync {
    /// 发起对话，返回 SSE 字节流
    async fn start_chat(&self, request: ChatRequest) -> Result<ByteStream>;

    /// 提交用户决策。服务端可能在新的流上继续推送事件。
    async fn resume(&self, request: ResumeRequest) -> Result<Option<ByteStream>>;

    /// 尽力通知服务端停止任务
    async fn cancel(&self, task_id: &str) -> Result<()>;
}

pub type DynFlowBackend = Arc<dyn FlowBackend>;
