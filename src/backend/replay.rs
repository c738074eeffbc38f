use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{AgentShellError, Result};

use super::request::{ChatRequest, ResumeRequest};
use super::{ByteStream, FlowBackend};

const SENTINELS: [&str; 3] = ["[DONE]", "[ERROR]", "[SENSITIVE]"];

/// 一次调用的脚本化应答
pub enum ReplayScript {
    /// 预先准备好的字节块，按顺序推送后结束
    Chunks(Vec<Bytes>),
    /// 由 `StreamFeeder` 在测试中逐块推送
    Live(mpsc::UnboundedReceiver<Result<Bytes>>),
    /// 恢复调用成功但服务端不开新流
    NoStream,
    /// 调用本身失败
    Fail(String),
}

impl ReplayScript {
    /// 每个元素作为一行 `data:` 输出
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Chunks(
            lines
                .into_iter()
                .map(|line| Bytes::from(format!("data: {}\n\n", line.as_ref())))
                .collect(),
        )
    }

    /// 原样输出的 SSE 文本
    pub fn raw(text: impl Into<String>) -> Self {
        Self::Chunks(vec![Bytes::from(text.into())])
    }

    fn into_stream(self) -> Result<Option<ByteStream>> {
        match self {
            ReplayScript::Chunks(chunks) => Ok(Some(Box::pin(futures::stream::iter(
                chunks.into_iter().map(Ok),
            )))),
            ReplayScript::Live(receiver) => Ok(Some(Box::pin(futures::stream::unfold(
                receiver,
                |mut receiver| async move { receiver.recv().await.map(|item| (item, receiver)) },
            )))),
            ReplayScript::NoStream => Ok(None),
            ReplayScript::Fail(message) => Err(AgentShellError::transport(message)),
        }
    }
}

/// 测试与回放用的推送端，drop 后对应的字节流结束
#[derive(Clone)]
pub struct StreamFeeder {
    sender: mpsc::UnboundedSender<Result<Bytes>>,
}

impl StreamFeeder {
    pub fn channel() -> (Self, ReplayScript) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, ReplayScript::Live(receiver))
    }

    /// 推送一行 `data:` 数据，接收端已关闭时返回 false
    pub fn send_line(&self, data: &str) -> bool {
        self.send_raw(format!("data: {data}\n\n"))
    }

    pub fn send_event(&self, event: Value) -> bool {
        self.send_line(&event.to_string())
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.sender.send(Ok(Bytes::from(text.into()))).is_ok()
    }

    pub fn done(&self) -> bool {
        self.send_line("[DONE]")
    }

    pub fn fail(&self, message: &str) -> bool {
        self.sender
            .send(Err(AgentShellError::transport(message)))
            .is_ok()
    }
}

#[derive(Default)]
struct ReplayState {
    chats: VecDeque<ReplayScript>,
    resumes: VecDeque<ReplayScript>,
    chat_requests: Vec<ChatRequest>,
    resume_requests: Vec<ResumeRequest>,
    cancelled: Vec<String>,
}

/// 内置的本地后端：按脚本回放 SSE 流并记录所有调用
#[derive(Default)]
pub struct ReplayBackend {
    state: Mutex<ReplayState>,
    resume_delay: Option<Duration>,
    cancel_delay: Option<Duration>,
}

impl ReplayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 恢复调用在应答前等待的时长
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = Some(delay);
        self
    }

    /// 取消调用在返回前等待的时长
    pub fn with_cancel_delay(mut self, delay: Duration) -> Self {
        self.cancel_delay = Some(delay);
        self
    }

    pub fn push_chat(&self, script: ReplayScript) {
        self.state.lock().chats.push_back(script);
    }

    pub fn push_resume(&self, script: ReplayScript) {
        self.state.lock().resumes.push_back(script);
    }

    /// 从录制的 SSE 文本构建。
    ///
    /// 文本按结束标记切段：第一段作为对话流，之后每段依次作为恢复调用的应答流。
    pub fn from_transcript(transcript: &str) -> Self {
        let backend = Self::new();
        let mut segment = String::new();
        let mut first = true;

        for line in transcript.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            segment.push_str(line);
            segment.push_str("\n\n");

            let data = line
                .trim()
                .strip_prefix("data:")
                .map(str::trim)
                .unwrap_or_default();
            if SENTINELS.contains(&data) {
                backend.push_segment(std::mem::take(&mut segment), first);
                first = false;
            }
        }
        if !segment.is_empty() {
            backend.push_segment(segment, first);
        }
        backend
    }

    pub async fn from_transcript_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let transcript = tokio::fs::read_to_string(path).await.map_err(|error| {
            AgentShellError::Config(format!("无法读取回放文件 {}: {error}", path.display()))
        })?;
        Ok(Self::from_transcript(&transcript))
    }

    fn push_segment(&self, segment: String, first: bool) {
        let script = ReplayScript::raw(segment);
        if first {
            self.push_chat(script);
        } else {
            self.push_resume(script);
        }
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.state.lock().chat_requests.clone()
    }

    pub fn resume_requests(&self) -> Vec<ResumeRequest> {
        self.state.lock().resume_requests.clone()
    }

    pub fn cancelled_tasks(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    pub fn remaining_resumes(&self) -> usize {
        self.state.lock().resumes.len()
    }
}

#[async_trait]
impl FlowBackend for ReplayBackend {
    async fn start_chat(&self, request: ChatRequest) -> Result<ByteStream> {
        let script = {
            let mut state = self.state.lock();
            state.chat_requests.push(request);
            state.chats.pop_front()
        };
        match script {
            Some(script) => script
                .into_stream()?
                .ok_or_else(|| AgentShellError::transport("chat call returned no stream")),
            None => Err(AgentShellError::transport("no scripted chat stream left")),
        }
    }

    async fn resume(&self, request: ResumeRequest) -> Result<Option<ByteStream>> {
        if let Some(delay) = self.resume_delay {
            tokio::time::sleep(delay).await;
        }
        let script = {
            let mut state = self.state.lock();
            state.resume_requests.push(request);
            state.resumes.pop_front()
        };
        match script {
            Some(script) => script.into_stream(),
            None => Ok(None),
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        self.state.lock().cancelled.push(task_id.to_string());
        if let Some(delay) = self.cancel_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(stream: ByteStream) -> String {
        let chunks: Vec<_> = stream.collect().await;
        chunks
            .into_iter()
            .map(|chunk| String::from_utf8_lossy(&chunk.unwrap()).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn transcript_is_split_on_sentinels() -> anyhow::Result<()> {
        let backend = ReplayBackend::from_transcript(
            "data: {\"event\":\"flow.start\",\"taskId\":\"t\"}\n\
             data: [DONE]\n\
             \n\
             data: {\"event\":\"step.input\",\"taskId\":\"t\"}\n\
             data: [DONE]\n",
        );
        assert_eq!(backend.remaining_resumes(), 1);

        let chat = backend.start_chat(ChatRequest::new("q")).await?;
        let text = collect(chat).await;
        assert!(text.contains("flow.start"));
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert_eq!(backend.chat_requests()[0].question, "q");
        Ok(())
    }

    #[tokio::test]
    async fn resume_without_script_returns_no_stream() -> anyhow::Result<()> {
        let backend = ReplayBackend::new();
        let request = ResumeRequest {
            task_id: "t".into(),
            step_id: "s".into(),
            conversation_id: String::new(),
            app_id: String::new(),
            flow_id: String::new(),
            language: "zh".into(),
            llm_id: String::new(),
            response: crate::backend::ResumeResponse::Confirm(true),
        };
        assert!(backend.resume(request).await?.is_none());
        assert_eq!(backend.resume_requests().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn feeder_drives_live_stream() -> anyhow::Result<()> {
        let backend = ReplayBackend::new();
        let (feeder, script) = StreamFeeder::channel();
        backend.push_chat(script);
        let stream = backend.start_chat(ChatRequest::new("q")).await?;
        feeder.send_line("{\"event\":\"heartbeat\"}");
        feeder.done();
        drop(feeder);
        assert_eq!(
            collect(stream).await,
            "data: {\"event\":\"heartbeat\"}\n\ndata: [DONE]\n\n"
        );
        Ok(())
    }
}
