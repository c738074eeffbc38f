use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::config::BackendConfig;
use crate::error::{AgentShellError, Result};

use super::request::{ChatRequest, ResumeRequest};
use super::{ByteStream, FlowBackend};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct ConversationEnvelope {
    result: ConversationResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationResult {
    conversation_id: String,
}

/// 基于 reqwest 的流程服务端客户端
#[derive(Clone)]
pub struct HermesHttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HermesHttpBackend {
    /// 创建 HTTP 客户端
    ///
    /// 只限制建连时间；SSE 流可能持续很久，不设整体超时。
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| AgentShellError::Config(format!("无法创建 HTTP 客户端: {error}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Self::new(config.base_url.clone(), config.auth_token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url(path));
        if self.auth_token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.auth_token)
        }
    }

    async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|error| AgentShellError::transport(format!("请求失败: {error}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(AgentShellError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn open_stream(&self, body: serde_json::Value) -> Result<ByteStream> {
        let builder = self
            .post("/api/chat")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);
        let response = Self::send(builder).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| AgentShellError::transport(error.to_string())));
        Ok(Box::pin(stream))
    }

    /// 创建新会话并返回 conversationId
    #[instrument(skip(self))]
    pub async fn create_conversation(&self, llm_id: &str) -> Result<String> {
        let mut builder = self.post("/api/conversation").json(&json!({}));
        if !llm_id.is_empty() {
            builder = builder.query(&[("llm_id", llm_id)]);
        }
        let response = Self::send(builder).await?;
        let envelope: ConversationEnvelope = response.json().await.map_err(|error| {
            AgentShellError::Http {
                status: 500,
                message: format!("会话接口返回了无法解析的内容: {error}"),
            }
        })?;
        info!(conversation_id = %envelope.result.conversation_id, "conversation created");
        Ok(envelope.result.conversation_id)
    }
}

#[async_trait]
impl FlowBackend for HermesHttpBackend {
    async fn start_chat(&self, mut request: ChatRequest) -> Result<ByteStream> {
        if request.conversation_id.is_empty() {
            request.conversation_id = self.create_conversation(&request.llm_id).await?;
        }
        debug!(conversation_id = %request.conversation_id, "opening chat stream");
        let body = serde_json::to_value(&request)
            .map_err(|error| AgentShellError::Other(error.into()))?;
        self.open_stream(body).await
    }

    async fn resume(&self, request: ResumeRequest) -> Result<Option<ByteStream>> {
        debug!(
            task_id = %request.task_id,
            step_id = %request.step_id,
            decline = request.response.is_decline(),
            "sending resume request"
        );
        self.open_stream(request.to_body()).await.map(Some)
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        let mut builder = self.post("/api/stop").json(&json!({}));
        if !task_id.is_empty() {
            builder = builder.query(&[("taskId", task_id)]);
        }
        match Self::send(builder).await {
            Ok(_) => {
                info!(task_id, "stop request accepted");
                Ok(())
            }
            Err(error) => {
                warn!(task_id, %error, "stop request failed");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let backend = HermesHttpBackend::new("http://localhost:8002/", "token").unwrap();
        assert_eq!(backend.url("/api/chat"), "http://localhost:8002/api/chat");
    }

    #[test]
    fn conversation_response_is_parsed() {
        let envelope: ConversationEnvelope =
            serde_json::from_str(r#"{"code":200,"result":{"conversationId":"c-1"}}"#).unwrap();
        assert_eq!(envelope.result.conversation_id, "c-1");
    }
}
