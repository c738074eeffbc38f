use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{ByteStream, ChatRequest, DynFlowBackend};
use crate::backend::request::DEFAULT_LANGUAGE;
use crate::config::RuntimeConfig;
use crate::error::{AgentShellError, Result};
use crate::interaction::{Decision, InteractionCoordinator, InteractionRequest, Resolution};
use crate::state::FlowState;

use super::dispatch::{ChatContext, SessionLoop};
use super::update::{SessionSummary, UiUpdate};

/// 流式会话运行时
///
/// 每次 `start` 启动一个独立的会话循环任务，返回用于订阅更新、
/// 提交决策与取消的 [`SessionHandle`]。
#[derive(Clone)]
pub struct StreamRuntime {
    backend: DynFlowBackend,
    config: RuntimeConfig,
}

impl StreamRuntime {
    pub fn new(backend: DynFlowBackend) -> Self {
        Self {
            backend,
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backend(&self) -> DynFlowBackend {
        Arc::clone(&self.backend)
    }

    /// 发起对话并启动会话循环
    pub async fn start(&self, request: ChatRequest) -> Result<SessionHandle> {
        let context = ChatContext {
            conversation_id: request.conversation_id.clone(),
            language: request.language.clone(),
            llm_id: request.llm_id.clone(),
        };
        let bytes = self.backend.start_chat(request).await?;
        Ok(self.spawn(bytes, context))
    }

    /// 在已打开的字节流上启动会话循环
    pub fn attach(&self, bytes: ByteStream, conversation_id: impl Into<String>) -> SessionHandle {
        let context = ChatContext {
            conversation_id: conversation_id.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            llm_id: String::new(),
        };
        self.spawn(bytes, context)
    }

    fn spawn(&self, bytes: ByteStream, context: ChatContext) -> SessionHandle {
        let (updates_tx, updates_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (status, _) = watch::channel(FlowState::Init);
        let status = Arc::new(status);
        let coordinator = Arc::new(InteractionCoordinator::new());
        let cancel = CancellationToken::new();

        let session = SessionLoop::new(
            bytes,
            context,
            Arc::clone(&self.backend),
            Arc::clone(&coordinator),
            updates_tx,
            Arc::clone(&status),
            cancel.clone(),
            self.config.clone(),
        );
        let join = tokio::spawn(session.run());

        SessionHandle {
            updates: Some(updates_rx),
            coordinator,
            status,
            cancel,
            join,
        }
    }
}

/// UI 侧持有的会话句柄
pub struct SessionHandle {
    updates: Option<mpsc::Receiver<UiUpdate>>,
    coordinator: Arc<InteractionCoordinator>,
    status: Arc<watch::Sender<FlowState>>,
    cancel: CancellationToken,
    join: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    /// 取走有序的更新队列，只能取一次
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<UiUpdate>> {
        self.updates.take()
    }

    /// 提交用户决策。重复提交或交互不存在时同步返回错误，不影响会话。
    pub fn resolve(&self, task_id: &str, step_id: &str, decision: Decision) -> Result<Resolution> {
        Ok(self.coordinator.resolve(task_id, step_id, decision)?)
    }

    pub fn confirm(&self, task_id: &str, step_id: &str, confirmed: bool) -> Result<Resolution> {
        self.resolve(task_id, step_id, Decision::Confirm(confirmed))
    }

    /// `None` 等同于拒绝
    pub fn supply_parameters(
        &self,
        task_id: &str,
        step_id: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<Resolution> {
        self.resolve(task_id, step_id, Decision::Parameters(params))
    }

    /// 取消会话。状态立即变为 `Cancelled`，网络清理在后台进行。
    /// 会话已终结时返回 false。
    pub fn cancel(&self) -> bool {
        let claimed = self.status.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = FlowState::Cancelled;
                true
            }
        });
        if claimed {
            info!("session cancel requested");
        }
        self.cancel.cancel();
        claimed
    }

    pub fn flow_state(&self) -> FlowState {
        *self.status.borrow()
    }

    /// 订阅任务状态变化
    pub fn watch_state(&self) -> watch::Receiver<FlowState> {
        self.status.subscribe()
    }

    pub fn pending_interactions(&self) -> Vec<InteractionRequest> {
        self.coordinator.pending_requests()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 等待会话循环退出并返回汇总
    pub async fn join(self) -> Result<SessionSummary> {
        self.join
            .await
            .map_err(|error| AgentShellError::Other(anyhow!("session task failed: {error}")))
    }
}
