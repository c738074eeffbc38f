use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ByteStream, DynFlowBackend};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::interaction::{
    spawn_resume, InteractionCoordinator, InteractionKey, InteractionKind, InteractionRequest,
    ResumeOutcome, ResumeTarget,
};
use crate::state::{FlowState, StepState, StepTransition, TaskSession, Transition};
use crate::stream::{DecodedItem, EventDecoder, EventPayload, EventSource, Sentinel, StreamEvent};

use super::progress::StepProgress;
use super::update::{SessionSummary, StepUpdate, TaskOutcome, TerminalCause, UiUpdate};

/// 恢复请求需要的对话参数
#[derive(Clone, Debug, Default)]
pub(crate) struct ChatContext {
    pub conversation_id: String,
    pub language: String,
    pub llm_id: String,
}

/// 单个会话的读取与分发循环，`TaskSession` 的唯一写者
pub(crate) struct SessionLoop {
    session: TaskSession,
    context: ChatContext,
    sources: VecDeque<EventSource>,
    backend: DynFlowBackend,
    coordinator: Arc<InteractionCoordinator>,
    updates: mpsc::Sender<UiUpdate>,
    delivery_closed: bool,
    outcomes_tx: mpsc::UnboundedSender<ResumeOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<ResumeOutcome>,
    status: Arc<watch::Sender<FlowState>>,
    progress: StepProgress,
    config: RuntimeConfig,
    cancel: CancellationToken,
    teardown: CancellationToken,
    cancel_sent: bool,
    sentinel_deadline: Option<Instant>,
    last_activity: Instant,
    decode_errors: usize,
    anomalies: usize,
    outcome: Option<TaskOutcome>,
}

impl SessionLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        bytes: ByteStream,
        context: ChatContext,
        backend: DynFlowBackend,
        coordinator: Arc<InteractionCoordinator>,
        updates: mpsc::Sender<UiUpdate>,
        status: Arc<watch::Sender<FlowState>>,
        cancel: CancellationToken,
        config: RuntimeConfig,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let session = TaskSession::with_cancellation(context.conversation_id.clone(), cancel.clone());
        let mut sources = VecDeque::new();
        sources.push_back(EventSource::new(
            bytes,
            EventDecoder::with_failure_threshold(config.max_decode_failures),
        ));

        Self {
            session,
            context,
            sources,
            backend,
            coordinator,
            updates,
            delivery_closed: false,
            outcomes_tx,
            outcomes_rx,
            status,
            progress: StepProgress::new(),
            teardown: cancel.child_token(),
            cancel,
            config,
            cancel_sent: false,
            sentinel_deadline: None,
            last_activity: Instant::now(),
            decode_errors: 0,
            anomalies: 0,
            outcome: None,
        }
    }

    pub(crate) async fn run(mut self) -> SessionSummary {
        info!(conversation_id = %self.session.conversation_id(), "session started");

        let outcome = loop {
            if let Some(outcome) = self.outcome.take() {
                break outcome;
            }

            let sentinel_deadline = self.sentinel_deadline;
            let liveness_deadline = self.liveness_deadline();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => self.on_user_cancel().await,
                Some(outcome) = self.outcomes_rx.recv() => self.on_resumed(outcome).await,
                item = next_from(&mut self.sources) => self.on_item(item).await,
                _ = wait_until(sentinel_deadline) => {
                    let message = format!(
                        "terminal sentinel missing {}ms after the task ended",
                        self.config.sentinel_grace.as_millis()
                    );
                    self.fail_transport(message).await;
                }
                _ = wait_until(liveness_deadline) => {
                    let message = format!(
                        "no data received for {}s",
                        self.config
                            .liveness_timeout
                            .map(|timeout| timeout.as_secs())
                            .unwrap_or_default()
                    );
                    self.fail_transport(message).await;
                }
            }
        };

        let (text, documents) = self.session.take_output();
        SessionSummary {
            outcome,
            conversation_id: self.session.conversation_id().to_string(),
            text,
            documents,
            usage: self.session.usage().clone(),
            footnotes: self.session.footnotes().to_vec(),
            decode_errors: self.decode_errors,
            anomalies: self.anomalies,
        }
    }

    /// 等待用户或恢复调用进行中时不计算存活超时
    fn liveness_deadline(&self) -> Option<Instant> {
        let timeout = self.config.liveness_timeout?;
        if self.sources.is_empty()
            || self.sentinel_deadline.is_some()
            || self.coordinator.has_outstanding()
        {
            return None;
        }
        Some(self.last_activity + timeout)
    }

    async fn on_item(&mut self, item: Option<Result<DecodedItem>>) {
        match item {
            None => {
                self.sources.pop_front();
                self.fail_transport("stream ended without a terminal sentinel")
                    .await;
            }
            Some(Err(error)) => {
                self.sources.pop_front();
                self.fail_transport(error.to_string()).await;
            }
            Some(Ok(item)) => {
                self.last_activity = Instant::now();
                match item {
                    DecodedItem::Event(event) => self.dispatch(event).await,
                    DecodedItem::Malformed(_) => self.decode_errors += 1,
                    DecodedItem::Sentinel(sentinel) => self.on_sentinel(sentinel).await,
                }
            }
        }
    }

    async fn on_sentinel(&mut self, sentinel: Sentinel) {
        match sentinel {
            Sentinel::Failed => self.finish(FlowState::Failed, TerminalCause::ServerFailed).await,
            Sentinel::Sensitive => self.finish(FlowState::Failed, TerminalCause::Sensitive).await,
            Sentinel::Done if self.sentinel_deadline.is_some() => {
                let state = self.session.flow_state();
                let cause = if state == FlowState::Succeeded {
                    TerminalCause::Completed
                } else {
                    TerminalCause::ServerFailed
                };
                self.finish(state, cause).await;
            }
            Sentinel::Done if self.coordinator.has_outstanding() => {
                // 服务端暂停时先关闭当前流，后续事件由恢复调用的新流推送
                debug!(task_id = %self.session.task_id(), "stream paused for user input");
                self.sources.pop_front();
            }
            Sentinel::Done => match self.session.flow_state() {
                FlowState::Init | FlowState::Running => {
                    self.finish(FlowState::Succeeded, TerminalCause::Completed)
                        .await
                }
                state => {
                    if self.sources.len() > 1 {
                        self.sources.pop_front();
                    } else {
                        self.fail_transport(format!("stream closed while the task was {state}"))
                            .await;
                    }
                }
            },
        }
    }

    async fn dispatch(&mut self, event: StreamEvent) {
        if event.payload.is_heartbeat() {
            return;
        }
        debug!(
            task_id = event.task_id(),
            step_id = event.step_id(),
            event = event.name(),
            "dispatching event"
        );

        let delta = self.session.apply(&event);
        if delta.anomaly.is_some() {
            self.anomalies += 1;
            return;
        }
        let task_id = self.session.task_id().to_string();

        if let Some(step) = &delta.step {
            let progress = self.progress.describe(step, &event.payload);
            self.publish(UiUpdate::Step(StepUpdate {
                task_id: task_id.clone(),
                step_id: step.step_id.clone(),
                step_name: step.step_name.clone(),
                from: step.from,
                to: step.to,
                progress,
            }))
            .await;
            self.track_interaction(step, &event.payload).await;
        } else if let Some(step) = self.repeated_wait(&event) {
            self.track_interaction(&step, &event.payload).await;
        }

        if let Some(text) = delta.text {
            self.publish(UiUpdate::Text {
                task_id: task_id.clone(),
                text,
            })
            .await;
        }
        if let Some(document) = delta.document {
            self.publish(UiUpdate::Document {
                task_id: task_id.clone(),
                document,
            })
            .await;
        }

        if let Transition::Changed { from, to } = delta.flow {
            self.on_flow_changed(task_id, from, to).await;
        }
    }

    async fn on_flow_changed(&mut self, task_id: String, from: FlowState, to: FlowState) {
        if !to.is_terminal() {
            self.status.send_if_modified(|current| {
                if current.is_terminal() {
                    false
                } else {
                    *current = to;
                    true
                }
            });
            self.publish(UiUpdate::Flow { task_id, from, to }).await;
            return;
        }

        // 任务已终结，未决交互随之作废
        self.coordinator.close();
        match to {
            FlowState::Cancelled => {
                self.finish(FlowState::Cancelled, TerminalCause::Cancelled)
                    .await
            }
            _ => {
                debug!(task_id = %task_id, state = %to, "awaiting terminal sentinel");
                self.sentinel_deadline = Some(Instant::now() + self.config.sentinel_grace);
            }
        }
    }

    /// 作答后服务端在同一等待状态再次发出请求，例如提交的参数不合法。
    /// 状态机没有迁移，但这是一个新的交互。
    fn repeated_wait(&self, event: &StreamEvent) -> Option<StepTransition> {
        let step = self.session.current_step()?;
        let repeated = match &event.payload {
            EventPayload::StepWaitingForStart(_) => step.state == StepState::WaitingForStart,
            EventPayload::StepWaitingForParam(_) => step.state == StepState::WaitingForParam,
            _ => false,
        };
        if !repeated || step.step_id != event.step_id() {
            return None;
        }
        let key = InteractionKey::new(self.session.task_id(), step.step_id.clone());
        if !self.coordinator.is_answered(&key) {
            return None;
        }
        Some(StepTransition {
            step_id: step.step_id.clone(),
            step_name: step.step_name.clone(),
            from: Some(step.state),
            to: step.state,
        })
    }

    async fn track_interaction(&mut self, step: &StepTransition, payload: &EventPayload) {
        let kind = match payload {
            EventPayload::StepWaitingForStart(request) if step.to.is_waiting() => {
                InteractionKind::Confirm {
                    risk: request.risk,
                    reason: request.reason.clone(),
                }
            }
            EventPayload::StepWaitingForParam(request) if step.to.is_waiting() => {
                InteractionKind::Parameters {
                    message: request.message.clone(),
                    schema: request.params.clone(),
                }
            }
            _ => {
                // 服务端已越过等待点，例如由其他客户端作答
                if step.from.map(|state| state.is_waiting()).unwrap_or(false) {
                    let key = InteractionKey::new(self.session.task_id(), step.step_id.clone());
                    if self.coordinator.withdraw(&key) {
                        debug!(step_id = %step.step_id, "interaction withdrawn by server");
                    }
                }
                return;
            }
        };

        let request = InteractionRequest {
            task_id: self.session.task_id().to_string(),
            step_id: step.step_id.clone(),
            step_name: step.step_name.clone(),
            kind,
        };
        let Some(decision) = self.coordinator.open(request.clone()) else {
            return;
        };

        let target = ResumeTarget {
            key: request.key(),
            conversation_id: self.session.conversation_id().to_string(),
            app_id: self.session.app_id().to_string(),
            flow_id: self.session.flow_id().to_string(),
            language: self.context.language.clone(),
            llm_id: self.context.llm_id.clone(),
        };
        spawn_resume(
            Arc::clone(&self.backend),
            target,
            decision,
            self.teardown.clone(),
            self.outcomes_tx.clone(),
        );
        info!(
            task_id = %request.task_id,
            step_id = %request.step_id,
            kind = request.kind.label(),
            "waiting for user decision"
        );
        self.publish(UiUpdate::Interaction(request)).await;
    }

    async fn on_resumed(&mut self, outcome: ResumeOutcome) {
        self.coordinator.complete(&outcome.key);
        if self.outcome.is_some() {
            return;
        }

        match outcome.result {
            Ok(Some(bytes)) => {
                debug!(step_id = %outcome.key.step_id, "resume opened a new stream");
                self.sources.push_back(EventSource::new(
                    bytes,
                    EventDecoder::with_failure_threshold(self.config.max_decode_failures),
                ));
                self.last_activity = Instant::now();
            }
            Ok(None) => {
                debug!(step_id = %outcome.key.step_id, "resume accepted");
            }
            Err(error) => {
                warn!(step_id = %outcome.key.step_id, %error, "resume call failed");
                if self.sources.is_empty() && !self.coordinator.has_outstanding() {
                    self.fail_transport(format!("resume call failed: {error}"))
                        .await;
                    return;
                }
                let task_id = self.session.task_id().to_string();
                self.publish(UiUpdate::Notice {
                    task_id,
                    message: format!("提交决策失败: {error}"),
                })
                .await;
            }
        }

        if self.sources.is_empty()
            && !self.coordinator.has_outstanding()
            && self.sentinel_deadline.is_none()
        {
            if outcome.declined {
                self.finish(FlowState::Cancelled, TerminalCause::Cancelled)
                    .await;
            } else {
                self.fail_transport("no stream left to continue the task")
                    .await;
            }
        }
    }

    async fn on_user_cancel(&mut self) {
        info!(task_id = %self.session.task_id(), "session cancelled by user");
        self.notify_server_cancel();
        self.finish(FlowState::Cancelled, TerminalCause::UserCancelled)
            .await;
    }

    async fn fail_transport(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(task_id = %self.session.task_id(), %message, "transport failure");
        self.finish(FlowState::Failed, TerminalCause::Transport(message))
            .await;
    }

    /// 尽力通知服务端停止任务，不等待结果
    fn notify_server_cancel(&mut self) {
        if self.cancel_sent {
            return;
        }
        self.cancel_sent = true;

        let backend = Arc::clone(&self.backend);
        let task_id = self.session.task_id().to_string();
        let timeout = self.config.cancel_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, backend.cancel(&task_id)).await {
                Ok(Ok(())) => debug!(task_id = %task_id, "server acknowledged cancel"),
                Ok(Err(error)) => warn!(task_id = %task_id, %error, "cancel request failed"),
                Err(_) => warn!(task_id = %task_id, "cancel request timed out"),
            }
        });
    }

    async fn publish(&mut self, update: UiUpdate) {
        if self.delivery_closed {
            return;
        }
        tokio::select! {
            biased;
            // 用户取消时不再阻塞在已满的队列上
            _ = self.cancel.cancelled() => {}
            result = self.updates.send(update) => {
                if result.is_err() {
                    debug!("update receiver dropped");
                    self.delivery_closed = true;
                }
            }
        }
    }

    /// 发布唯一的终态。用户取消先一步占用终态时以取消为准。
    async fn finish(&mut self, state: FlowState, cause: TerminalCause) {
        if self.outcome.is_some() {
            return;
        }

        let claimed = self.status.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
        let (state, cause) = if claimed {
            (state, cause)
        } else {
            self.notify_server_cancel();
            (*self.status.borrow(), TerminalCause::UserCancelled)
        };

        self.session.force_state(state);
        self.coordinator.close();
        self.sources.clear();
        self.sentinel_deadline = None;
        self.teardown.cancel();

        let outcome = TaskOutcome {
            task_id: self.session.task_id().to_string(),
            state,
            cause,
        };
        info!(
            task_id = %outcome.task_id,
            state = %outcome.state,
            cause = ?outcome.cause,
            "session finished"
        );
        self.deliver_finished(outcome.clone()).await;
        self.outcome = Some(outcome);
    }

    /// 终态更新优先排队；用户已取消且队列已满时放弃投递，不阻塞退出。
    /// 此时 UI 通过 `SessionHandle::flow_state` 已能看到 `Cancelled`。
    async fn deliver_finished(&mut self, outcome: TaskOutcome) {
        if self.delivery_closed {
            return;
        }
        let update = UiUpdate::Finished(outcome);
        tokio::select! {
            biased;
            result = self.updates.send(update.clone()) => {
                if result.is_err() {
                    debug!("update receiver dropped before terminal update");
                }
            }
            _ = self.cancel.cancelled() => {
                if let Err(error) = self.updates.try_send(update) {
                    warn!(%error, "terminal update not delivered after cancel");
                }
            }
        }
    }
}

async fn next_from(sources: &mut VecDeque<EventSource>) -> Option<Result<DecodedItem>> {
    match sources.front_mut() {
        Some(source) => source.next_item().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
