use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::{Document, EventPayload, StreamEvent};

use super::flow::{FlowState, FlowStateMachine, Transition};
use super::step::{StepInstance, StepState, StepStateMachine, StepTransition};

/// 会话累计的 token 统计
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// 最近一次事件报告的耗时（秒）
    pub time_cost: f64,
}

/// 处理单个事件后会话发生的变化
#[derive(Clone, Debug, PartialEq)]
pub struct SessionDelta {
    pub flow: Transition<FlowState>,
    pub step: Option<StepTransition>,
    pub text: Option<String>,
    pub document: Option<Document>,
    /// 事件违反协议时的说明，事件本身已被丢弃
    pub anomaly: Option<String>,
}

impl Default for SessionDelta {
    fn default() -> Self {
        Self {
            flow: Transition::Unchanged,
            step: None,
            text: None,
            document: None,
            anomaly: None,
        }
    }
}

impl SessionDelta {
    fn anomaly(detail: impl Into<String>) -> Self {
        Self {
            anomaly: Some(detail.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.flow.is_changed()
            && self.step.is_none()
            && self.text.is_none()
            && self.document.is_none()
            && self.anomaly.is_none()
    }
}

/// 一轮对话的聚合状态。
///
/// 只由所属会话循环修改；UI 侧通过更新队列与 `SessionHandle` 间接观察。
#[derive(Debug)]
pub struct TaskSession {
    conversation_id: String,
    task_id: String,
    group_id: String,
    app_id: String,
    flow_id: String,
    flow: FlowStateMachine,
    step: StepStateMachine,
    text: String,
    documents: Vec<Document>,
    usage: TokenUsage,
    footnotes: Vec<Value>,
    cancel: CancellationToken,
}

impl TaskSession {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self::with_cancellation(conversation_id, CancellationToken::new())
    }

    pub fn with_cancellation(conversation_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            task_id: String::new(),
            group_id: String::new(),
            app_id: String::new(),
            flow_id: String::new(),
            flow: FlowStateMachine::new(),
            step: StepStateMachine::new(),
            text: String::new(),
            documents: Vec::new(),
            usage: TokenUsage::default(),
            footnotes: Vec::new(),
            cancel,
        }
    }

    pub fn apply(&mut self, event: &StreamEvent) -> SessionDelta {
        if event.payload.is_heartbeat() {
            return SessionDelta::default();
        }

        let task_id = event.task_id();
        if self.task_id.is_empty() {
            debug!(task_id, "session adopted task id");
            self.task_id = task_id.to_string();
        } else if self.task_id != task_id {
            warn!(
                task_id = %self.task_id,
                foreign = task_id,
                event = event.name(),
                "dropping event for foreign task"
            );
            return SessionDelta::anomaly(format!(
                "event `{}` belongs to task `{task_id}`",
                event.name()
            ));
        }

        if self.flow.is_terminal() {
            warn!(
                task_id,
                state = %self.flow.state(),
                event = event.name(),
                "dropping event for terminal session"
            );
            return SessionDelta::anomaly(format!(
                "event `{}` arrived after the task became {}",
                event.name(),
                self.flow.state()
            ));
        }

        self.absorb_envelope(event);

        let mut delta = SessionDelta {
            step: self.step.apply(event),
            flow: self.flow.apply(&event.payload),
            ..SessionDelta::default()
        };

        // 用户拒绝执行时服务端先发 step.cancel，任务随之取消
        if let Some(step) = &delta.step {
            let declined = step.to == StepState::Cancelled
                && step.from.map(StepState::is_waiting).unwrap_or(false);
            if declined && !self.flow.is_terminal() {
                delta.flow = self.flow.force(FlowState::Cancelled);
            }
        }

        match &event.payload {
            EventPayload::TextAdd(chunk) => {
                self.text.push_str(&chunk.text);
                delta.text = Some(chunk.text.clone());
            }
            EventPayload::DocumentAdd(document) => {
                self.documents.push(document.clone());
                delta.document = Some(document.clone());
            }
            _ => {}
        }

        delta
    }

    /// 本地强制终态（用户取消、传输故障）
    pub fn force_state(&mut self, state: FlowState) -> Transition<FlowState> {
        self.flow.force(state)
    }

    fn absorb_envelope(&mut self, event: &StreamEvent) {
        let envelope = &event.envelope;
        if self.conversation_id.is_empty() && !envelope.conversation_id.is_empty() {
            self.conversation_id = envelope.conversation_id.clone();
        }
        if self.group_id.is_empty() && !envelope.group_id.is_empty() {
            self.group_id = envelope.group_id.clone();
        }
        if let Some(flow) = &envelope.flow {
            if !flow.app_id.is_empty() {
                self.app_id = flow.app_id.clone();
            }
            if !flow.flow_id.is_empty() {
                self.flow_id = flow.flow_id.clone();
            }
        }
        if let Some(metadata) = &envelope.metadata {
            self.usage.input_tokens += metadata.input_tokens;
            self.usage.output_tokens += metadata.output_tokens;
            if metadata.time_cost > 0.0 {
                self.usage.time_cost = metadata.time_cost;
            }
            self.footnotes
                .extend(metadata.foot_note_metadata_list.iter().cloned());
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn flow_state(&self) -> FlowState {
        self.flow.state()
    }

    pub fn step_state(&self) -> Option<StepState> {
        self.step.state()
    }

    pub fn current_step(&self) -> Option<&StepInstance> {
        self.step.current()
    }

    pub fn is_terminal(&self) -> bool {
        self.flow.is_terminal()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    pub fn footnotes(&self) -> &[Value] {
        &self.footnotes
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 交出累计的文本与文档，用于生成会话摘要
    pub fn take_output(&mut self) -> (String, Vec<Document>) {
        (
            std::mem::take(&mut self.text),
            std::mem::take(&mut self.documents),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{
        ConfirmationRequest, EventEnvelope, EventMetadata, FlowInfo, TextChunk,
    };

    fn event(task_id: &str, step_id: &str, payload: EventPayload) -> StreamEvent {
        StreamEvent::new(
            EventEnvelope {
                task_id: task_id.into(),
                conversation_id: "conv".into(),
                flow: Some(FlowInfo {
                    app_id: "app".into(),
                    flow_id: "flow".into(),
                    step_id: step_id.into(),
                    step_name: "shell".into(),
                    ..FlowInfo::default()
                }),
                ..EventEnvelope::default()
            },
            payload,
        )
    }

    #[test]
    fn accumulates_text_and_identifiers() {
        let mut session = TaskSession::new("");
        session.apply(&event("t1", "", EventPayload::FlowStart));
        let delta = session.apply(&event(
            "t1",
            "",
            EventPayload::TextAdd(TextChunk { text: "hello ".into() }),
        ));
        assert_eq!(delta.text.as_deref(), Some("hello "));
        session.apply(&event(
            "t1",
            "",
            EventPayload::TextAdd(TextChunk { text: "world".into() }),
        ));
        assert_eq!(session.text(), "hello world");
        assert_eq!(session.task_id(), "t1");
        assert_eq!(session.conversation_id(), "conv");
        assert_eq!(session.app_id(), "app");
    }

    #[test]
    fn foreign_task_is_an_anomaly() {
        let mut session = TaskSession::new("conv");
        session.apply(&event("t1", "", EventPayload::FlowStart));
        let delta = session.apply(&event("t2", "", EventPayload::FlowSuccess));
        assert!(delta.anomaly.is_some());
        assert_eq!(session.flow_state(), FlowState::Running);
    }

    #[test]
    fn events_after_terminal_state_are_dropped() {
        let mut session = TaskSession::new("conv");
        session.apply(&event("t1", "", EventPayload::FlowStart));
        session.apply(&event("t1", "", EventPayload::FlowSuccess));
        let delta = session.apply(&event(
            "t1",
            "",
            EventPayload::TextAdd(TextChunk { text: "late".into() }),
        ));
        assert!(delta.anomaly.is_some());
        assert!(session.text().is_empty());
    }

    #[test]
    fn declined_step_cancels_flow() {
        let mut session = TaskSession::new("conv");
        session.apply(&event("t1", "", EventPayload::FlowStart));
        session.apply(&event("t1", "s1", EventPayload::StepInit));
        session.apply(&event(
            "t1",
            "s1",
            EventPayload::StepWaitingForStart(ConfirmationRequest::default()),
        ));
        session.apply(&event("t1", "s1", EventPayload::FlowStop));
        let delta = session.apply(&event("t1", "s1", EventPayload::StepCancel));
        assert_eq!(
            delta.flow,
            Transition::Changed {
                from: FlowState::Stopped,
                to: FlowState::Cancelled
            }
        );
        assert_eq!(session.step_state(), Some(StepState::Cancelled));
    }

    #[test]
    fn metadata_is_accumulated() {
        let mut session = TaskSession::new("conv");
        let mut first = event("t1", "", EventPayload::FlowStart);
        first.envelope.metadata = Some(EventMetadata {
            input_tokens: 10,
            output_tokens: 2,
            time_cost: 0.5,
            foot_note_metadata_list: vec![serde_json::json!({"source": "kb"})],
        });
        session.apply(&first);
        let mut second = event("t1", "", EventPayload::FlowSuccess);
        second.envelope.metadata = Some(EventMetadata {
            input_tokens: 5,
            output_tokens: 7,
            time_cost: 1.5,
            ..EventMetadata::default()
        });
        session.apply(&second);
        assert_eq!(session.usage().input_tokens, 15);
        assert_eq!(session.usage().output_tokens, 9);
        assert_eq!(session.usage().time_cost, 1.5);
        assert_eq!(session.footnotes().len(), 1);
    }

    #[test]
    fn heartbeat_is_a_no_op() {
        let mut session = TaskSession::new("conv");
        session.apply(&event("t1", "", EventPayload::FlowStart));
        let delta = session.apply(&StreamEvent::heartbeat());
        assert!(delta.is_empty());
        assert_eq!(session.flow_state(), FlowState::Running);
    }
}
