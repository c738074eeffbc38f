use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 事件中 `flow.flowStatus` 字段的取值
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Init,
    Running,
    Stop,
    Error,
    Success,
    Cancel,
    #[serde(other)]
    Unknown,
}

/// 事件中 `flow.stepStatus` 字段的取值
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Init,
    Waiting,
    Running,
    Param,
    Success,
    Cancel,
    Error,
    #[serde(other)]
    Unknown,
}

/// 大部分事件携带的 `flow` 子记录
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowInfo {
    pub app_id: String,
    pub flow_id: String,
    pub flow_name: String,
    pub flow_status: Option<FlowStatus>,
    pub step_id: String,
    pub step_name: String,
    pub step_status: Option<StepStatus>,
}

/// 事件元数据：token 统计、耗时与脚注
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub time_cost: f64,
    pub foot_note_metadata_list: Vec<Value>,
}

/// 所有事件共享的信封字段
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventEnvelope {
    pub id: String,
    pub group_id: String,
    pub conversation_id: String,
    pub task_id: String,
    pub flow: Option<FlowInfo>,
    pub metadata: Option<EventMetadata>,
}

/// 工具调用的风险等级
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    #[default]
    #[serde(other)]
    Unknown,
}

impl RiskLevel {
    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::Low => "🟢 低风险",
            RiskLevel::Medium => "🟡 中等风险",
            RiskLevel::High => "🔴 高风险",
            RiskLevel::Unknown => "⚪ 风险等级未知",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationRequest {
    pub risk: RiskLevel,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterRequest {
    pub message: String,
    /// 服务端给出的待补全参数结构
    pub params: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 按 `event` 标签区分的事件负载
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Heartbeat,
    Init(Value),
    FlowStart,
    FlowStop,
    FlowFailed,
    FlowSuccess,
    FlowCancel,
    StepInit,
    StepWaitingForStart(ConfirmationRequest),
    StepWaitingForParam(ParameterRequest),
    StepInput(Value),
    StepOutput(Value),
    StepCancel,
    StepError,
    TextAdd(TextChunk),
    DocumentAdd(Document),
}

impl EventPayload {
    /// 线上协议中的事件名
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::Heartbeat => "heartbeat",
            EventPayload::Init(_) => "init",
            EventPayload::FlowStart => "flow.start",
            EventPayload::FlowStop => "flow.stop",
            EventPayload::FlowFailed => "flow.failed",
            EventPayload::FlowSuccess => "flow.success",
            EventPayload::FlowCancel => "flow.cancel",
            EventPayload::StepInit => "step.init",
            EventPayload::StepWaitingForStart(_) => "step.waiting_for_start",
            EventPayload::StepWaitingForParam(_) => "step.waiting_for_param",
            EventPayload::StepInput(_) => "step.input",
            EventPayload::StepOutput(_) => "step.output",
            EventPayload::StepCancel => "step.cancel",
            EventPayload::StepError => "step.error",
            EventPayload::TextAdd(_) => "text.add",
            EventPayload::DocumentAdd(_) => "document.add",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, EventPayload::Heartbeat)
    }

    pub fn is_step_event(&self) -> bool {
        matches!(
            self,
            EventPayload::StepInit
                | EventPayload::StepWaitingForStart(_)
                | EventPayload::StepWaitingForParam(_)
                | EventPayload::StepInput(_)
                | EventPayload::StepOutput(_)
                | EventPayload::StepCancel
                | EventPayload::StepError
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub envelope: EventEnvelope,
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn new(envelope: EventEnvelope, payload: EventPayload) -> Self {
        Self { envelope, payload }
    }

    pub fn heartbeat() -> Self {
        Self::new(EventEnvelope::default(), EventPayload::Heartbeat)
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    pub fn task_id(&self) -> &str {
        &self.envelope.task_id
    }

    pub fn step_id(&self) -> &str {
        self.envelope
            .flow
            .as_ref()
            .map(|flow| flow.step_id.as_str())
            .unwrap_or("")
    }

    pub fn step_name(&self) -> &str {
        self.envelope
            .flow
            .as_ref()
            .map(|flow| flow.step_name.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_risk_falls_back() {
        let request: ConfirmationRequest =
            serde_json::from_value(json!({"risk": "extreme", "reason": "rm -rf"})).unwrap();
        assert_eq!(request.risk, RiskLevel::Unknown);
        assert_eq!(request.reason, "rm -rf");
    }

    #[test]
    fn flow_info_uses_camel_case() {
        let info: FlowInfo = serde_json::from_value(json!({
            "appId": "app",
            "flowId": "flow",
            "stepId": "s1",
            "stepName": "list_files",
            "flowStatus": "running",
            "stepStatus": "param"
        }))
        .unwrap();
        assert_eq!(info.step_name, "list_files");
        assert_eq!(info.flow_status, Some(FlowStatus::Running));
        assert_eq!(info.step_status, Some(StepStatus::Param));
    }

    #[test]
    fn document_keeps_unknown_fields() {
        let doc: Document = serde_json::from_value(json!({
            "id": "d1",
            "name": "report.md",
            "type": "markdown",
            "size": 12,
            "author": "bot"
        }))
        .unwrap();
        assert_eq!(doc.doc_type, "markdown");
        assert_eq!(doc.extra.get("author"), Some(&json!("bot")));
    }
}
