use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::backend::ResumeResponse;
use crate::stream::RiskLevel;

/// 交互的关联键
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InteractionKey {
    pub task_id: String,
    pub step_id: String,
}

impl InteractionKey {
    pub fn new(task_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            step_id: step_id.into(),
        }
    }
}

/// 需要用户给出的输入
#[derive(Clone, Debug, PartialEq)]
pub enum InteractionKind {
    /// 工具执行前的确认
    Confirm { risk: RiskLevel, reason: String },
    /// 补全缺失的参数
    Parameters { message: String, schema: Value },
}

impl InteractionKind {
    pub fn label(&self) -> &'static str {
        match self {
            InteractionKind::Confirm { .. } => "confirm",
            InteractionKind::Parameters { .. } => "parameters",
        }
    }
}

/// 推送给 UI 的交互请求
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionRequest {
    pub task_id: String,
    pub step_id: String,
    pub step_name: String,
    pub kind: InteractionKind,
}

impl InteractionRequest {
    pub fn key(&self) -> InteractionKey {
        InteractionKey::new(self.task_id.clone(), self.step_id.clone())
    }
}

/// 用户决策
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Confirm(bool),
    /// `None` 等同于拒绝
    Parameters(Option<Map<String, Value>>),
}

impl Decision {
    pub fn is_decline(&self) -> bool {
        matches!(self, Decision::Confirm(false) | Decision::Parameters(None))
    }

    /// 决策是否适用于该交互；拒绝对两类交互都有效
    pub fn fits(&self, kind: &InteractionKind) -> bool {
        if self.is_decline() {
            return true;
        }
        matches!(
            (self, kind),
            (Decision::Confirm(_), InteractionKind::Confirm { .. })
                | (Decision::Parameters(_), InteractionKind::Parameters { .. })
        )
    }

    pub fn into_response(self) -> ResumeResponse {
        match self {
            Decision::Confirm(confirmed) => ResumeResponse::Confirm(confirmed),
            Decision::Parameters(Some(params)) => ResumeResponse::Parameters(params),
            Decision::Parameters(None) => ResumeResponse::Confirm(false),
        }
    }
}

/// 等待用户决策的交互，响应端只能使用一次
#[derive(Debug)]
pub struct PendingInteraction {
    pub request: InteractionRequest,
    pub(crate) responder: oneshot::Sender<Decision>,
}

impl PendingInteraction {
    pub fn new(request: InteractionRequest) -> (Self, oneshot::Receiver<Decision>) {
        let (responder, receiver) = oneshot::channel();
        (Self { request, responder }, receiver)
    }

    pub fn key(&self) -> InteractionKey {
        self.request.key()
    }
}
