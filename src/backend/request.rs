use serde::Serialize;
use serde_json::{json, Map, Value};

pub const DEFAULT_LANGUAGE: &str = "zh";

/// 请求体中的 `app` 字段
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    pub app_id: String,
    pub flow_id: String,
    /// 工具确认或参数补全时携带的响应
    pub params: Value,
}

impl AppRequest {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            flow_id: String::new(),
            params: Value::Object(Map::new()),
        }
    }

    pub fn with_flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = flow_id.into();
        self
    }
}

/// 发起一轮对话的请求
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub question: String,
    pub language: String,
    pub llm_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kb_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppRequest>,
}

impl ChatRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            llm_id: String::new(),
            conversation_id: String::new(),
            kb_ids: Vec::new(),
            app: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_llm(mut self, llm_id: impl Into<String>) -> Self {
        self.llm_id = llm_id.into();
        self
    }

    pub fn with_kb_ids(mut self, kb_ids: Vec<String>) -> Self {
        self.kb_ids = kb_ids;
        self
    }

    /// 空的 app id 表示普通问答，不附带 `app` 字段
    pub fn with_app(mut self, app: AppRequest) -> Self {
        self.app = (!app.app_id.is_empty()).then_some(app);
        self
    }
}

/// 用户对等待中步骤的答复
#[derive(Clone, Debug, PartialEq)]
pub enum ResumeResponse {
    Confirm(bool),
    Parameters(Map<String, Value>),
}

impl ResumeResponse {
    pub fn to_params(&self) -> Value {
        match self {
            ResumeResponse::Confirm(confirmed) => json!({ "confirm": confirmed }),
            ResumeResponse::Parameters(params) => Value::Object(params.clone()),
        }
    }

    pub fn is_decline(&self) -> bool {
        matches!(self, ResumeResponse::Confirm(false))
    }
}

/// 按 `(taskId, stepId)` 关联的恢复请求
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeRequest {
    pub task_id: String,
    pub step_id: String,
    pub conversation_id: String,
    pub app_id: String,
    pub flow_id: String,
    pub language: String,
    pub llm_id: String,
    pub response: ResumeResponse,
}

impl ResumeRequest {
    /// 恢复请求复用 chat 接口，问题为空，答复放在 `app.params`
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "question": "",
            "language": self.language,
            "llmId": self.llm_id,
            "taskId": self.task_id,
            "app": {
                "appId": self.app_id,
                "flowId": self.flow_id,
                "params": self.response.to_params(),
            },
        });
        if !self.conversation_id.is_empty() {
            body["conversationId"] = Value::String(self.conversation_id.clone());
        }
        body
    }
}
