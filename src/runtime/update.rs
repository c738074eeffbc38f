use serde_json::Value;

use crate::interaction::InteractionRequest;
use crate::state::{FlowState, StepState, TokenUsage};
use crate::stream::Document;

/// 会话终结的原因
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalCause {
    /// 服务端正常结束
    Completed,
    /// 服务端报告失败（flow.failed 或 `[ERROR]`）
    ServerFailed,
    /// 服务端取消（用户拒绝执行工具等）
    Cancelled,
    /// 本地用户中断
    UserCancelled,
    /// 内容被服务端屏蔽
    Sensitive,
    /// 流异常中断或结束标记缺失
    Transport(String),
}

/// 会话的唯一终态
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub state: FlowState,
    pub cause: TerminalCause,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.state == FlowState::Succeeded
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressMode {
    /// 该步骤的第一行进度
    New,
    /// 替换同一步骤上一行进度
    Replace,
}

/// 步骤进度文本，按步骤名原地更新
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressLine {
    pub text: String,
    pub mode: ProgressMode,
    /// 步骤已结束，之后同名步骤会重新开始一行
    pub is_final: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepUpdate {
    pub task_id: String,
    pub step_id: String,
    pub step_name: String,
    pub from: Option<StepState>,
    pub to: StepState,
    pub progress: Option<ProgressLine>,
}

/// 推送给 UI 的有序更新
#[derive(Clone, Debug, PartialEq)]
pub enum UiUpdate {
    /// 非终态的任务状态变化
    Flow {
        task_id: String,
        from: FlowState,
        to: FlowState,
    },
    Step(StepUpdate),
    Text {
        task_id: String,
        text: String,
    },
    Document {
        task_id: String,
        document: Document,
    },
    /// 需要用户确认或补全参数
    Interaction(InteractionRequest),
    Notice {
        task_id: String,
        message: String,
    },
    /// 每个会话恰好一条，之后队列关闭
    Finished(TaskOutcome),
}

impl UiUpdate {
    pub fn is_finished(&self) -> bool {
        matches!(self, UiUpdate::Finished(_))
    }
}

/// 会话循环退出时的汇总
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub outcome: TaskOutcome,
    pub conversation_id: String,
    pub text: String,
    pub documents: Vec<Document>,
    pub usage: TokenUsage,
    pub footnotes: Vec<Value>,
    pub decode_errors: usize,
    pub anomalies: usize,
}
