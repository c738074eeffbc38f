use std::collections::HashSet;

use crate::state::{StepState, StepTransition};
use crate::stream::EventPayload;

use super::update::{ProgressLine, ProgressMode};

/// 为步骤事件生成进度文本，同名步骤的后续进度替换前一行
#[derive(Debug, Default)]
pub struct StepProgress {
    active: HashSet<String>,
}

impl StepProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe(
        &mut self,
        transition: &StepTransition,
        payload: &EventPayload,
    ) -> Option<ProgressLine> {
        let name = if transition.step_name.is_empty() {
            transition.step_id.as_str()
        } else {
            transition.step_name.as_str()
        };
        if name.is_empty() {
            return None;
        }

        let text = match transition.to {
            StepState::Init => format!("🔧 正在初始化工具: `{name}`"),
            StepState::Running => format!("📥 工具 `{name}` 正在执行..."),
            StepState::Success => format!("✅ 工具 `{name}` 执行完成"),
            StepState::Cancelled => format!("❌ 工具 `{name}` 已取消"),
            StepState::Error => format!("⚠️ 工具 `{name}` 执行失败"),
            StepState::WaitingForStart => match payload {
                EventPayload::StepWaitingForStart(request) => format!(
                    "⏸️ 等待用户确认执行工具: `{name}` {}\n💭 说明: {}",
                    request.risk.label(),
                    request.reason
                ),
                _ => format!("⏸️ 等待用户确认执行工具: `{name}`"),
            },
            StepState::WaitingForParam => match payload {
                EventPayload::StepWaitingForParam(request) => format!(
                    "📝 等待用户输入参数: `{name}`\n💭 说明: {}",
                    request.message
                ),
                _ => format!("📝 等待用户输入参数: `{name}`"),
            },
        };

        let is_final = transition.to.is_terminal();
        let mode = if is_final {
            if self.active.remove(name) {
                ProgressMode::Replace
            } else {
                ProgressMode::New
            }
        } else if self.active.insert(name.to_string()) {
            ProgressMode::New
        } else {
            ProgressMode::Replace
        };

        Some(ProgressLine {
            text,
            mode,
            is_final,
        })
    }
}
