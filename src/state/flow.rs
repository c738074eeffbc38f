use std::fmt;

use serde::Serialize;

use crate::stream::EventPayload;

/// 一次 agent 任务的顶层状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Init,
    Running,
    Stopped,
    Failed,
    Cancelled,
    Succeeded,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowState::Failed | FlowState::Cancelled | FlowState::Succeeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Init => "init",
            FlowState::Running => "running",
            FlowState::Stopped => "stopped",
            FlowState::Failed => "failed",
            FlowState::Cancelled => "cancelled",
            FlowState::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态机处理一个事件的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition<S> {
    Changed { from: S, to: S },
    Unchanged,
    /// 状态已终结，事件被吸收
    Absorbed,
}

impl<S: Copy> Transition<S> {
    pub fn target(&self) -> Option<S> {
        match self {
            Transition::Changed { to, .. } => Some(*to),
            _ => None,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

/// 由 `flow.*` 事件驱动的任务状态机
#[derive(Clone, Debug, Default)]
pub struct FlowStateMachine {
    state: FlowState,
}

impl FlowStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn apply(&mut self, payload: &EventPayload) -> Transition<FlowState> {
        use FlowState as S;

        if payload.is_heartbeat() {
            return Transition::Unchanged;
        }
        if self.state.is_terminal() {
            return Transition::Absorbed;
        }

        let current = self.state;
        let next = match payload {
            EventPayload::Heartbeat => None,
            EventPayload::Init(_) => (current == S::Init).then_some(S::Init),
            EventPayload::FlowStart => {
                matches!(current, S::Init | S::Running).then_some(S::Running)
            }
            EventPayload::FlowStop => (current == S::Running).then_some(S::Stopped),
            // 任一步骤恢复执行都会把暂停的任务拉回运行态
            EventPayload::StepInput(_) => (current == S::Stopped).then_some(S::Running),
            // 等待用户期间服务端超时也会直接发出 flow.failed
            EventPayload::FlowFailed => {
                matches!(current, S::Running | S::Stopped).then_some(S::Failed)
            }
            EventPayload::FlowCancel => {
                matches!(current, S::Running | S::Stopped).then_some(S::Cancelled)
            }
            EventPayload::FlowSuccess => (current == S::Running).then_some(S::Succeeded),
            EventPayload::StepInit
            | EventPayload::StepWaitingForStart(_)
            | EventPayload::StepWaitingForParam(_)
            | EventPayload::StepOutput(_)
            | EventPayload::StepCancel
            | EventPayload::StepError
            | EventPayload::TextAdd(_)
            | EventPayload::DocumentAdd(_) => None,
        };

        match next {
            Some(to) => self.move_to(to),
            None => Transition::Unchanged,
        }
    }

    /// 本地强制迁移，用于用户取消与传输故障。会覆盖已终结的状态。
    pub fn force(&mut self, state: FlowState) -> Transition<FlowState> {
        self.move_to(state)
    }

    /// 依次应用事件，返回最终状态
    pub fn replay<'a, I>(payloads: I) -> FlowState
    where
        I: IntoIterator<Item = &'a EventPayload>,
    {
        let mut machine = Self::new();
        for payload in payloads {
            machine.apply(payload);
        }
        machine.state()
    }

    fn move_to(&mut self, to: FlowState) -> Transition<FlowState> {
        let from = self.state;
        if from == to {
            return Transition::Unchanged;
        }
        self.state = to;
        Transition::Changed { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn follows_happy_path() {
        let mut machine = FlowStateMachine::new();
        assert_eq!(
            machine.apply(&EventPayload::Init(Value::Null)),
            Transition::Unchanged
        );
        assert_eq!(
            machine.apply(&EventPayload::FlowStart),
            Transition::Changed {
                from: FlowState::Init,
                to: FlowState::Running
            }
        );
        assert_eq!(machine.apply(&EventPayload::FlowStart), Transition::Unchanged);
        machine.apply(&EventPayload::FlowSuccess);
        assert_eq!(machine.state(), FlowState::Succeeded);
    }

    #[test]
    fn stop_resumes_on_step_input() {
        let mut machine = FlowStateMachine::new();
        machine.apply(&EventPayload::FlowStart);
        machine.apply(&EventPayload::FlowStop);
        assert_eq!(machine.state(), FlowState::Stopped);
        machine.apply(&EventPayload::StepInput(Value::Null));
        assert_eq!(machine.state(), FlowState::Running);
    }

    #[test]
    fn unmatched_events_are_ignored() {
        let mut machine = FlowStateMachine::new();
        assert_eq!(machine.apply(&EventPayload::FlowSuccess), Transition::Unchanged);
        assert_eq!(machine.apply(&EventPayload::FlowStop), Transition::Unchanged);
        assert_eq!(machine.state(), FlowState::Init);
    }

    #[test]
    fn terminal_state_absorbs_events() {
        let mut machine = FlowStateMachine::new();
        machine.apply(&EventPayload::FlowStart);
        machine.apply(&EventPayload::FlowCancel);
        assert_eq!(machine.apply(&EventPayload::FlowStart), Transition::Absorbed);
        assert_eq!(machine.apply(&EventPayload::Heartbeat), Transition::Unchanged);
        assert_eq!(machine.state(), FlowState::Cancelled);
    }

    #[test]
    fn force_overrides_terminal_state() {
        let mut machine = FlowStateMachine::new();
        machine.apply(&EventPayload::FlowStart);
        machine.apply(&EventPayload::FlowSuccess);
        assert!(machine.force(FlowState::Failed).is_changed());
        assert_eq!(machine.state(), FlowState::Failed);
    }
}
