use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::stream::{EventPayload, StreamEvent};

/// 当前步骤实例的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Init,
    WaitingForStart,
    Running,
    WaitingForParam,
    Success,
    Cancelled,
    Error,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Success | StepState::Cancelled | StepState::Error)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, StepState::WaitingForStart | StepState::WaitingForParam)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepState::Init => "init",
            StepState::WaitingForStart => "waiting_for_start",
            StepState::Running => "running",
            StepState::WaitingForParam => "waiting_for_param",
            StepState::Success => "success",
            StepState::Cancelled => "cancelled",
            StepState::Error => "error",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepInstance {
    pub step_id: String,
    pub step_name: String,
    pub state: StepState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepTransition {
    pub step_id: String,
    pub step_name: String,
    /// `None` 表示新建的步骤实例
    pub from: Option<StepState>,
    pub to: StepState,
}

#[derive(Clone, Copy)]
enum StepSignal {
    WaitingForStart,
    WaitingForParam,
    Input,
    Output,
    Cancel,
    Error,
}

/// 由 `step.*` 事件驱动的步骤状态机，同一时间只跟踪一个步骤实例
#[derive(Clone, Debug, Default)]
pub struct StepStateMachine {
    current: Option<StepInstance>,
}

impl StepStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&StepInstance> {
        self.current.as_ref()
    }

    pub fn state(&self) -> Option<StepState> {
        self.current.as_ref().map(|step| step.state)
    }

    pub fn apply(&mut self, event: &StreamEvent) -> Option<StepTransition> {
        let signal = match &event.payload {
            EventPayload::StepInit => {
                return Some(self.begin(event.step_id(), event.step_name()));
            }
            EventPayload::StepWaitingForStart(_) => StepSignal::WaitingForStart,
            EventPayload::StepWaitingForParam(_) => StepSignal::WaitingForParam,
            EventPayload::StepInput(_) => StepSignal::Input,
            EventPayload::StepOutput(_) => StepSignal::Output,
            EventPayload::StepCancel => StepSignal::Cancel,
            EventPayload::StepError => StepSignal::Error,
            // 服务端不发送独立的步骤失败事件，flow.failed 即终止当前步骤
            EventPayload::FlowFailed => return self.interrupt(StepState::Error),
            EventPayload::FlowCancel => return self.interrupt(StepState::Cancelled),
            EventPayload::Heartbeat
            | EventPayload::Init(_)
            | EventPayload::FlowStart
            | EventPayload::FlowStop
            | EventPayload::FlowSuccess
            | EventPayload::TextAdd(_)
            | EventPayload::DocumentAdd(_) => return None,
        };

        let step_id = event.step_id();
        let implicit = match &self.current {
            None => true,
            Some(step) => !step_id.is_empty() && step.step_id != step_id,
        };
        let mut created = false;
        if implicit {
            if matches!(signal, StepSignal::Output | StepSignal::Cancel | StepSignal::Error) {
                debug!(step_id, event = event.name(), "dropping event for unknown step");
                return None;
            }
            // 自动执行模式下可能没有 step.init，直接隐式创建实例
            self.current = Some(StepInstance {
                step_id: step_id.to_string(),
                step_name: event.step_name().to_string(),
                state: StepState::Init,
            });
            created = true;
        }

        let step = self.current.as_mut()?;
        let from = step.state;
        let next = next_state(from, signal);
        match next {
            Some(to) if to != from => {
                step.state = to;
                Some(StepTransition {
                    step_id: step.step_id.clone(),
                    step_name: step.step_name.clone(),
                    from: if created { None } else { Some(from) },
                    to,
                })
            }
            _ => None,
        }
    }

    /// 依次应用事件，返回最终步骤状态
    pub fn replay<'a, I>(events: I) -> Option<StepState>
    where
        I: IntoIterator<Item = &'a StreamEvent>,
    {
        let mut machine = Self::new();
        for event in events {
            machine.apply(event);
        }
        machine.state()
    }

    fn begin(&mut self, step_id: &str, step_name: &str) -> StepTransition {
        let previous = self.current.take();
        if let Some(step) = previous.as_ref().filter(|step| !step.state.is_terminal()) {
            debug!(
                previous = %step.step_id,
                state = %step.state,
                "new step started before previous step finished"
            );
        }
        self.current = Some(StepInstance {
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            state: StepState::Init,
        });
        StepTransition {
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            from: None,
            to: StepState::Init,
        }
    }

    fn interrupt(&mut self, to: StepState) -> Option<StepTransition> {
        let step = self.current.as_mut()?;
        if step.state.is_terminal() {
            return None;
        }
        let from = step.state;
        step.state = to;
        Some(StepTransition {
            step_id: step.step_id.clone(),
            step_name: step.step_name.clone(),
            from: Some(from),
            to,
        })
    }
}

fn next_state(from: StepState, signal: StepSignal) -> Option<StepState> {
    use StepState as S;

    if from.is_terminal() {
        return None;
    }
    match (from, signal) {
        (S::Init, StepSignal::WaitingForStart) => Some(S::WaitingForStart),
        (S::Init | S::Running, StepSignal::WaitingForParam) => Some(S::WaitingForParam),
        (S::Init | S::WaitingForStart | S::WaitingForParam, StepSignal::Input) => Some(S::Running),
        (S::Running, StepSignal::Output) => Some(S::Success),
        (_, StepSignal::Cancel) => Some(S::Cancelled),
        (_, StepSignal::Error) => Some(S::Error),
        _ => None,
    }
}
