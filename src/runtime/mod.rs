// 流式会话运行时模块

mod dispatch;
mod progress;
mod runtime;
mod update;

pub use progress::StepProgress;
pub use runtime::{SessionHandle, StreamRuntime};
pub use update::{
    ProgressLine, ProgressMode, SessionSummary, StepUpdate, TaskOutcome, TerminalCause, UiUpdate,
};
