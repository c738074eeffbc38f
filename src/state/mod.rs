// 任务与步骤状态管理模块

pub mod flow;
pub mod session;
pub mod step;

pub use flow::{FlowState, FlowStateMachine, Transition};
pub use session::{SessionDelta, TaskSession, TokenUsage};
pub use step::{StepInstance, StepState, StepStateMachine, StepTransition};
