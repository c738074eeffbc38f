// 工具确认与参数补全的交互协调

pub mod coordinator;
pub mod pending;

pub use coordinator::{
    spawn_resume, InteractionCoordinator, Resolution, ResumeOutcome, ResumeTarget,
};
pub use pending::{
    Decision, InteractionKey, InteractionKind, InteractionRequest, PendingInteraction,
};
