pub mod backend;
pub mod config;
pub mod error;
pub mod interaction;
pub mod runtime;
pub mod state;
pub mod stream;
pub mod utils;

#[cfg(feature = "http-client")]
pub use backend::HermesHttpBackend;
pub use backend::{
    AppRequest, ChatRequest, DynFlowBackend, FlowBackend, ReplayBackend, ReplayScript,
    ResumeRequest, ResumeResponse, StreamFeeder,
};
pub use config::{BackendConfig, EnvConfig, RuntimeConfig};
pub use error::{AgentShellError, DecodeError, InteractionError, Result};
pub use interaction::{
    Decision, InteractionCoordinator, InteractionKey, InteractionKind, InteractionRequest,
    Resolution,
};
pub use runtime::{
    ProgressLine, ProgressMode, SessionHandle, SessionSummary, StepUpdate, StreamRuntime,
    TaskOutcome, TerminalCause, UiUpdate,
};
pub use state::{
    FlowState, FlowStateMachine, SessionDelta, StepState, StepStateMachine, StepTransition,
    TaskSession, TokenUsage, Transition,
};
pub use stream::{
    decode_stream, ByteStream, DecodedItem, EventDecoder, EventPayload, EventSource, RiskLevel,
    Sentinel, StreamEvent,
};
pub use utils::{logging, validation};
