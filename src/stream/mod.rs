// 事件流解码模块

pub mod decoder;
pub mod event;
pub mod source;

pub use decoder::{parse_event, DecodedItem, EventDecoder, Sentinel};
pub use event::{
    ConfirmationRequest, Document, EventEnvelope, EventMetadata, EventPayload, FlowInfo,
    FlowStatus, ParameterRequest, RiskLevel, StepStatus, StreamEvent, TextChunk,
};
pub use source::{decode_stream, ByteStream, DecodedStream, EventSource};
