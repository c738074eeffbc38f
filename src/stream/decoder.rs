use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{AgentShellError, DecodeError, Result};

use super::event::{EventEnvelope, EventMetadata, EventPayload, FlowInfo, StreamEvent};

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 3;

/// 流结束标记行
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sentinel {
    /// `data: [DONE]`
    Done,
    /// `data: [ERROR]`
    Failed,
    /// `data: [SENSITIVE]`，内容被服务端屏蔽
    Sensitive,
}

impl Sentinel {
    fn from_data(data: &str) -> Option<Self> {
        match data {
            "[DONE]" => Some(Sentinel::Done),
            "[ERROR]" => Some(Sentinel::Failed),
            "[SENSITIVE]" => Some(Sentinel::Sensitive),
            _ => None,
        }
    }
}

/// 解码器产出的单个条目
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedItem {
    Event(StreamEvent),
    Sentinel(Sentinel),
    /// 无法解析的行，已记录并跳过
    Malformed(DecodeError),
}

impl DecodedItem {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, DecodedItem::Sentinel(_))
    }
}

/// SSE `data:` 行解码器
///
/// 按行切分字节流，识别结束标记并把 JSON 负载解析为 [`StreamEvent`]。
/// 收到结束标记后解码器即失效，后续输入全部丢弃。
/// 连续出现 `max_consecutive_failures` 个无法解析的行时视为流已损坏，
/// 返回传输错误。
#[derive(Debug)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    consecutive_failures: usize,
    max_consecutive_failures: usize,
    finished: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::with_failure_threshold(DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }

    pub fn with_failure_threshold(max_consecutive_failures: usize) -> Self {
        Self {
            buffer: Vec::new(),
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 输入任意字节块，返回其中完整的行解码出的条目
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<DecodedItem>> {
        let mut items = Vec::new();
        if self.finished {
            return Ok(items);
        }

        self.buffer.extend_from_slice(bytes);
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(item) = self.decode_line(&line)? {
                items.push(item);
            }
            if self.finished {
                self.buffer.clear();
                break;
            }
        }

        Ok(items)
    }

    /// 字节流结束时调用，处理缓冲区中没有换行结尾的最后一行
    pub fn finish(&mut self) -> Result<Vec<DecodedItem>> {
        if self.finished || self.buffer.is_empty() {
            self.buffer.clear();
            return Ok(Vec::new());
        }
        let raw = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&raw);
        Ok(self.decode_line(&line)?.into_iter().collect())
    }

    /// 解码单行。非 `data:` 行与空数据行返回 `None`。
    pub fn decode_line(&mut self, line: &str) -> Result<Option<DecodedItem>> {
        if self.finished {
            return Ok(None);
        }

        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }

        if let Some(sentinel) = Sentinel::from_data(data) {
            debug!(?sentinel, "stream sentinel received");
            self.finished = true;
            return Ok(Some(DecodedItem::Sentinel(sentinel)));
        }

        match parse_event(data) {
            Ok(Some(event)) => {
                self.consecutive_failures = 0;
                Ok(Some(DecodedItem::Event(event)))
            }
            Ok(None) => {
                self.consecutive_failures = 0;
                Ok(None)
            }
            Err(error) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %error,
                    consecutive = self.consecutive_failures,
                    "skipping undecodable stream line"
                );
                if self.consecutive_failures >= self.max_consecutive_failures {
                    self.finished = true;
                    return Err(AgentShellError::transport(format!(
                        "stream corrupted: {} consecutive undecodable lines",
                        self.consecutive_failures
                    )));
                }
                Ok(Some(DecodedItem::Malformed(error)))
            }
        }
    }
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    event: Option<String>,
    #[serde(default)]
    id: String,
    #[serde(default)]
    group_id: String,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    flow: Option<FlowInfo>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    metadata: Option<EventMetadata>,
}

/// 解析一条 JSON 负载。未知事件名返回 `Ok(None)`。
pub fn parse_event(data: &str) -> std::result::Result<Option<StreamEvent>, DecodeError> {
    let raw: RawEvent = serde_json::from_str(data).map_err(|error| DecodeError::InvalidJson {
        reason: error.to_string(),
    })?;
    let tag = raw.event.ok_or(DecodeError::MissingTag)?;

    let Some(payload) = decode_payload(&tag, raw.content)? else {
        debug!(event = %tag, "ignoring unknown stream event");
        return Ok(None);
    };

    if !payload.is_heartbeat() && raw.task_id.is_empty() {
        return Err(DecodeError::MissingTaskId(tag));
    }

    let envelope = EventEnvelope {
        id: raw.id,
        group_id: raw.group_id,
        conversation_id: raw.conversation_id,
        task_id: raw.task_id,
        flow: raw.flow,
        metadata: raw.metadata,
    };
    Ok(Some(StreamEvent::new(envelope, payload)))
}

fn decode_payload(
    tag: &str,
    content: Value,
) -> std::result::Result<Option<EventPayload>, DecodeError> {
    let payload = match tag {
        "heartbeat" => EventPayload::Heartbeat,
        "init" => EventPayload::Init(content),
        "flow.start" => EventPayload::FlowStart,
        "flow.stop" => EventPayload::FlowStop,
        "flow.failed" => EventPayload::FlowFailed,
        "flow.success" => EventPayload::FlowSuccess,
        "flow.cancel" => EventPayload::FlowCancel,
        "step.init" => EventPayload::StepInit,
        "step.waiting_for_start" => {
            EventPayload::StepWaitingForStart(typed_content(tag, content)?)
        }
        "step.waiting_for_param" => {
            EventPayload::StepWaitingForParam(typed_content(tag, content)?)
        }
        "step.input" => EventPayload::StepInput(content),
        "step.output" => EventPayload::StepOutput(content),
        "step.cancel" => EventPayload::StepCancel,
        "step.error" => EventPayload::StepError,
        "text.add" => EventPayload::TextAdd(typed_content(tag, content)?),
        "document.add" => EventPayload::DocumentAdd(typed_content(tag, content)?),
        _ => return Ok(None),
    };
    Ok(Some(payload))
}

fn typed_content<T>(tag: &str, content: Value) -> std::result::Result<T, DecodeError>
where
    T: serde::de::DeserializeOwned,
{
    let content = match content {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(content).map_err(|error| DecodeError::InvalidContent {
        event: tag.to_string(),
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::RiskLevel;

    #[test]
    fn decodes_text_event_split_across_chunks() {
        let mut decoder = EventDecoder::new();
        let first = decoder
            .feed(b"data: {\"event\":\"text.add\",\"taskId\":\"t1\",\"content\":{\"te")
            .unwrap();
        assert!(first.is_empty());

        let second = decoder.feed(b"xt\":\"hello\"}}\n\n").unwrap();
        assert_eq!(second.len(), 1);
        match &second[0] {
            DecodedItem::Event(event) => {
                assert_eq!(event.task_id(), "t1");
                assert_eq!(event.name(), "text.add");
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn multibyte_text_survives_chunk_boundary() {
        let line = "data: {\"event\":\"text.add\",\"taskId\":\"t1\",\"content\":{\"text\":\"你好\"}}\n";
        let bytes = line.as_bytes();
        let split = line.find("你").unwrap() + 1;

        let mut decoder = EventDecoder::new();
        assert!(decoder.feed(&bytes[..split]).unwrap().is_empty());
        let items = decoder.feed(&bytes[split..]).unwrap();
        match &items[0] {
            DecodedItem::Event(event) => match &event.payload {
                EventPayload::TextAdd(chunk) => assert_eq!(chunk.text, "你好"),
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn sentinel_stops_decoding() {
        let mut decoder = EventDecoder::new();
        let items = decoder
            .feed(b"data: [DONE]\ndata: {\"event\":\"flow.start\",\"taskId\":\"t1\"}\n")
            .unwrap();
        assert_eq!(items, vec![DecodedItem::Sentinel(Sentinel::Done)]);
        assert!(decoder.is_finished());
        assert!(decoder.feed(b"data: [ERROR]\n").unwrap().is_empty());
    }

    #[test]
    fn accepts_prefix_without_space_and_crlf() {
        let mut decoder = EventDecoder::new();
        let items = decoder.feed(b"data:[ERROR]\r\n").unwrap();
        assert_eq!(items, vec![DecodedItem::Sentinel(Sentinel::Failed)]);
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut decoder = EventDecoder::new();
        let items = decoder
            .feed(b": keep-alive\nevent: message\n\ndata:\n")
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn third_consecutive_failure_is_fatal() {
        let mut decoder = EventDecoder::new();
        assert!(matches!(
            decoder.decode_line("data: {oops").unwrap(),
            Some(DecodedItem::Malformed(DecodeError::InvalidJson { .. }))
        ));
        assert!(decoder.decode_line("data: still broken").unwrap().is_some());
        let error = decoder.decode_line("data: nope").unwrap_err();
        assert!(error.is_transport());
        assert!(decoder.is_finished());
    }

    #[test]
    fn valid_line_resets_failure_count() {
        let mut decoder = EventDecoder::new();
        decoder.decode_line("data: {oops").unwrap();
        decoder.decode_line("data: {oops").unwrap();
        decoder.decode_line("data: {\"event\":\"heartbeat\"}").unwrap();
        decoder.decode_line("data: {oops").unwrap();
        assert!(decoder.decode_line("data: {oops").is_ok());
    }

    #[test]
    fn missing_task_id_is_decode_error() {
        let error = parse_event("{\"event\":\"flow.start\"}").unwrap_err();
        assert_eq!(error, DecodeError::MissingTaskId("flow.start".into()));
    }

    #[test]
    fn unknown_event_is_skipped() {
        assert_eq!(
            parse_event("{\"event\":\"executor.start\",\"taskId\":\"t\"}").unwrap(),
            None
        );
    }

    #[test]
    fn waiting_for_start_carries_risk() {
        let event = parse_event(
            "{\"event\":\"step.waiting_for_start\",\"taskId\":\"t\",\
             \"flow\":{\"stepId\":\"s\",\"stepName\":\"rm\"},\
             \"content\":{\"risk\":\"high\",\"reason\":\"deletes files\"}}",
        )
        .unwrap()
        .unwrap();
        match &event.payload {
            EventPayload::StepWaitingForStart(request) => {
                assert_eq!(request.risk, RiskLevel::High);
                assert_eq!(request.reason, "deletes files");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(event.step_name(), "rm");
    }

    #[test]
    fn text_add_without_text_is_content_error() {
        let error =
            parse_event("{\"event\":\"text.add\",\"taskId\":\"t\",\"content\":{}}").unwrap_err();
        assert!(matches!(error, DecodeError::InvalidContent { .. }));
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = EventDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").unwrap().is_empty());
        assert_eq!(
            decoder.finish().unwrap(),
            vec![DecodedItem::Sentinel(Sentinel::Done)]
        );
    }
}
