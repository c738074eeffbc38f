use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::Result;

use super::decoder::{DecodedItem, EventDecoder};

/// 网络层提供的原始字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 解码后条目的惰性流
pub type DecodedStream = Pin<Box<dyn Stream<Item = Result<DecodedItem>> + Send>>;

/// 字节流与其解码器的组合，按顺序逐条产出解码结果。
///
/// 一次性使用：字节流结束、出错或读到结束标记后不再产出任何条目。
/// `next_item` 只在读取底层字节时挂起，可以安全地放进 `select!`。
pub struct EventSource {
    bytes: ByteStream,
    decoder: EventDecoder,
    pending: VecDeque<DecodedItem>,
    exhausted: bool,
}

impl EventSource {
    pub fn new(bytes: ByteStream, decoder: EventDecoder) -> Self {
        Self {
            bytes,
            decoder,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn next_item(&mut self) -> Option<Result<DecodedItem>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }
            if self.exhausted {
                return None;
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => match self.decoder.feed(&chunk) {
                    Ok(items) => self.pending.extend(items),
                    Err(error) => {
                        self.exhausted = true;
                        return Some(Err(error));
                    }
                },
                Some(Err(error)) => {
                    self.exhausted = true;
                    return Some(Err(error));
                }
                None => {
                    self.exhausted = true;
                    match self.decoder.finish() {
                        Ok(items) => self.pending.extend(items),
                        Err(error) => return Some(Err(error)),
                    }
                }
            }

            if self.decoder.is_finished() {
                self.exhausted = true;
            }
        }
    }

    pub fn into_stream(self) -> DecodedStream {
        Box::pin(futures::stream::unfold(self, |mut source| async move {
            let item = source.next_item().await?;
            Some((item, source))
        }))
    }
}

/// 把字节流直接解码成惰性条目流
pub fn decode_stream(bytes: ByteStream, decoder: EventDecoder) -> DecodedStream {
    EventSource::new(bytes, decoder).into_stream()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentShellError;
    use crate::stream::decoder::Sentinel;

    fn chunks(parts: Vec<Result<&'static str>>) -> ByteStream {
        Box::pin(futures::stream::iter(
            parts
                .into_iter()
                .map(|part| part.map(|text| Bytes::from_static(text.as_bytes()))),
        ))
    }

    #[tokio::test]
    async fn yields_items_then_stops_after_sentinel() {
        let bytes = chunks(vec![
            Ok("data: {\"event\":\"heartbeat\"}\n"),
            Ok("data: [DONE]\ndata: {\"event\":\"flow.start\",\"taskId\":\"t\"}\n"),
        ]);
        let items: Vec<_> = decode_stream(bytes, EventDecoder::new()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            items[1].as_ref().unwrap(),
            DecodedItem::Sentinel(Sentinel::Done)
        ));
    }

    #[tokio::test]
    async fn transport_error_ends_source() {
        let bytes = chunks(vec![
            Err(AgentShellError::transport("connection reset")),
            Ok("data: [DONE]\n"),
        ]);
        let mut source = EventSource::new(bytes, EventDecoder::new());
        assert!(source.next_item().await.unwrap().is_err());
        assert!(source.next_item().await.is_none());
    }

    #[tokio::test]
    async fn eof_without_newline_is_flushed() {
        let bytes = chunks(vec![Ok("data: [ERROR]")]);
        let mut source = EventSource::new(bytes, EventDecoder::new());
        assert!(matches!(
            source.next_item().await,
            Some(Ok(DecodedItem::Sentinel(Sentinel::Failed)))
        ));
        assert!(source.next_item().await.is_none());
    }
}
