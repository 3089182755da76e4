//! `text/event-stream` decoding for the SSE transport.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt};

use super::check_size;
use crate::error::Result;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server sent none.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental decoder: feed raw bytes, collect complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }

        events
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// Events read from an HTTP response body.
pub(crate) struct EventStream {
    body: ByteStream,
    decoder: SseDecoder,
    ready: VecDeque<SseEvent>,
}

impl EventStream {
    pub(crate) fn new(response: reqwest::Response) -> Self {
        let body = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()));
        Self {
            body: Box::pin(body),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    /// Next complete event, or `None` once the body ends.
    pub(crate) async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.ready.extend(self.decoder.push(&chunk));
                    check_size(self.decoder.pending_len())?;
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_named_and_default_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: endpoint\ndata: /messages?sessionId=abc\n\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=abc");
        assert_eq!(events[1].event, "message");
        assert_eq!(events[1].data, "{\"a\":1}");
    }

    #[test]
    fn handles_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: mess").is_empty());
        assert!(decoder.push(b"age\r\ndata: hel").is_empty());
        let events = decoder.push(b"lo\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".into(),
                data: "hello".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\nid: 4\ndata: line one\ndata: line two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
        assert_eq!(events[0].id.as_deref(), Some("4"));
    }

    #[test]
    fn blank_lines_without_data_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\n\nevent: ping\n\n").is_empty());
        let events = decoder.push(b"data: x\n\n");
        assert_eq!(events[0].event, "message");
    }
}
