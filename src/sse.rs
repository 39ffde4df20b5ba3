//! Server-Sent Events framing: record emission and incremental parsing.
//!
//! This module implements the subset of the W3C EventSource wire format the GraphQL
//! transport uses on both sides of the connection. The server encodes protocol messages
//! into `event:`/`data:` records terminated by a blank line and emits `:` comment lines
//! as keep-alives; the client feeds raw response chunks into [`SseParser`], which
//! reassembles complete records regardless of how the bytes were split in transit.
//! The `id:` and `retry:` fields are not used by this protocol and are skipped.
//!
//! # Examples
//!
//! ```rust
//! use graphql_sse::sse::{SseFrame, SseParser};
//!
//! let frame = SseFrame::new("next", r#"{"payload":{"data":null}}"#);
//! let wire = frame.to_bytes();
//!
//! let mut parser = SseParser::new();
//! let records = parser.feed(&wire);
//! assert_eq!(records[0].event, "next");
//! ```

use bytes::{Bytes, BytesMut};

/// Event name line prefix.
const EVENT_PREFIX: &str = "event";

/// Data line prefix.
const DATA_PREFIX: &str = "data";

/// Keep-alive record: a single comment line.
///
/// Comment lines begin with `:` and are ignored by every receiver, which makes them
/// suitable for defeating intermediary idle timeouts without disturbing the protocol.
pub const KEEP_ALIVE: &[u8] = b":\n\n";

/// A single SSE record: an event name and its data payload.
///
/// On the wire a frame becomes `event: <name>\n` followed by one `data: <line>\n` per
/// line of the payload and a terminating blank line. The transport serializes payloads
/// as single-line JSON, so one `data:` line is the common case; the parser still joins
/// multiple `data:` lines with `\n` per the SSE specification.
///
/// # Examples
///
/// ```rust
/// use graphql_sse::sse::SseFrame;
///
/// let frame = SseFrame::new("complete", "{}");
/// assert_eq!(&frame.to_bytes()[..], b"event: complete\ndata: {}\n\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name carried in the `event:` field.
    pub event: String,
    /// Payload carried in the `data:` field(s).
    pub data: String,
}

impl SseFrame {
    /// Creates a frame from an event name and payload.
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Encodes the frame into its wire representation.
    ///
    /// Payloads containing embedded newlines are split across multiple `data:` lines,
    /// which the receiving parser joins back together.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.event.len() + self.data.len() + 16);
        buf.extend_from_slice(b"event: ");
        buf.extend_from_slice(self.event.as_bytes());
        buf.extend_from_slice(b"\n");
        for line in self.data.split('\n') {
            buf.extend_from_slice(b"data: ");
            buf.extend_from_slice(line.as_bytes());
            buf.extend_from_slice(b"\n");
        }
        buf.extend_from_slice(b"\n");
        buf.freeze()
    }
}

/// Incremental SSE parser.
///
/// Bytes are buffered until a full line is available; complete records are returned
/// from [`feed`](SseParser::feed) as they terminate. The parser tolerates records
/// split at arbitrary read boundaries, CRLF line endings, comment lines and unknown
/// fields.
///
/// # Examples
///
/// ```rust
/// use graphql_sse::sse::SseParser;
///
/// let mut parser = SseParser::new();
/// assert!(parser.feed(b"event: next\nda").is_empty());
/// let records = parser.feed(b"ta: {}\n\n");
/// assert_eq!(records[0].data, "{}");
/// ```
#[derive(Debug, Default)]
pub struct SseParser {
    buf: BytesMut,
    event: Option<String>,
    data: Option<String>,
}

impl SseParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of bytes and returns every record completed by it.
    ///
    /// Partial trailing lines stay buffered until a later chunk finishes them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let mut line = &line[..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    out.push(frame);
                }
                continue;
            }
            if line[0] == b':' {
                continue;
            }

            let line = String::from_utf8_lossy(line);
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            match field {
                EVENT_PREFIX => self.event = Some(value.to_string()),
                DATA_PREFIX => match &mut self.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_string()),
                },
                // id, retry and anything else are not part of this protocol
                _ => {}
            }
        }
        out
    }

    /// Emits the pending record, if any, and resets the field state.
    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data.is_none() {
            return None;
        }
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        let data = self.data.take().unwrap_or_default();
        Some(SseFrame { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = SseFrame::new("next", r#"{"payload":{"data":{"hello":"world"}}}"#);
        let mut parser = SseParser::new();
        let records = parser.feed(&frame.to_bytes());
        assert_eq!(records, vec![frame]);
    }

    #[test]
    fn parses_records_split_across_reads() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: ne").is_empty());
        assert!(parser.feed(b"xt\ndata: {\"a\"").is_empty());
        let records = parser.feed(b":1}\n\nevent: complete\ndata: {}\n\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], SseFrame::new("next", "{\"a\":1}"));
        assert_eq!(records[1], SseFrame::new("complete", "{}"));
    }

    #[test]
    fn joins_multiple_data_lines() {
        let mut parser = SseParser::new();
        let records = parser.feed(b"event: next\ndata: one\ndata: two\n\n");
        assert_eq!(records[0].data, "one\ntwo");
    }

    #[test]
    fn multiline_payload_survives_encoding() {
        let frame = SseFrame::new("next", "one\ntwo");
        let mut parser = SseParser::new();
        let records = parser.feed(&frame.to_bytes());
        assert_eq!(records, vec![frame]);
    }

    #[test]
    fn ignores_comments_and_unknown_fields() {
        let mut parser = SseParser::new();
        let records = parser.feed(b": keep-alive\n\nid: 7\nretry: 100\nevent: next\ndata: {}\n\n");
        assert_eq!(records, vec![SseFrame::new("next", "{}")]);
    }

    #[test]
    fn bare_keep_alive_produces_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed(KEEP_ALIVE).is_empty());
    }

    #[test]
    fn defaults_event_name_to_message() {
        let mut parser = SseParser::new();
        let records = parser.feed(b"data: hi\n\n");
        assert_eq!(records[0].event, "message");
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let mut parser = SseParser::new();
        let records = parser.feed(b"event: next\r\ndata: {}\r\n\r\n");
        assert_eq!(records, vec![SseFrame::new("next", "{}")]);
    }
}
