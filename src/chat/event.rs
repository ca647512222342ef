//! Chat stream events and their wire framing.
//!
//! The server answers a chat turn with `text/event-stream` lines:
//!
//! ```text
//! data: {"type":"thought","content":"Checking BTC trend"}
//! data: {"type":"observation","content":"RSI(14)=71"}
//! data: {"type":"final_answer_chunk","content":"BTC looks overbought"}
//! data: {"type":"heartbeat"}
//! data: {"type":"done","message_id":"m-42"}
//! ```
//!
//! [`LineBuffer`] reassembles lines from arbitrary body chunks and
//! [`parse_line`] turns one line into a [`ChatFrame`].

use bytes::{Buf, BytesMut};
use serde::Deserialize;
use serde_json::Value;

use crate::constants::MAX_STREAM_LINE_BYTES;

use super::{ContentChannel, SessionId, StreamError};

/// Kind of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    /// Reasoning text.
    Thought,
    /// Tool output.
    Observation,
    /// Part of the user-facing answer.
    FinalAnswer,
    /// Part of a proposed trade command.
    TradeCommand,
    /// The turn is complete.
    Done,
    /// The turn failed; `content` says why.
    Error,
}

impl StreamEventKind {
    /// Accumulator field this kind's content is revealed into.
    ///
    /// Terminal kinds return `None`; the pipeline handles them itself.
    #[must_use]
    pub fn content_channel(self) -> Option<ContentChannel> {
        match self {
            Self::Thought => Some(ContentChannel::Thought),
            Self::Observation => Some(ContentChannel::Observation),
            Self::FinalAnswer => Some(ContentChannel::FinalAnswer),
            Self::TradeCommand => Some(ContentChannel::TradeCommand),
            Self::Done | Self::Error => None,
        }
    }

    /// Whether this kind ends the turn.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One typed unit of a chat streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Turn this event belongs to.
    pub session_id: SessionId,
    /// What the content is.
    pub kind: StreamEventKind,
    /// Text payload (may be empty for `Done`).
    pub content: String,
    /// Server-issued id of the message being built, when the frame had one.
    pub message_id: Option<String>,
}

impl StreamEvent {
    /// Event without a server message id.
    pub fn new(session_id: SessionId, kind: StreamEventKind, content: impl Into<String>) -> Self {
        Self {
            session_id,
            kind,
            content: content.into(),
            message_id: None,
        }
    }

    /// Terminal error event.
    pub fn error(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, StreamEventKind::Error, content)
    }

    /// Completion event.
    #[must_use]
    pub fn done(session_id: SessionId) -> Self {
        Self::new(session_id, StreamEventKind::Done, String::new())
    }
}

/// A parsed `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatFrame {
    /// A content or terminal event.
    Event {
        /// Event kind.
        kind: StreamEventKind,
        /// Text payload.
        content: String,
        /// Server-issued message id, if any.
        message_id: Option<String>,
    },
    /// Keep-alive; proves the stream is alive and carries nothing.
    Heartbeat,
}

impl ChatFrame {
    /// Attach a session id, turning the frame into an event.
    ///
    /// Heartbeats return `None`.
    #[must_use]
    pub fn into_event(self, session_id: &SessionId) -> Option<StreamEvent> {
        match self {
            Self::Event {
                kind,
                content,
                message_id,
            } => Some(StreamEvent {
                session_id: session_id.clone(),
                kind,
                content,
                message_id,
            }),
            Self::Heartbeat => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireType {
    Thought,
    Observation,
    FinalAnswer,
    FinalAnswerChunk,
    TradeCommand,
    Done,
    Error,
    Heartbeat,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    frame_type: WireType,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default, alias = "id")]
    message_id: Option<Value>,
}

/// Text form of a JSON value: strings as-is, null as empty, others as JSON.
fn value_text(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// Parse one line of the event stream.
///
/// Blank lines, comments (`:`) and non-`data` fields yield `Ok(None)`.
///
/// # Errors
///
/// Returns `StreamError::Malformed` when a `data:` line is not a known frame.
pub fn parse_line(line: &str) -> Result<Option<ChatFrame>, StreamError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim().is_empty() {
        return Ok(None);
    }

    let frame: WireFrame = serde_json::from_str(data).map_err(|e| {
        StreamError::Malformed(format!("{e}: {}", data.chars().take(120).collect::<String>()))
    })?;

    let kind = match frame.frame_type {
        WireType::Heartbeat => return Ok(Some(ChatFrame::Heartbeat)),
        WireType::Thought => StreamEventKind::Thought,
        WireType::Observation => StreamEventKind::Observation,
        WireType::FinalAnswer | WireType::FinalAnswerChunk => StreamEventKind::FinalAnswer,
        WireType::TradeCommand => StreamEventKind::TradeCommand,
        WireType::Done => StreamEventKind::Done,
        WireType::Error => StreamEventKind::Error,
    };

    let message_id = frame
        .message_id
        .map(|v| value_text(Some(v)))
        .filter(|id| !id.is_empty());

    Ok(Some(ChatFrame::Event {
        kind,
        content: value_text(frame.content),
        message_id,
    }))
}

/// Reassembles newline-terminated lines from arbitrary byte chunks.
///
/// Works on bytes so a multi-byte character split across two chunks is
/// decoded only once the whole line is in.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_STREAM_LINE_BYTES)
    }
}

impl LineBuffer {
    /// Empty buffer accepting lines up to [`MAX_STREAM_LINE_BYTES`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty buffer accepting unterminated lines up to `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Append a chunk and return every line it completed, without terminators.
    ///
    /// # Errors
    ///
    /// [`StreamError::Malformed`] when the unterminated remainder grows past
    /// the limit. The buffer is emptied.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, StreamError> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        if self.buf.len() > self.limit {
            let pending = self.buf.len();
            self.buf.clear();
            return Err(StreamError::Malformed(format!(
                "unterminated line of {pending} bytes exceeds {} byte limit",
                self.limit
            )));
        }
        Ok(lines)
    }

    /// Take whatever unterminated text is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.advance(self.buf.len());
        Some(rest)
    }

    /// Bytes waiting for a line terminator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> (StreamEventKind, String, Option<String>) {
        match parse_line(line).expect("parses").expect("is a frame") {
            ChatFrame::Event {
                kind,
                content,
                message_id,
            } => (kind, content, message_id),
            ChatFrame::Heartbeat => panic!("unexpected heartbeat"),
        }
    }

    #[test]
    fn test_parse_each_kind() {
        let cases = [
            ("thought", StreamEventKind::Thought),
            ("observation", StreamEventKind::Observation),
            ("final_answer", StreamEventKind::FinalAnswer),
            ("final_answer_chunk", StreamEventKind::FinalAnswer),
            ("trade_command", StreamEventKind::TradeCommand),
            ("done", StreamEventKind::Done),
            ("error", StreamEventKind::Error),
        ];
        for (wire, kind) in cases {
            let line = format!(r#"data: {{"type":"{wire}","content":"x"}}"#);
            assert_eq!(event(&line).0, kind, "wire type {wire}");
        }
    }

    #[test]
    fn test_heartbeat() {
        assert_eq!(
            parse_line(r#"data: {"type":"heartbeat"}"#).expect("parses"),
            Some(ChatFrame::Heartbeat)
        );
    }

    #[test]
    fn test_non_data_lines_are_skipped() {
        for line in ["", ":keep-alive", "event: message", "id: 7", "retry: 1000", "data:", "data:   "] {
            assert_eq!(parse_line(line).expect("no error"), None, "line {line:?}");
        }
    }

    #[test]
    fn test_data_without_space_and_crlf() {
        let (kind, content, _) = event("data:{\"type\":\"thought\",\"content\":\"hi\"}\r");
        assert_eq!(kind, StreamEventKind::Thought);
        assert_eq!(content, "hi");
    }

    #[test]
    fn test_structured_content_is_kept_as_json() {
        let (kind, content, _) =
            event(r#"data: {"type":"trade_command","content":{"side":"buy","qty":1}}"#);
        assert_eq!(kind, StreamEventKind::TradeCommand);
        let parsed: Value = serde_json::from_str(&content).expect("json content");
        assert_eq!(parsed["side"], "buy");
    }

    #[test]
    fn test_message_id_from_either_key() {
        assert_eq!(
            event(r#"data: {"type":"done","message_id":"m-1"}"#).2,
            Some("m-1".to_string())
        );
        assert_eq!(
            event(r#"data: {"type":"done","id":77}"#).2,
            Some("77".to_string())
        );
        assert_eq!(event(r#"data: {"type":"done"}"#).1, "");
    }

    #[test]
    fn test_malformed_data_is_error() {
        assert!(matches!(
            parse_line("data: {not json"),
            Err(StreamError::Malformed(_))
        ));
        assert!(matches!(
            parse_line(r#"data: {"type":"mystery","content":"?"}"#),
            Err(StreamError::Malformed(_))
        ));
    }

    #[test]
    fn test_heartbeat_has_no_event() {
        assert_eq!(ChatFrame::Heartbeat.into_event(&"s".into()), None);
    }

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: {\"type\":").expect("push").is_empty());
        let lines = buffer
            .push(b"\"done\"}\r\ndata: next\n\npartial")
            .expect("push");
        assert_eq!(
            lines,
            vec![
                "data: {\"type\":\"done\"}".to_string(),
                "data: next".to_string(),
                String::new(),
            ]
        );
        assert_eq!(buffer.pending(), "partial".len());
        assert_eq!(buffer.finish(), Some("partial".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_keeps_split_utf8_intact() {
        let text = "data: 价格\n".as_bytes();
        let (head, tail) = text.split_at(7); // inside the first CJK character
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(head).expect("push").is_empty());
        assert_eq!(buffer.push(tail).expect("push"), vec!["data: 价格".to_string()]);
    }

    #[test]
    fn test_line_buffer_rejects_endless_line() {
        let mut buffer = LineBuffer::with_limit(16);
        assert!(buffer.push(b"data: 0123456789").expect("at limit").is_empty());
        assert!(matches!(buffer.push(b"x"), Err(StreamError::Malformed(_))));
        assert_eq!(buffer.pending(), 0);

        // Terminated lines of any length still pass.
        let long = format!("data: {}\n", "y".repeat(64));
        assert_eq!(buffer.push(long.as_bytes()).expect("complete line").len(), 1);
    }

    #[test]
    fn test_kind_channels() {
        assert_eq!(
            StreamEventKind::Observation.content_channel(),
            Some(ContentChannel::Observation)
        );
        assert_eq!(StreamEventKind::Done.content_channel(), None);
        assert!(StreamEventKind::Error.is_terminal());
        assert!(!StreamEventKind::Thought.is_terminal());
    }
}
