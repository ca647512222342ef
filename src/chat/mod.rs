//! Streamed assistant replies with ordered, typewriter-style delivery.
//!
//! # Architecture
//!
//! ```text
//! ChatPipeline::run_turn
//!   StreamSessionController ── POST, text/event-stream ──► data: {...} lines
//!        │ StreamEvent (in arrival order, stops on cancel)
//!        ▼
//!   OrderedQueue ── one task at a time ──► TurnProcessor
//!                                             ├── IncrementalRenderer (chunk + cadence,
//!                                             │     fast-forward token per session)
//!                                             └── SessionStore (accumulate, finalize once)
//!                                                    └── ThreadStore (external collaborator)
//! ```
//!
//! The queue, not the transport, provides the ordering guarantee: an event's
//! rendering finishes before the next event is looked at.

pub mod accumulator;
pub mod event;
pub mod pipeline;
pub mod queue;
pub mod renderer;
pub mod session;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Correlation id of one chat turn.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Accumulator field a piece of text is revealed into.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentChannel {
    /// The assistant's reasoning.
    Thought,
    /// Tool output the assistant observed.
    Observation,
    /// The answer shown to the user (also where errors land).
    FinalAnswer,
    /// A proposed trade, usually JSON text.
    TradeCommand,
}

/// Errors raised by the chat stream.
#[derive(Debug)]
pub enum StreamError {
    /// Request could not be sent or the body could not be read.
    Transport(String),
    /// Server answered with a non-success status.
    Status(u16, String),
    /// A `data:` line could not be parsed.
    Malformed(String),
    /// No bytes arrived within the idle timeout.
    Idle(std::time::Duration),
    /// The server sent an `error` frame.
    Remote(String),
    /// The stream ended before a `done` frame.
    MissingDone,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Status(code, body) if body.is_empty() => write!(f, "Server returned {code}"),
            Self::Status(code, body) => write!(f, "Server returned {code}: {body}"),
            Self::Malformed(msg) => write!(f, "Malformed stream frame: {msg}"),
            Self::Idle(after) => write!(f, "Stream idle for {}s", after.as_secs()),
            Self::Remote(msg) => write!(f, "Server reported an error: {msg}"),
            Self::MissingDone => write!(f, "Stream ended before the reply completed"),
        }
    }
}

impl std::error::Error for StreamError {}

// Re-exports
pub use accumulator::{
    MemoryThreadStore, PersistedMessage, SessionAccumulator, SessionStore, SessionUpdate,
    ThreadStore,
};
pub use event::{ChatFrame, LineBuffer, StreamEvent, StreamEventKind};
pub use pipeline::{ChatPipeline, PipelineConfig, TurnHandle};
pub use queue::{OrderedQueue, QueueClosed};
pub use renderer::{IncrementalRenderer, RenderOutcome, RenderPolicy, RenderTask, RevealOptions};
pub use session::{
    ChatRequest, Credentials, EventSink, StreamSessionController, TurnOutcome,
};
