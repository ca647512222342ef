//! One streaming HTTP request per chat turn.
//!
//! [`StreamSessionController::run_turn`] posts the user's query, reads the
//! `text/event-stream` body line by line and pushes each event, in arrival
//! order, into an [`EventSink`]. It always leaves the sink with a terminal
//! event (`Done` or `Error`) unless the turn was cancelled, in which case it
//! stops pushing immediately.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    ACCOUNT_HEADER, API_KEY_HEADER, MAX_STREAM_LINE_BYTES, STREAM_IDLE_TIMEOUT,
};

use super::event::{parse_line, LineBuffer, StreamEvent, StreamEventKind};
use super::{SessionId, StreamError};

/// What the user asked, and where the answer belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    /// Account user the turn runs as.
    pub user_id: String,
    /// Conversation thread the reply is appended to.
    pub thread_id: String,
    /// The user's message.
    pub query: String,
}

impl ChatRequest {
    /// New request.
    pub fn new(
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            query: query.into(),
        }
    }
}

/// Account identity sent with every stream request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Value of the account header.
    pub account_id: String,
    /// Value of the API key header.
    pub api_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("api_key", &"[redacted]")
            .finish()
    }
}

/// Receiver of a turn's events, in order.
#[async_trait]
pub trait EventSink: Send {
    /// Accept the next event. May wait (backpressure).
    async fn push(&mut self, event: StreamEvent);
}

#[async_trait]
impl EventSink for Vec<StreamEvent> {
    async fn push(&mut self, event: StreamEvent) {
        Vec::push(self, event);
    }
}

#[async_trait]
impl EventSink for mpsc::Sender<StreamEvent> {
    async fn push(&mut self, event: StreamEvent) {
        if self.send(event).await.is_err() {
            log::debug!("[ChatStream] Event receiver dropped");
        }
    }
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The server sent `done`.
    Completed,
    /// The cancel token fired; nothing was pushed after that.
    Cancelled,
    /// Transport, status or server error; an `Error` event was pushed.
    Failed(StreamError),
    /// The body ended without `done`; an `Error` event was pushed.
    ProtocolViolation,
}

impl TurnOutcome {
    /// Whether the server completed the turn.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::ProtocolViolation => write!(f, "failed: {}", StreamError::MissingDone),
        }
    }
}

/// Streams chat turns from one endpoint with one set of credentials.
#[derive(Debug, Clone)]
pub struct StreamSessionController {
    client: reqwest::Client,
    endpoint: String,
    credentials: Credentials,
    idle_timeout: Duration,
    max_line_bytes: usize,
}

impl StreamSessionController {
    /// Controller with its own HTTP client.
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, endpoint, credentials))
    }

    /// Controller sharing an existing HTTP client.
    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            credentials,
            idle_timeout: STREAM_IDLE_TIMEOUT,
            max_line_bytes: MAX_STREAM_LINE_BYTES,
        }
    }

    /// Override how long the body may stay silent.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Override the longest line the body may send without a newline.
    #[must_use]
    pub fn max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    /// Endpoint turns are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run one turn, pushing its events into `sink`.
    pub async fn run_turn(
        &self,
        session_id: &SessionId,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> TurnOutcome {
        log::info!(
            "[ChatStream] {}: posting to {} (thread {})",
            session_id,
            self.endpoint,
            request.thread_id
        );

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return cancelled(session_id),
            response = self.send(request) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return fail(session_id, e, cancel, sink).await,
        };

        let mut body = std::pin::pin!(response.bytes_stream());
        let mut lines = LineBuffer::with_limit(self.max_line_bytes);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return cancelled(session_id),
                next = tokio::time::timeout(self.idle_timeout, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return fail(session_id, StreamError::Idle(self.idle_timeout), cancel, sink).await
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return fail(session_id, StreamError::Transport(e.to_string()), cancel, sink)
                        .await
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            let complete = match lines.push(&chunk) {
                Ok(complete) => complete,
                Err(e) => return fail(session_id, e, cancel, sink).await,
            };
            for line in complete {
                if let Some(outcome) = handle_line(session_id, &line, cancel, sink).await {
                    return outcome;
                }
            }
        }

        if let Some(rest) = lines.finish() {
            if let Some(outcome) = handle_line(session_id, &rest, cancel, sink).await {
                return outcome;
            }
        }

        if cancel.is_cancelled() {
            return cancelled(session_id);
        }
        log::warn!("[ChatStream] {}: stream ended without done", session_id);
        sink.push(StreamEvent::error(
            session_id.clone(),
            StreamError::MissingDone.to_string(),
        ))
        .await;
        TurnOutcome::ProtocolViolation
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response, StreamError> {
        let form = [
            ("user_id", request.user_id.as_str()),
            ("thread_id", request.thread_id.as_str()),
            ("query", request.query.as_str()),
        ];

        let pending = self
            .client
            .post(&self.endpoint)
            .header(ACCOUNT_HEADER, &self.credentials.account_id)
            .header(API_KEY_HEADER, &self.credentials.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .form(&form)
            .send();

        let response = tokio::time::timeout(self.idle_timeout, pending)
            .await
            .map_err(|_elapsed| StreamError::Idle(self.idle_timeout))?
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Status(status.as_u16(), body.trim().to_string()));
        }
        Ok(response)
    }
}

/// Push one line's event, if any. Returns the outcome when the line ends the turn.
async fn handle_line(
    session_id: &SessionId,
    line: &str,
    cancel: &CancellationToken,
    sink: &mut dyn EventSink,
) -> Option<TurnOutcome> {
    let frame = match parse_line(line) {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(e) => {
            log::warn!("[ChatStream] {}: skipping line: {}", session_id, e);
            return None;
        }
    };

    let Some(event) = frame.into_event(session_id) else {
        log::trace!("[ChatStream] {}: heartbeat", session_id);
        return None;
    };

    // Checked before every push so an abort stops delivery at once.
    if cancel.is_cancelled() {
        return Some(cancelled(session_id));
    }

    let kind = event.kind;
    let remote_error = (kind == StreamEventKind::Error).then(|| event.content.clone());
    sink.push(event).await;

    match kind {
        StreamEventKind::Done => {
            log::info!("[ChatStream] {}: done", session_id);
            Some(TurnOutcome::Completed)
        }
        StreamEventKind::Error => {
            let message = remote_error.unwrap_or_default();
            log::warn!("[ChatStream] {}: server error: {}", session_id, message);
            Some(TurnOutcome::Failed(StreamError::Remote(message)))
        }
        _ => None,
    }
}

async fn fail(
    session_id: &SessionId,
    error: StreamError,
    cancel: &CancellationToken,
    sink: &mut dyn EventSink,
) -> TurnOutcome {
    if cancel.is_cancelled() {
        return cancelled(session_id);
    }
    log::warn!("[ChatStream] {}: {}", session_id, error);
    sink.push(StreamEvent::error(session_id.clone(), error.to_string()))
        .await;
    TurnOutcome::Failed(error)
}

fn cancelled(session_id: &SessionId) -> TurnOutcome {
    log::info!("[ChatStream] {}: cancelled", session_id);
    TurnOutcome::Cancelled
}
