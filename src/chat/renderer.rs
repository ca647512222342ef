//! Typewriter-style incremental reveal.
//!
//! [`IncrementalRenderer::reveal`] hands text to a sink `chunk_size`
//! characters at a time, sleeping `cadence` between chunks. It never drops
//! text: cancelling the session's fast-forward token makes the next tick
//! (woken immediately) emit everything that is left in one piece.
//!
//! At most one reveal is active per `(session, channel)`. Starting another
//! supersedes the first, which flushes its remainder on its next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::{OBSERVATION_CADENCE, OBSERVATION_CHUNK_SIZE, TEXT_CADENCE, TEXT_CHUNK_SIZE};

use super::{ContentChannel, SessionId};

/// Chunking and cadence of one reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealOptions {
    /// Characters per tick; `0` reveals everything at once.
    pub chunk_size: usize,
    /// Pause between ticks.
    pub cadence: Duration,
}

impl RevealOptions {
    /// Reveal everything in a single tick.
    pub const INSTANT: Self = Self {
        chunk_size: 0,
        cadence: Duration::ZERO,
    };

    /// Options with the given chunk size and cadence.
    #[must_use]
    pub fn new(chunk_size: usize, cadence: Duration) -> Self {
        Self {
            chunk_size,
            cadence,
        }
    }
}

/// Which options each content channel reveals with.
///
/// Observations go faster than reasoning and answers; trade commands appear
/// at once so a partial order never sits on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPolicy {
    /// Reasoning text.
    pub thought: RevealOptions,
    /// Tool output.
    pub observation: RevealOptions,
    /// User-facing answer and error text.
    pub final_answer: RevealOptions,
    /// Trade command text.
    pub trade_command: RevealOptions,
}

impl Default for RenderPolicy {
    fn default() -> Self {
        let text = RevealOptions::new(TEXT_CHUNK_SIZE, TEXT_CADENCE);
        Self {
            thought: text,
            observation: RevealOptions::new(OBSERVATION_CHUNK_SIZE, OBSERVATION_CADENCE),
            final_answer: text,
            trade_command: RevealOptions::INSTANT,
        }
    }
}

impl RenderPolicy {
    /// Policy revealing every channel instantly.
    #[must_use]
    pub fn instant() -> Self {
        Self {
            thought: RevealOptions::INSTANT,
            observation: RevealOptions::INSTANT,
            final_answer: RevealOptions::INSTANT,
            trade_command: RevealOptions::INSTANT,
        }
    }

    /// Options for `channel`.
    #[must_use]
    pub fn options_for(&self, channel: ContentChannel) -> RevealOptions {
        match channel {
            ContentChannel::Thought => self.thought,
            ContentChannel::Observation => self.observation,
            ContentChannel::FinalAnswer => self.final_answer,
            ContentChannel::TradeCommand => self.trade_command,
        }
    }
}

/// Progress of one reveal. Pure state; the renderer supplies the timing.
#[derive(Debug, Clone)]
pub struct RenderTask {
    session_id: SessionId,
    channel: ContentChannel,
    full_text: String,
    /// Byte offset of the revealed prefix (always on a char boundary).
    revealed_len: usize,
    chunk_size: usize,
    cadence: Duration,
    cancelled: bool,
}

impl RenderTask {
    /// Start revealing `text` from the beginning.
    pub fn new(
        session_id: SessionId,
        channel: ContentChannel,
        text: impl Into<String>,
        options: RevealOptions,
    ) -> Self {
        Self {
            session_id,
            channel,
            full_text: text.into(),
            revealed_len: 0,
            chunk_size: options.chunk_size,
            cadence: options.cadence,
            cancelled: false,
        }
    }

    /// Next piece to show, or `None` when everything is revealed.
    ///
    /// After [`Self::cancel`] the piece is the whole remainder.
    pub fn next_chunk(&mut self) -> Option<&str> {
        if self.is_complete() {
            return None;
        }
        let start = self.revealed_len;
        let rest = &self.full_text[start..];
        let end = if self.cancelled || self.chunk_size == 0 {
            self.full_text.len()
        } else {
            rest.char_indices()
                .nth(self.chunk_size)
                .map_or(self.full_text.len(), |(idx, _)| start + idx)
        };
        self.revealed_len = end;
        Some(&self.full_text[start..end])
    }

    /// Collapse the cadence: the next chunk is everything left.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Whether [`Self::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether the whole text has been handed out.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.revealed_len >= self.full_text.len()
    }

    /// Text revealed so far.
    #[must_use]
    pub fn revealed(&self) -> &str {
        &self.full_text[..self.revealed_len]
    }

    /// Session the task belongs to.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Channel the task reveals into.
    #[must_use]
    pub fn channel(&self) -> ContentChannel {
        self.channel
    }

    /// Pause between ticks.
    #[must_use]
    pub fn cadence(&self) -> Duration {
        self.cadence
    }
}

/// How a reveal ended. In every case the sink received the full text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Revealed at the normal cadence.
    Completed,
    /// The fast-forward token collapsed the rest into one chunk.
    FastForwarded,
    /// A newer reveal for the same session and channel took over.
    Superseded,
}

/// Drives [`RenderTask`]s and enforces one active reveal per `(session, channel)`.
#[derive(Debug, Default)]
pub struct IncrementalRenderer {
    active: Mutex<HashMap<(SessionId, ContentChannel), u64>>,
    generation: AtomicU64,
}

impl IncrementalRenderer {
    /// New renderer with no active reveals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reveal `text` into `sink`, yielding between chunks.
    pub async fn reveal<F>(
        &self,
        session_id: &SessionId,
        channel: ContentChannel,
        text: &str,
        options: RevealOptions,
        fast_forward: &CancellationToken,
        mut sink: F,
    ) -> RenderOutcome
    where
        F: FnMut(&str),
    {
        let key = (session_id.clone(), channel);
        let generation = self.begin(&key);
        let mut task = RenderTask::new(session_id.clone(), channel, text, options);

        let outcome = loop {
            let superseded = !self.is_current(&key, generation);
            if superseded || fast_forward.is_cancelled() {
                task.cancel();
            }
            let collapsing = task.is_cancelled();

            match task.next_chunk() {
                Some(chunk) => sink(chunk),
                None => break RenderOutcome::Completed,
            }

            if collapsing {
                break if superseded {
                    RenderOutcome::Superseded
                } else {
                    RenderOutcome::FastForwarded
                };
            }
            if task.is_complete() {
                break RenderOutcome::Completed;
            }

            if task.cadence().is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    () = tokio::time::sleep(task.cadence()) => {}
                    () = fast_forward.cancelled() => {}
                }
            }
        };

        self.end(&key, generation);
        outcome
    }

    /// Number of reveals in flight.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn begin(&self, key: &(SessionId, ContentChannel)) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), generation);
        if previous.is_some() {
            log::debug!("[Renderer] {} {:?}: superseding active reveal", key.0, key.1);
        }
        generation
    }

    fn is_current(&self, key: &(SessionId, ContentChannel), generation: u64) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            == Some(&generation)
    }

    fn end(&self, key: &(SessionId, ContentChannel), generation: u64) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(key) == Some(&generation) {
            active.remove(key);
        }
    }
}
