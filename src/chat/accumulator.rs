//! Per-session accumulation and exactly-once finalization.
//!
//! Revealed text is appended to a [`SessionAccumulator`] keyed by session.
//! `finalize` turns it into a [`PersistedMessage`], hands that to the
//! [`ThreadStore`] and remembers the session as completed, so a repeated
//! `done` cannot persist the turn twice. The most recent
//! [`COMPLETED_SESSION_CAPACITY`] completed sessions are remembered, each
//! with its final accumulator.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::constants::{COMPLETED_SESSION_CAPACITY, SESSION_UPDATE_CAPACITY};

use super::{ContentChannel, SessionId};

/// Partial content of one in-flight turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionAccumulator {
    /// Reasoning text.
    pub thought_content: String,
    /// Tool output.
    pub observation_content: String,
    /// Final answer (and error text).
    pub content: String,
    /// Proposed trade command.
    pub trade_command: String,
    /// User feedback attached before finalize.
    pub feedback: Option<String>,
    /// Server-issued message id, if one was seen.
    pub message_id: Option<String>,
    /// `false` while in flight; `true` on the copy kept by finalize.
    pub completed: bool,
}

impl SessionAccumulator {
    /// Text accumulated for `channel`.
    #[must_use]
    pub fn field(&self, channel: ContentChannel) -> &str {
        match channel {
            ContentChannel::Thought => &self.thought_content,
            ContentChannel::Observation => &self.observation_content,
            ContentChannel::FinalAnswer => &self.content,
            ContentChannel::TradeCommand => &self.trade_command,
        }
    }

    fn field_mut(&mut self, channel: ContentChannel) -> &mut String {
        match channel {
            ContentChannel::Thought => &mut self.thought_content,
            ContentChannel::Observation => &mut self.observation_content,
            ContentChannel::FinalAnswer => &mut self.content,
            ContentChannel::TradeCommand => &mut self.trade_command,
        }
    }
}

/// A finalized assistant message as handed to the [`ThreadStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMessage {
    /// Server id, or a generated UUID when the server never sent one.
    pub id: String,
    /// Turn that produced the message.
    pub session_id: SessionId,
    /// Thread the turn belongs to, when known.
    pub thread_id: Option<String>,
    /// Reasoning text.
    pub thought_content: String,
    /// Tool output.
    pub observation_content: String,
    /// Final answer.
    pub content: String,
    /// Proposed trade command.
    pub trade_command: String,
    /// User feedback, if any was given.
    pub feedback: Option<String>,
    /// Finalize time, epoch milliseconds.
    pub created_at: i64,
}

/// Persisted-thread collaborator.
#[async_trait]
pub trait ThreadStore: Send + Sync + fmt::Debug {
    /// Append a finalized message to its thread.
    async fn append_message(&self, message: PersistedMessage) -> Result<()>;

    /// Ask the store to reload a thread's message list.
    async fn refresh_thread(&self, thread_id: &str) -> Result<()>;
}

/// In-process [`ThreadStore`].
#[derive(Debug, Default)]
pub struct MemoryThreadStore {
    messages: Mutex<Vec<PersistedMessage>>,
    refreshes: Mutex<Vec<String>>,
}

impl MemoryThreadStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message appended so far, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<PersistedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages appended for `session_id`.
    #[must_use]
    pub fn messages_for(&self, session_id: &SessionId) -> Vec<PersistedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| &m.session_id == session_id)
            .collect()
    }

    /// Thread ids refreshed so far, in call order.
    #[must_use]
    pub fn refreshes(&self) -> Vec<String> {
        self.refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn append_message(&self, message: PersistedMessage) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    async fn refresh_thread(&self, thread_id: &str) -> Result<()> {
        self.refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(thread_id.to_string());
        Ok(())
    }
}

/// Change notification for live readers of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Text was appended to one field.
    Delta {
        /// Session that changed.
        session_id: SessionId,
        /// Field the text went into.
        channel: ContentChannel,
        /// Appended text.
        text: String,
    },
    /// The session was finalized and persisted under `message_id`.
    Finalized {
        /// Session that completed.
        session_id: SessionId,
        /// Id of the persisted message.
        message_id: String,
    },
}

#[derive(Debug, Default)]
struct LiveSession {
    thread_id: Option<String>,
    acc: SessionAccumulator,
}

/// Recently finalized sessions, oldest evicted first.
#[derive(Debug, Default)]
struct Completed {
    order: VecDeque<SessionId>,
    finals: HashMap<SessionId, SessionAccumulator>,
}

impl Completed {
    fn contains(&self, session_id: &SessionId) -> bool {
        self.finals.contains_key(session_id)
    }

    fn insert(&mut self, session_id: SessionId, acc: SessionAccumulator, capacity: usize) {
        if self.finals.insert(session_id.clone(), acc).is_none() {
            self.order.push_back(session_id);
        }
        while self.order.len() > capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                log::trace!("[Session] {}: forgotten", oldest);
                self.finals.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Default)]
struct Sessions {
    live: HashMap<SessionId, LiveSession>,
    completed: Completed,
}

/// Accumulators of every in-flight session plus the completed-set.
pub struct SessionStore {
    threads: Arc<dyn ThreadStore>,
    clock: Arc<dyn Clock>,
    sessions: Mutex<Sessions>,
    updates: broadcast::Sender<SessionUpdate>,
    retention: usize,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SessionStore")
            .field("live", &sessions.live.len())
            .field("completed", &sessions.completed.len())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Store persisting into `threads`, timestamped by the system clock.
    pub fn new(threads: Arc<dyn ThreadStore>) -> Self {
        Self::with_clock(threads, Arc::new(SystemClock))
    }

    /// Store with an explicit clock.
    pub fn with_clock(threads: Arc<dyn ThreadStore>, clock: Arc<dyn Clock>) -> Self {
        let (updates, _) = broadcast::channel(SESSION_UPDATE_CAPACITY);
        Self {
            threads,
            clock,
            sessions: Mutex::new(Sessions::default()),
            updates,
            retention: COMPLETED_SESSION_CAPACITY,
        }
    }

    /// Remember at most `sessions` completed sessions (at least one).
    #[must_use]
    pub fn retain_completed(mut self, sessions: usize) -> Self {
        self.retention = sessions.max(1);
        self
    }

    /// Subscribe to deltas and finalizations of every session.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Associate `session_id` with a thread before its first event.
    pub fn open(&self, session_id: &SessionId, thread_id: impl Into<String>) {
        let mut sessions = self.lock();
        if sessions.completed.contains(session_id) {
            log::debug!("[Session] {}: open after completion ignored", session_id);
            return;
        }
        sessions.live.entry(session_id.clone()).or_default().thread_id = Some(thread_id.into());
    }

    /// Append revealed text to one field, creating the accumulator on first use.
    ///
    /// Returns `false` when the session is already completed.
    pub fn append(&self, session_id: &SessionId, channel: ContentChannel, text: &str) -> bool {
        {
            let mut sessions = self.lock();
            if sessions.completed.contains(session_id) {
                log::debug!(
                    "[Session] {}: dropping {} bytes after completion",
                    session_id,
                    text.len()
                );
                return false;
            }
            sessions
                .live
                .entry(session_id.clone())
                .or_default()
                .acc
                .field_mut(channel)
                .push_str(text);
        }

        let _ = self.updates.send(SessionUpdate::Delta {
            session_id: session_id.clone(),
            channel,
            text: text.to_string(),
        });
        true
    }

    /// Remember the server-issued id of the message being built.
    pub fn record_message_id(&self, session_id: &SessionId, message_id: &str) {
        let mut sessions = self.lock();
        if sessions.completed.contains(session_id) {
            return;
        }
        sessions.live.entry(session_id.clone()).or_default().acc.message_id =
            Some(message_id.to_string());
    }

    /// Attach user feedback. Returns `false` when the session is already completed.
    pub fn set_feedback(&self, session_id: &SessionId, feedback: impl Into<String>) -> bool {
        let mut sessions = self.lock();
        if sessions.completed.contains(session_id) {
            return false;
        }
        sessions.live.entry(session_id.clone()).or_default().acc.feedback = Some(feedback.into());
        true
    }

    /// Copy of the live accumulator, if the session is in flight.
    #[must_use]
    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionAccumulator> {
        self.lock().live.get(session_id).map(|s| s.acc.clone())
    }

    /// Final accumulator of a remembered completed session, with `completed` set.
    #[must_use]
    pub fn completed(&self, session_id: &SessionId) -> Option<SessionAccumulator> {
        self.lock().completed.finals.get(session_id).cloned()
    }

    /// Whether `finalize` already ran for `session_id`.
    ///
    /// Only the most recent completed sessions are remembered.
    #[must_use]
    pub fn is_completed(&self, session_id: &SessionId) -> bool {
        self.lock().completed.contains(session_id)
    }

    /// Number of sessions with a live accumulator.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.lock().live.len()
    }

    /// Persist the session and mark it completed.
    ///
    /// Returns the persisted message, or `None` when the session was already
    /// completed or was never opened and received no content.
    ///
    /// # Errors
    ///
    /// Returns the thread store's error when appending fails. The session
    /// stays completed either way.
    pub async fn finalize(&self, session_id: &SessionId) -> Result<Option<PersistedMessage>> {
        let live = {
            let mut sessions = self.lock();
            if sessions.completed.contains(session_id) {
                log::debug!("[Session] {}: already finalized", session_id);
                return Ok(None);
            }
            let live = sessions.live.remove(session_id);
            let mut last = live.as_ref().map(|s| s.acc.clone()).unwrap_or_default();
            last.completed = true;
            sessions
                .completed
                .insert(session_id.clone(), last, self.retention);
            live
        };

        let Some(LiveSession { thread_id, acc }) = live else {
            log::debug!("[Session] {}: finalized with no content", session_id);
            return Ok(None);
        };

        let message = PersistedMessage {
            id: acc
                .message_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            session_id: session_id.clone(),
            thread_id,
            thought_content: acc.thought_content,
            observation_content: acc.observation_content,
            content: acc.content,
            trade_command: acc.trade_command,
            feedback: acc.feedback,
            created_at: self.clock.now_ms(),
        };

        self.threads.append_message(message.clone()).await?;
        log::info!("[Session] {}: persisted message {}", session_id, message.id);

        if let Some(thread_id) = &message.thread_id {
            if let Err(e) = self.threads.refresh_thread(thread_id).await {
                log::warn!("[Session] {}: thread refresh failed: {:#}", session_id, e);
            }
        }

        let _ = self.updates.send(SessionUpdate::Finalized {
            session_id: session_id.clone(),
            message_id: message.id.clone(),
        });
        Ok(Some(message))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<MemoryThreadStore>, SessionStore) {
        let threads = Arc::new(MemoryThreadStore::new());
        let store = SessionStore::with_clock(
            Arc::clone(&threads) as Arc<dyn ThreadStore>,
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );
        (threads, store)
    }

    #[tokio::test]
    async fn test_each_channel_lands_in_its_field() {
        let (threads, store) = store();
        let session = SessionId::from("s-c");
        store.open(&session, "t-1");

        store.append(&session, ContentChannel::Thought, "A");
        store.append(&session, ContentChannel::Observation, "B");
        store.append(&session, ContentChannel::FinalAnswer, "C");

        let live = store.snapshot(&session).expect("live");
        assert_eq!(live.thought_content, "A");
        assert_eq!(live.observation_content, "B");
        assert_eq!(live.content, "C");
        assert!(!live.completed);

        let message = store.finalize(&session).await.expect("persist").expect("message");
        assert_eq!(message.thought_content, "A");
        assert_eq!(message.observation_content, "B");
        assert_eq!(message.content, "C");
        assert_eq!(message.thread_id.as_deref(), Some("t-1"));
        assert_eq!(message.created_at, 1_700_000_000_000);
        assert!(store.is_completed(&session));
        assert!(store.snapshot(&session).is_none());
        assert_eq!(threads.refreshes(), vec!["t-1".to_string()]);

        let last = store.completed(&session).expect("remembered");
        assert!(last.completed);
        assert_eq!(last.content, "C");
    }

    #[tokio::test]
    async fn test_double_finalize_persists_once() {
        let (threads, store) = store();
        let session = SessionId::from("s-e");
        store.append(&session, ContentChannel::FinalAnswer, "answer");

        assert!(store.finalize(&session).await.expect("first").is_some());
        assert!(store.finalize(&session).await.expect("second").is_none());
        assert_eq!(threads.messages_for(&session).len(), 1);
    }

    #[tokio::test]
    async fn test_appends_accumulate_in_call_order() {
        let (_threads, store) = store();
        let session = SessionId::from("s-fifo");
        for piece in ["Hel", "lo", " ", "wor", "ld"] {
            store.append(&session, ContentChannel::FinalAnswer, piece);
        }
        assert_eq!(store.snapshot(&session).expect("live").content, "Hello world");
    }

    #[tokio::test]
    async fn test_appends_after_completion_are_ignored() {
        let (threads, store) = store();
        let session = SessionId::from("s-late");
        store.append(&session, ContentChannel::Thought, "early");
        store.finalize(&session).await.expect("persist");

        assert!(!store.append(&session, ContentChannel::Thought, "late"));
        assert!(!store.set_feedback(&session, "too late"));
        assert!(store.snapshot(&session).is_none());
        assert_eq!(threads.messages()[0].thought_content, "early");
    }

    #[tokio::test]
    async fn test_server_id_and_feedback_are_persisted() {
        let (threads, store) = store();
        let session = SessionId::from("s-id");
        store.append(&session, ContentChannel::FinalAnswer, "x");
        store.record_message_id(&session, "m-42");
        assert!(store.set_feedback(&session, "helpful"));

        store.finalize(&session).await.expect("persist");
        let message = &threads.messages()[0];
        assert_eq!(message.id, "m-42");
        assert_eq!(message.feedback.as_deref(), Some("helpful"));
    }

    #[tokio::test]
    async fn test_generated_id_when_server_sent_none() {
        let (_threads, store) = store();
        let session = SessionId::from("s-gen");
        store.append(&session, ContentChannel::FinalAnswer, "x");
        let message = store.finalize(&session).await.expect("persist").expect("message");
        assert!(uuid::Uuid::parse_str(&message.id).is_ok());
    }

    #[tokio::test]
    async fn test_empty_session_finalizes_without_persisting() {
        let (threads, store) = store();
        let session = SessionId::from("s-empty");
        assert!(store.finalize(&session).await.expect("ok").is_none());
        assert!(store.is_completed(&session));
        assert!(store.completed(&session).expect("remembered").completed);
        assert!(threads.messages().is_empty());
    }

    #[tokio::test]
    async fn test_completed_sessions_are_bounded() {
        let (threads, store) = store();
        let store = store.retain_completed(2);
        let ids: Vec<SessionId> = ["s-1", "s-2", "s-3"].into_iter().map(SessionId::from).collect();
        for id in &ids {
            store.append(id, ContentChannel::FinalAnswer, "x");
            store.finalize(id).await.expect("persist");
        }

        assert!(!store.is_completed(&ids[0]), "oldest evicted");
        assert!(store.completed(&ids[0]).is_none());
        assert!(store.is_completed(&ids[1]));
        assert!(store.is_completed(&ids[2]));
        assert!(store.finalize(&ids[2]).await.expect("ok").is_none());
        assert_eq!(threads.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let (_threads, store) = store();
        let mut updates = store.updates();
        let session = SessionId::from("s-up");
        store.append(&session, ContentChannel::Observation, "RSI=71");
        store.record_message_id(&session, "m-1");
        store.finalize(&session).await.expect("persist");

        assert_eq!(
            updates.recv().await.expect("delta"),
            SessionUpdate::Delta {
                session_id: session.clone(),
                channel: ContentChannel::Observation,
                text: "RSI=71".into(),
            }
        );
        assert_eq!(
            updates.recv().await.expect("finalized"),
            SessionUpdate::Finalized {
                session_id: session,
                message_id: "m-1".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (threads, store) = store();
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        store.append(&a, ContentChannel::FinalAnswer, "for a");
        store.append(&b, ContentChannel::FinalAnswer, "for b");
        store.finalize(&a).await.expect("persist");

        assert_eq!(store.snapshot(&b).expect("b live").content, "for b");
        assert_eq!(store.live_sessions(), 1);
        assert_eq!(threads.messages().len(), 1);
    }
}
