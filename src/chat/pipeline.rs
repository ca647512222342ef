//! Wires one chat turn end to end.
//!
//! The controller pushes events into the [`OrderedQueue`]. Each queued task
//! runs a `TurnProcessor` step: reveal the event's text into the session
//! store, or finalize on a terminal event. Every turn finalizes exactly once,
//! whether it completed, failed or was aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::constants::{DELIVERY_QUEUE_CAPACITY, ERROR_GRACE_DELAY};

use super::accumulator::{SessionStore, SessionUpdate, ThreadStore};
use super::event::{StreamEvent, StreamEventKind};
use super::queue::OrderedQueue;
use super::renderer::{IncrementalRenderer, RenderPolicy, RevealOptions};
use super::session::{ChatRequest, EventSink, StreamSessionController, TurnOutcome};
use super::{ContentChannel, SessionId};

/// Tuning for a [`ChatPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Reveal options per content channel.
    pub render: RenderPolicy,
    /// Pause between rendering an error and finalizing.
    pub error_grace: Duration,
    /// Events the queue holds before the stream waits.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            render: RenderPolicy::default(),
            error_grace: ERROR_GRACE_DELAY,
            queue_capacity: DELIVERY_QUEUE_CAPACITY,
        }
    }
}

/// Controls for one in-flight turn.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    session_id: SessionId,
    cancel: CancellationToken,
    fast_forward: CancellationToken,
}

impl TurnHandle {
    /// Session this turn writes into.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Show everything received so far (and anything still to come) at once.
    pub fn fast_forward(&self) {
        self.fast_forward.cancel();
    }

    /// Stop the stream, reveal what already arrived and finalize the partial turn.
    pub fn abort(&self) {
        self.fast_forward.cancel();
        self.cancel.cancel();
    }

    /// Whether [`Self::abort`] was called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Applies queued events to the session store.
#[derive(Debug)]
struct TurnProcessor {
    renderer: IncrementalRenderer,
    store: Arc<SessionStore>,
    policy: RenderPolicy,
    error_grace: Duration,
    fast_forward: Mutex<HashMap<SessionId, CancellationToken>>,
}

impl TurnProcessor {
    fn register(&self, session_id: &SessionId) -> CancellationToken {
        let token = CancellationToken::new();
        self.fast_forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), token.clone());
        token
    }

    fn token(&self, session_id: &SessionId) -> Option<CancellationToken> {
        self.fast_forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    async fn process(&self, event: StreamEvent) {
        let session_id = &event.session_id;
        if let Some(id) = &event.message_id {
            self.store.record_message_id(session_id, id);
        }
        let token = self.token(session_id).unwrap_or_default();

        match event.kind {
            StreamEventKind::Done => self.finalize(session_id).await,
            StreamEventKind::Error => {
                let text = match self.store.snapshot(session_id) {
                    Some(acc) if !acc.content.is_empty() => format!("\n\n{}", event.content),
                    _ => event.content.clone(),
                };
                self.reveal(
                    session_id,
                    ContentChannel::FinalAnswer,
                    &text,
                    RevealOptions::INSTANT,
                    &token,
                )
                .await;
                tokio::select! {
                    () = tokio::time::sleep(self.error_grace) => {}
                    () = token.cancelled() => {}
                }
                self.finalize(session_id).await;
            }
            kind => {
                if let Some(channel) = kind.content_channel() {
                    let options = self.policy.options_for(channel);
                    self.reveal(session_id, channel, &event.content, options, &token)
                        .await;
                }
            }
        }
    }

    async fn reveal(
        &self,
        session_id: &SessionId,
        channel: ContentChannel,
        text: &str,
        options: RevealOptions,
        token: &CancellationToken,
    ) {
        if text.is_empty() {
            return;
        }
        let outcome = self
            .renderer
            .reveal(session_id, channel, text, options, token, |chunk| {
                self.store.append(session_id, channel, chunk);
            })
            .await;
        log::trace!("[Pipeline] {} {:?}: {:?}", session_id, channel, outcome);
    }

    async fn finalize(&self, session_id: &SessionId) {
        match self.store.finalize(session_id).await {
            Ok(Some(message)) => {
                log::debug!("[Pipeline] {}: finalized as {}", session_id, message.id);
            }
            Ok(None) => {}
            Err(e) => log::error!("[Pipeline] {}: failed to persist: {:#}", session_id, e),
        }
        self.fast_forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }
}

/// Pushes controller events into the queue as processor tasks.
struct QueueSink<'a> {
    queue: &'a OrderedQueue,
    processor: &'a Arc<TurnProcessor>,
}

#[async_trait]
impl<'a> EventSink for QueueSink<'a> {
    async fn push(&mut self, event: StreamEvent) {
        let processor = Arc::clone(self.processor);
        let session_id = event.session_id.clone();
        if self
            .queue
            .push(async move { processor.process(event).await })
            .await
            .is_err()
        {
            log::warn!("[Pipeline] {}: queue closed, event dropped", session_id);
        }
    }
}

/// Stream controller, delivery queue, renderer and session store in one place.
#[derive(Debug)]
pub struct ChatPipeline {
    controller: StreamSessionController,
    queue: OrderedQueue,
    processor: Arc<TurnProcessor>,
}

impl ChatPipeline {
    /// Build a pipeline persisting into `threads`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        controller: StreamSessionController,
        threads: Arc<dyn ThreadStore>,
        config: PipelineConfig,
    ) -> Self {
        Self::with_store(controller, Arc::new(SessionStore::new(threads)), config)
    }

    /// Build a pipeline around an existing session store.
    pub fn with_store(
        controller: StreamSessionController,
        store: Arc<SessionStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            controller,
            queue: OrderedQueue::new(config.queue_capacity),
            processor: Arc::new(TurnProcessor {
                renderer: IncrementalRenderer::new(),
                store,
                policy: config.render,
                error_grace: config.error_grace,
                fast_forward: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Session store the pipeline writes into.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.processor.store
    }

    /// Follow revealed text and finalizations.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.processor.store.updates()
    }

    /// Allocate a session for `request` without sending anything yet.
    pub fn start_turn(&self, request: &ChatRequest) -> TurnHandle {
        let session_id = SessionId::generate();
        self.processor.store.open(&session_id, request.thread_id.clone());
        let fast_forward = self.processor.register(&session_id);
        TurnHandle {
            session_id,
            cancel: CancellationToken::new(),
            fast_forward,
        }
    }

    /// Stream the turn and wait until every event has been rendered.
    pub async fn run_turn(&self, handle: &TurnHandle, request: &ChatRequest) -> TurnOutcome {
        let mut sink = QueueSink {
            queue: &self.queue,
            processor: &self.processor,
        };
        let outcome = self
            .controller
            .run_turn(&handle.session_id, request, &handle.cancel, &mut sink)
            .await;

        if matches!(outcome, TurnOutcome::Cancelled) {
            handle.fast_forward.cancel();
            let processor = Arc::clone(&self.processor);
            let session_id = handle.session_id.clone();
            if self
                .queue
                .push(async move { processor.finalize(&session_id).await })
                .await
                .is_err()
            {
                log::warn!(
                    "[Pipeline] {}: queue closed before abort finalize",
                    handle.session_id
                );
            }
        }

        if self.queue.flush().await.is_err() {
            log::warn!("[Pipeline] {}: queue closed before flush", handle.session_id);
        }
        log::info!("[Pipeline] {}: turn {}", handle.session_id, outcome);
        outcome
    }

    /// Start and run a turn in one call.
    pub async fn send(&self, request: &ChatRequest) -> (SessionId, TurnOutcome) {
        let handle = self.start_turn(request);
        let outcome = self.run_turn(&handle, request).await;
        (handle.session_id, outcome)
    }

    /// Fast-forward a session by id. Returns `false` if it is not in flight.
    pub fn fast_forward(&self, session_id: &SessionId) -> bool {
        match self.processor.token(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop accepting events and wait for queued ones to finish.
    pub async fn close(&self) {
        self.queue.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::accumulator::MemoryThreadStore;
    use crate::chat::session::Credentials;

    fn pipeline(threads: &Arc<MemoryThreadStore>, config: PipelineConfig) -> ChatPipeline {
        let controller = StreamSessionController::new(
            "http://127.0.0.1:1/chat",
            Credentials {
                account_id: "a".into(),
                api_key: "k".into(),
            },
        )
        .expect("client");
        ChatPipeline::new(controller, Arc::clone(threads) as Arc<dyn ThreadStore>, config)
    }

    async fn deliver(pipeline: &ChatPipeline, events: Vec<StreamEvent>) {
        let mut sink = QueueSink {
            queue: &pipeline.queue,
            processor: &pipeline.processor,
        };
        for event in events {
            sink.push(event).await;
        }
        pipeline.queue.flush().await.expect("flush");
    }

    #[tokio::test]
    async fn test_events_accumulate_and_finalize() {
        let threads = Arc::new(MemoryThreadStore::new());
        let pipeline = pipeline(&threads, PipelineConfig::default());
        let handle = pipeline.start_turn(&ChatRequest::new("u", "t-9", "q"));
        let sid = handle.session_id().clone();

        deliver(
            &pipeline,
            vec![
                StreamEvent::new(sid.clone(), StreamEventKind::Thought, "A"),
                StreamEvent::new(sid.clone(), StreamEventKind::Observation, "B"),
                StreamEvent::new(sid.clone(), StreamEventKind::FinalAnswer, "C"),
                StreamEvent::done(sid.clone()),
            ],
        )
        .await;

        let messages = threads.messages_for(&sid);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].thought_content, "A");
        assert_eq!(messages[0].observation_content, "B");
        assert_eq!(messages[0].content, "C");
        assert_eq!(messages[0].thread_id.as_deref(), Some("t-9"));
        assert!(pipeline.store().is_completed(&sid));
        assert!(!pipeline.fast_forward(&sid), "token released on finalize");
    }

    #[tokio::test]
    async fn test_slow_first_event_still_lands_first() {
        let threads = Arc::new(MemoryThreadStore::new());
        let config = PipelineConfig {
            render: RenderPolicy {
                thought: RevealOptions::new(1, Duration::from_millis(3)),
                ..RenderPolicy::instant()
            },
            ..PipelineConfig::default()
        };
        let pipeline = pipeline(&threads, config);
        let sid = pipeline
            .start_turn(&ChatRequest::new("u", "t", "q"))
            .session_id()
            .clone();
        let mut updates = pipeline.updates();

        deliver(
            &pipeline,
            vec![
                StreamEvent::new(sid.clone(), StreamEventKind::Thought, "slow"),
                StreamEvent::new(sid.clone(), StreamEventKind::FinalAnswer, "fast"),
            ],
        )
        .await;

        let mut order = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let SessionUpdate::Delta { channel, .. } = update {
                order.push(channel);
            }
        }
        let first_answer = order
            .iter()
            .position(|c| *c == ContentChannel::FinalAnswer)
            .expect("answer revealed");
        assert!(order[..first_answer]
            .iter()
            .all(|c| *c == ContentChannel::Thought));
        assert_eq!(first_answer, 4, "every thought character before the answer");
    }

    #[tokio::test]
    async fn test_error_renders_into_content_then_finalizes() {
        let threads = Arc::new(MemoryThreadStore::new());
        let config = PipelineConfig {
            render: RenderPolicy::instant(),
            error_grace: Duration::from_millis(5),
            ..PipelineConfig::default()
        };
        let pipeline = pipeline(&threads, config);
        let sid = pipeline
            .start_turn(&ChatRequest::new("u", "t", "q"))
            .session_id()
            .clone();

        deliver(
            &pipeline,
            vec![
                StreamEvent::new(sid.clone(), StreamEventKind::FinalAnswer, "Partial"),
                StreamEvent::error(sid.clone(), "upstream timeout"),
                StreamEvent::done(sid.clone()),
            ],
        )
        .await;

        let messages = threads.messages_for(&sid);
        assert_eq!(messages.len(), 1, "late done is a no-op");
        assert_eq!(messages[0].content, "Partial\n\nupstream timeout");
    }

    #[tokio::test]
    async fn test_fast_forward_by_session_id() {
        let threads = Arc::new(MemoryThreadStore::new());
        let config = PipelineConfig {
            render: RenderPolicy {
                final_answer: RevealOptions::new(1, Duration::from_secs(30)),
                ..RenderPolicy::instant()
            },
            ..PipelineConfig::default()
        };
        let pipeline = pipeline(&threads, config);
        let sid = pipeline
            .start_turn(&ChatRequest::new("u", "t", "q"))
            .session_id()
            .clone();

        let mut sink = QueueSink {
            queue: &pipeline.queue,
            processor: &pipeline.processor,
        };
        sink.push(StreamEvent::new(sid.clone(), StreamEventKind::FinalAnswer, "long answer"))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pipeline.fast_forward(&sid));

        tokio::time::timeout(Duration::from_secs(2), pipeline.queue.flush())
            .await
            .expect("fast-forward skips the cadence")
            .expect("flush");
        assert_eq!(
            pipeline.store().snapshot(&sid).expect("live").content,
            "long answer"
        );
    }

    #[tokio::test]
    async fn test_aborted_turn_is_finalized() {
        let threads = Arc::new(MemoryThreadStore::new());
        let pipeline = pipeline(&threads, PipelineConfig::default());
        let request = ChatRequest::new("u", "t", "q");
        let handle = pipeline.start_turn(&request);
        pipeline
            .store()
            .append(handle.session_id(), ContentChannel::Thought, "half a thought");
        handle.abort();

        let outcome = pipeline.run_turn(&handle, &request).await;
        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert!(handle.is_aborted());
        assert!(pipeline.store().is_completed(handle.session_id()));
        assert_eq!(
            threads.messages_for(handle.session_id())[0].thought_content,
            "half a thought"
        );
    }
}
