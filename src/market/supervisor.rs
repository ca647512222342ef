//! Connection supervisor: one self-healing socket per channel key.
//!
//! [`ConnectionSupervisor::connect`] spawns a background task that owns the
//! WebSocket for its whole life: connect, decode, answer heartbeats, detect
//! silence, reconnect. The handle talks to the task over a command channel,
//! so every socket write happens on the task and frames are processed in
//! arrival order on a single decode path.
//!
//! # State machine
//!
//! ```text
//! Unconnected ─► Connecting ─► Open ─► Closed ─(RECONNECT_DELAY or visible)─► Connecting …
//!                     │                   ▲
//!                     └── connect error ──┘
//! disconnect(): any ─► Closing ─► Closed (no further attempts)
//! ```
//!
//! # Failure handling
//!
//! Transport errors, server closes and watchdog staleness all take the same
//! path: the socket is dropped, state goes `Closed`, and a single reconnect
//! is scheduled while `need_reconnect` holds. Nothing is buffered across a
//! reconnect; the desired subscription set is replayed on every `Open`.
//!
//! # Replacement
//!
//! A supervisor built with [`ConnectionSupervisor::replacing`] claims the key
//! in the [`StatusPublisher`] at once, then waits for its predecessor's task
//! to exit before opening its own socket. A key never has two live sockets,
//! and the predecessor's final `Closed` cannot land on top of the new `Open`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::constants::{
    CONNECT_TIMEOUT, HEARTBEAT_TICK_INTERVAL, MARKET_BROADCAST_CAPACITY, RECONNECT_DELAY,
    STALE_TIMEOUT,
};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

use super::frame::{decode, Frame, MarketData, Message};
use super::status::StatusPublisher;
use super::subscription::SubscriptionManager;
use super::watchdog::{Liveness, Watchdog};
use super::{ChannelKey, ConnectionState};

/// How long a close handshake may take before the socket is just dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for one supervised connection.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Logical channel this socket serves.
    pub key: ChannelKey,
    /// WebSocket endpoint (`http(s)://` is rewritten to `ws(s)://`).
    pub url: String,
    /// Extra handshake headers, e.g. credentials for private feeds.
    pub headers: Vec<(String, String)>,
    /// Fixed delay before reconnecting after a drop.
    pub reconnect_delay: Duration,
    /// How often the watchdog is ticked.
    pub heartbeat_interval: Duration,
    /// Silence after which the socket is considered dead.
    pub stale_timeout: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Time source for heartbeat bookkeeping.
    pub clock: Arc<dyn Clock>,
}

impl SupervisorConfig {
    /// Config with the default timing for `key` at `url`.
    pub fn new(key: impl Into<ChannelKey>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            headers: Vec::new(),
            reconnect_delay: RECONNECT_DELAY,
            heartbeat_interval: HEARTBEAT_TICK_INTERVAL,
            stale_timeout: STALE_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Add a handshake header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Override watchdog timing.
    pub fn heartbeat(mut self, interval: Duration, stale_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.stale_timeout = stale_timeout;
        self
    }

    /// Override the handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use a different clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Request from the handle to the connection task.
#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Send(String),
    Visible,
}

/// Handle to a supervised connection.
///
/// Dropping the handle disconnects the socket for good.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    key: ChannelKey,
    url: String,
    command_tx: mpsc::UnboundedSender<Command>,
    data_tx: broadcast::Sender<MarketData>,
    need_reconnect: Arc<AtomicBool>,
    shutdown: CancellationToken,
    status: StatusPublisher,
    finished: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Spawn the connection task and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(config: SupervisorConfig, status: StatusPublisher) -> Self {
        Self::spawn(config, status, None)
    }

    /// Take over `config.key` from `predecessor`.
    ///
    /// The predecessor is told to disconnect; this supervisor reports
    /// `Connecting` and opens its socket only once the predecessor's task
    /// has exited. Must be called from within a tokio runtime.
    #[must_use]
    pub fn replacing(
        config: SupervisorConfig,
        status: StatusPublisher,
        predecessor: &ConnectionSupervisor,
    ) -> Self {
        predecessor.disconnect();
        Self::spawn(config, status, Some(predecessor.finished.clone()))
    }

    fn spawn(
        config: SupervisorConfig,
        status: StatusPublisher,
        predecessor: Option<CancellationToken>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (data_tx, _) = broadcast::channel(MARKET_BROADCAST_CAPACITY);
        let need_reconnect = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();

        let key = config.key.clone();
        let url = config.url.clone();
        let owner = status.claim(&key);

        let ctx = LoopContext {
            config,
            status: status.clone(),
            owner,
            data_tx: data_tx.clone(),
            need_reconnect: Arc::clone(&need_reconnect),
            shutdown: shutdown.clone(),
        };
        let exited = finished.clone().drop_guard();
        let task = tokio::spawn(async move {
            // Cancelled on exit, panics included.
            let _exited = exited;
            if let Some(predecessor) = predecessor {
                wait_for_predecessor(&ctx, &predecessor).await;
            }
            run_connection_loop(ctx, command_rx).await;
        });

        Self {
            key,
            url,
            command_tx,
            data_tx,
            need_reconnect,
            shutdown,
            status,
            finished,
            task: Mutex::new(Some(task)),
        }
    }

    /// Channel key this supervisor owns.
    #[must_use]
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Endpoint this supervisor connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state of the key.
    ///
    /// Once replaced, this reports the successor's state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.current(&self.key)
    }

    /// Follow connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe(&self.key)
    }

    /// Receive decoded data messages. Each receiver sees every message
    /// published after it was created.
    #[must_use]
    pub fn messages(&self) -> broadcast::Receiver<MarketData> {
        self.data_tx.subscribe()
    }

    /// Add a channel to the desired set; sent now if open, else on next open.
    pub fn subscribe(&self, channel: impl Into<String>) {
        self.command(Command::Subscribe(channel.into()));
    }

    /// Remove a channel from the desired set.
    pub fn unsubscribe(&self, channel: impl Into<String>) {
        self.command(Command::Unsubscribe(channel.into()));
    }

    /// Send raw text if the socket is open; dropped otherwise.
    pub fn send_text(&self, text: impl Into<String>) {
        self.command(Command::Send(text.into()));
    }

    /// The host became visible again: reconnect now if the socket is down.
    pub fn notify_visible(&self) {
        self.command(Command::Visible);
    }

    /// Whether the task will keep reconnecting.
    #[must_use]
    pub fn need_reconnect(&self) -> bool {
        self.need_reconnect.load(Ordering::SeqCst)
    }

    /// Whether the connection task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Stop reconnecting and close the socket. Idempotent.
    pub fn disconnect(&self) {
        if self.need_reconnect.swap(false, Ordering::SeqCst) {
            log::info!("[Supervisor] {}: disconnect requested", self.key);
        }
        self.shutdown.cancel();
    }

    /// Disconnect and wait for the connection task to finish.
    pub async fn disconnect_and_wait(&self) {
        self.disconnect();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("[Supervisor] {}: connection task failed: {}", self.key, e);
            }
        }
    }

    fn command(&self, command: Command) {
        if self.command_tx.send(command).is_err() {
            log::debug!("[Supervisor] {}: connection task gone, command dropped", self.key);
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Everything the connection task shares with its handle.
struct LoopContext {
    config: SupervisorConfig,
    status: StatusPublisher,
    owner: u64,
    data_tx: broadcast::Sender<MarketData>,
    need_reconnect: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl LoopContext {
    fn publish(&self, state: ConnectionState) {
        self.status.publish_as(&self.config.key, self.owner, state);
    }

    fn key(&self) -> &ChannelKey {
        &self.config.key
    }
}

/// Why the per-socket message loop returned.
#[derive(Debug)]
enum LoopExit {
    /// Disconnect requested (or the handle was dropped).
    Shutdown,
    /// Socket lost; reconnect if allowed.
    Disconnected(String),
}

/// What to do after the reconnect wait.
enum Retry {
    Now,
    Shutdown,
}

/// Connect, serve, and reconnect until shut down.
async fn run_connection_loop(ctx: LoopContext, mut command_rx: mpsc::UnboundedReceiver<Command>) {
    let mut subscriptions = SubscriptionManager::new();
    let mut watchdog = Watchdog::new(Arc::clone(&ctx.config.clock), ctx.config.stale_timeout);

    loop {
        if ctx.shutdown.is_cancelled() {
            break;
        }

        ctx.publish(ConnectionState::Connecting);
        log::info!("[Supervisor] {}: connecting to {}", ctx.key(), ctx.config.url);

        let attempt = tokio::select! {
            result = ws::connect(&ctx.config.url, &ctx.config.headers, ctx.config.connect_timeout) => Some(result),
            () = ctx.shutdown.cancelled() => None,
        };
        let Some(attempt) = attempt else {
            break;
        };

        match attempt {
            Ok((mut writer, mut reader)) => {
                ctx.publish(ConnectionState::Open);
                log::info!("[Supervisor] {}: open", ctx.key());
                watchdog.reset();

                let exit = match replay_subscriptions(&mut subscriptions, &mut writer).await {
                    Ok(()) => {
                        run_message_loop(
                            &ctx,
                            &mut writer,
                            &mut reader,
                            &mut watchdog,
                            &mut subscriptions,
                            &mut command_rx,
                        )
                        .await
                    }
                    Err(e) => LoopExit::Disconnected(format!("subscription replay failed: {e}")),
                };

                match exit {
                    LoopExit::Shutdown => {
                        ctx.publish(ConnectionState::Closing);
                        close_quietly(&mut writer).await;
                        break;
                    }
                    LoopExit::Disconnected(reason) => {
                        log::warn!("[Supervisor] {}: connection lost: {}", ctx.key(), reason);
                        close_quietly(&mut writer).await;
                        ctx.publish(ConnectionState::Closed);
                    }
                }
            }
            Err(e) => {
                log::warn!("[Supervisor] {}: connect failed: {:#}", ctx.key(), e);
                ctx.publish(ConnectionState::Closed);
            }
        }

        if !ctx.need_reconnect.load(Ordering::SeqCst) {
            break;
        }

        match wait_for_retry(&ctx, &mut command_rx, &mut subscriptions).await {
            Retry::Now => {}
            Retry::Shutdown => break,
        }
    }

    ctx.publish(ConnectionState::Closed);
    log::info!("[Supervisor] {}: closed", ctx.key());
}

async fn wait_for_predecessor(ctx: &LoopContext, predecessor: &CancellationToken) {
    if predecessor.is_cancelled() {
        return;
    }
    ctx.publish(ConnectionState::Connecting);
    log::debug!("[Supervisor] {}: waiting for previous connection to close", ctx.key());
    tokio::select! {
        () = predecessor.cancelled() => {}
        () = ctx.shutdown.cancelled() => {}
    }
}

/// Send the whole desired set on a fresh socket.
async fn replay_subscriptions(
    subscriptions: &mut SubscriptionManager,
    writer: &mut WsWriter,
) -> anyhow::Result<()> {
    for command in subscriptions.replay() {
        writer.send_text(&command.to_json()).await?;
        log::debug!("[Supervisor] Replayed subscribe for {:?}", command.params);
    }
    Ok(())
}

/// Serve one open socket until it drops or shutdown is requested.
async fn run_message_loop(
    ctx: &LoopContext,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    watchdog: &mut Watchdog,
    subscriptions: &mut SubscriptionManager,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> LoopExit {
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = reader.recv() => {
                let frame = match msg {
                    Some(Ok(WsMessage::Text(text))) => Frame::Text(text),
                    Some(Ok(WsMessage::Binary(data))) => Frame::Binary(data),
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = writer.send_pong(data).await {
                            return LoopExit::Disconnected(format!("{e:#}"));
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Pong)) => continue,
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        return LoopExit::Disconnected(format!("closed by server ({code}) {reason}"));
                    }
                    Some(Err(e)) => return LoopExit::Disconnected(format!("{e:#}")),
                    None => return LoopExit::Disconnected("stream ended".into()),
                };

                if let Err(e) = handle_frame(ctx, &frame, writer, watchdog).await {
                    return LoopExit::Disconnected(format!("{e:#}"));
                }
            }

            _ = heartbeat.tick() => {
                if watchdog.tick() == Liveness::Stale {
                    return LoopExit::Disconnected(format!(
                        "stale: no heartbeat for {}ms",
                        watchdog.silent_for_ms()
                    ));
                }
            }

            command = command_rx.recv() => {
                let outgoing = match command {
                    Some(Command::Subscribe(channel)) => {
                        subscriptions.subscribe(&channel, true).map(|c| c.to_json())
                    }
                    Some(Command::Unsubscribe(channel)) => {
                        subscriptions.unsubscribe(&channel, true).map(|c| c.to_json())
                    }
                    Some(Command::Send(text)) => Some(text),
                    Some(Command::Visible) => {
                        log::trace!("[Supervisor] {}: visible while open", ctx.key());
                        None
                    }
                    None => return LoopExit::Shutdown,
                };
                if let Some(text) = outgoing {
                    if let Err(e) = writer.send_text(&text).await {
                        return LoopExit::Disconnected(format!("{e:#}"));
                    }
                }
            }

            () = ctx.shutdown.cancelled() => return LoopExit::Shutdown,
        }
    }
}

/// Decode one frame and act on it.
async fn handle_frame(
    ctx: &LoopContext,
    frame: &Frame,
    writer: &mut WsWriter,
    watchdog: &mut Watchdog,
) -> anyhow::Result<()> {
    match decode(frame) {
        Some(Message::Ping) => {
            let reply = watchdog.pong_reply();
            log::trace!("[Supervisor] {}: ping -> {}", ctx.key(), reply);
            writer.send_text(&reply).await?;
        }
        Some(Message::Pong { .. }) => {
            watchdog.reset();
        }
        Some(Message::Data(data)) => {
            // No receivers is fine; data is live-only.
            let _ = ctx.data_tx.send(data);
        }
        None => {}
    }
    Ok(())
}

/// Wait out the reconnect delay, cut short by visibility or shutdown.
///
/// Subscription changes made while disconnected land in the desired set
/// and go out with the replay on the next open.
async fn wait_for_retry(
    ctx: &LoopContext,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    subscriptions: &mut SubscriptionManager,
) -> Retry {
    log::info!(
        "[Supervisor] {}: reconnecting in {}ms",
        ctx.key(),
        ctx.config.reconnect_delay.as_millis()
    );

    let delay = tokio::time::sleep(ctx.config.reconnect_delay);
    tokio::pin!(delay);

    loop {
        tokio::select! {
            () = &mut delay => return Retry::Now,
            () = ctx.shutdown.cancelled() => return Retry::Shutdown,
            command = command_rx.recv() => match command {
                Some(Command::Visible) => {
                    log::info!("[Supervisor] {}: visible again, reconnecting now", ctx.key());
                    return Retry::Now;
                }
                Some(Command::Subscribe(channel)) => {
                    subscriptions.subscribe(&channel, false);
                }
                Some(Command::Unsubscribe(channel)) => {
                    subscriptions.unsubscribe(&channel, false);
                }
                Some(Command::Send(_)) => {
                    log::debug!("[Supervisor] {}: not open, dropping outgoing text", ctx.key());
                }
                None => return Retry::Shutdown,
            },
        }
    }
}

async fn close_quietly(writer: &mut WsWriter) {
    match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::trace!("[Supervisor] close: {:#}", e),
        Err(_) => log::trace!("[Supervisor] close timed out"),
    }
}
