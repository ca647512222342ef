//! Self-healing WebSocket feeds for market data and notifications.
//!
//! One [`ConnectionSupervisor`] owns one socket per [`ChannelKey`]. The
//! [`ConnectionRegistry`] enforces that invariant and ties supervisor
//! lifetime to caller interest.
//!
//! # Architecture
//!
//! ```text
//! ConnectionRegistry
//!     │ acquire(config) / release(key)
//!     ▼
//! ConnectionSupervisor ── background task ───────────────────────┐
//!     ├── ws::connect / reconnect after RECONNECT_DELAY           │
//!     ├── frame::decode ─► Ping → pong reply + Watchdog::reset    │
//!     │                  └► Data → broadcast to messages()        │
//!     ├── Watchdog::tick every second → Stale → forced reconnect  │
//!     ├── SubscriptionManager → SUBSCRIBE/UNSUBSCRIBE, replay     │
//!     └── StatusPublisher::publish(key, state) ◄──────────────────┘
//! ```

pub mod compression;
pub mod frame;
pub mod registry;
pub mod status;
pub mod subscription;
pub mod supervisor;
pub mod watchdog;

use std::fmt;

/// Identifier for one logical real-time connection.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChannelKey(pub String);

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChannelKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ChannelKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Connection state for one channel key.
///
/// Transitions are monotonic within one connection attempt; a reconnect
/// starts again at [`ConnectionState::Connecting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No attempt made yet.
    #[default]
    Unconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected and delivering messages.
    Open,
    /// Closing on request.
    Closing,
    /// Closed, either for good or until the next reconnect attempt.
    Closed,
}

impl ConnectionState {
    /// `true` when a reconnect is pointless because a socket is live or coming up.
    #[must_use]
    pub fn is_live_or_pending(self) -> bool {
        matches!(self, Self::Open | Self::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Errors raised while turning a raw frame into a message.
///
/// These never escape [`frame::decode`]; they exist so the decoder can log
/// what went wrong before dropping the frame.
#[derive(Debug)]
pub enum DecodeError {
    /// Payload was not valid JSON.
    Json(String),
    /// Binary payload could not be inflated.
    Inflate(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "JSON error: {msg}"),
            Self::Inflate(msg) => write!(f, "Inflate error: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

// Re-exports
pub use frame::{decode, Frame, MarketData, Message};
pub use registry::ConnectionRegistry;
pub use status::StatusPublisher;
pub use subscription::{kline_channel, utc_offset, SubscriptionManager, WireCommand};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig};
pub use watchdog::{Liveness, Watchdog};
