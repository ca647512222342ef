//! Application-wide constants for marketstream.
//!
//! Centralizes timing and protocol constants so the defaults used by
//! [`crate::config::Config`] and the components agree.
//!
//! # Categories
//!
//! - **Market feed**: heartbeat, staleness and reconnect timing
//! - **Chat stream**: HTTP headers, idle timeout, error grace
//! - **Rendering**: typewriter chunk sizes and cadences

use std::time::Duration;

// ============================================================================
// Market feed
// ============================================================================

/// How often the supervisor asks the watchdog whether the socket went quiet.
pub const HEARTBEAT_TICK_INTERVAL: Duration = Duration::from_millis(1_000);

/// Silence longer than this marks a connection stale and forces a reconnect.
pub const STALE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Fixed delay before a dropped connection is re-established.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3_000);

/// Upper bound on a single WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered data messages per supervisor before slow readers start lagging.
pub const MARKET_BROADCAST_CAPACITY: usize = 1024;

// ============================================================================
// Chat stream
// ============================================================================

/// Header carrying the account identifier on chat stream requests.
pub const ACCOUNT_HEADER: &str = "X-Account-Id";

/// Header carrying the API key on chat stream requests.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// A chat stream that produces no bytes for this long is treated as dead.
///
/// Servers send `heartbeat` frames well inside this window while the
/// assistant is thinking.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between rendering an error and finalizing its session.
pub const ERROR_GRACE_DELAY: Duration = Duration::from_millis(500);

/// Pending tasks the ordered delivery queue accepts before pushing waits.
pub const DELIVERY_QUEUE_CAPACITY: usize = 256;

/// Buffered session updates before slow readers start lagging.
pub const SESSION_UPDATE_CAPACITY: usize = 1024;

/// Finalized sessions remembered for idempotent `done` handling.
///
/// Older entries are evicted first; session ids are fresh per turn, so a
/// duplicate `done` arriving this many turns late is not expected.
pub const COMPLETED_SESSION_CAPACITY: usize = 1024;

/// Longest unterminated line accepted from a chat stream.
pub const MAX_STREAM_LINE_BYTES: usize = 1024 * 1024;

// ============================================================================
// Rendering
// ============================================================================

/// Characters revealed per tick for thought and final-answer text.
pub const TEXT_CHUNK_SIZE: usize = 5;

/// Tick cadence for thought and final-answer text.
pub const TEXT_CADENCE: Duration = Duration::from_millis(34);

/// Characters revealed per tick for observations (tool output).
pub const OBSERVATION_CHUNK_SIZE: usize = 20;

/// Tick cadence for observations.
pub const OBSERVATION_CADENCE: Duration = Duration::from_millis(10);
