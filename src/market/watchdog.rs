//! Heartbeat watchdog.
//!
//! Tracks when a connection last proved it was alive. The supervisor calls
//! [`Watchdog::tick`] on a fixed interval; once the silence exceeds the
//! timeout the watchdog reports [`Liveness::Stale`] a single time, and stays
//! quiet until the next [`Watchdog::reset`].

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Outcome of a watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heard from the peer recently enough (or already reported stale).
    Alive,
    /// Silent past the timeout; the owner should force a reconnect.
    Stale,
}

/// Liveness tracker for one connection.
#[derive(Debug)]
pub struct Watchdog {
    clock: Arc<dyn Clock>,
    timeout_ms: i64,
    last_reset_ms: i64,
    stale_reported: bool,
}

impl Watchdog {
    /// Create a watchdog that considers the connection alive as of now.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let last_reset_ms = clock.now_ms();
        Self {
            clock,
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            last_reset_ms,
            stale_reported: false,
        }
    }

    /// Mark the connection alive now. Returns the timestamp recorded.
    pub fn reset(&mut self) -> i64 {
        self.last_reset_ms = self.clock.now_ms();
        self.stale_reported = false;
        self.last_reset_ms
    }

    /// Check for silence. Reports `Stale` once per silent period.
    pub fn tick(&mut self) -> Liveness {
        if self.stale_reported {
            return Liveness::Alive;
        }
        let silent_for = self.clock.now_ms() - self.last_reset_ms;
        if silent_for > self.timeout_ms {
            self.stale_reported = true;
            Liveness::Stale
        } else {
            Liveness::Alive
        }
    }

    /// Reset and build the `{"event":"pong","ts":…}` answer to a server ping.
    pub fn pong_reply(&mut self) -> String {
        let ts = self.reset();
        serde_json::json!({ "event": "pong", "ts": ts }).to_string()
    }

    /// Timestamp of the last reset, in epoch milliseconds.
    #[must_use]
    pub fn last_reset_ms(&self) -> i64 {
        self.last_reset_ms
    }

    /// Milliseconds since the last reset.
    #[must_use]
    pub fn silent_for_ms(&self) -> i64 {
        self.clock.now_ms() - self.last_reset_ms
    }
}
