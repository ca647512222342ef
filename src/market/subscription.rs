//! Desired-subscription bookkeeping and wire commands.
//!
//! The [`SubscriptionManager`] is the single owner of which channels a
//! connection should be subscribed to. It does no I/O: each call returns the
//! [`WireCommand`] the supervisor should send, or nothing when the socket is
//! not open. After every (re)connect the supervisor sends [`SubscriptionManager::replay`].

use serde::Serialize;

/// Wire method of a subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Start receiving a channel.
    Subscribe,
    /// Stop receiving a channel.
    Unsubscribe,
}

/// `{"method":"SUBSCRIBE","params":["<channel>"],"id":<n>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireCommand {
    /// Subscribe or unsubscribe.
    pub method: Method,
    /// Channel strings the command applies to.
    pub params: Vec<String>,
    /// Correlation id echoed back in the server's acknowledgement.
    pub id: u64,
}

impl WireCommand {
    /// Serialize to the JSON text sent on the socket.
    #[must_use]
    pub fn to_json(&self) -> String {
        // Plain strings and integers cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Desired set of channels for one connection, in subscription order.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    desired: Vec<String>,
    next_id: u64,
}

impl SubscriptionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            desired: Vec::new(),
            next_id: 1,
        }
    }

    /// Add `channel` to the desired set.
    ///
    /// Returns the command to send now when `is_open`; otherwise the channel
    /// waits for the next [`Self::replay`]. Already-desired channels yield
    /// nothing.
    pub fn subscribe(&mut self, channel: &str, is_open: bool) -> Option<WireCommand> {
        if self.desired.iter().any(|c| c == channel) {
            log::trace!("[Subscriptions] Already subscribed to {}", channel);
            return None;
        }
        self.desired.push(channel.to_string());
        is_open.then(|| self.command(Method::Subscribe, channel))
    }

    /// Remove `channel` from the desired set.
    ///
    /// Returns the command to send now when `is_open`.
    pub fn unsubscribe(&mut self, channel: &str, is_open: bool) -> Option<WireCommand> {
        let before = self.desired.len();
        self.desired.retain(|c| c != channel);
        if before == self.desired.len() {
            log::debug!("[Subscriptions] Unsubscribe for unknown channel {}", channel);
        }
        is_open.then(|| self.command(Method::Unsubscribe, channel))
    }

    /// Commands re-establishing the whole desired set on a fresh socket.
    pub fn replay(&mut self) -> Vec<WireCommand> {
        let channels = self.desired.clone();
        channels
            .iter()
            .map(|channel| self.command(Method::Subscribe, channel))
            .collect()
    }

    /// Channels currently desired.
    #[must_use]
    pub fn desired(&self) -> &[String] {
        &self.desired
    }

    /// Whether `channel` is in the desired set.
    #[must_use]
    pub fn contains(&self, channel: &str) -> bool {
        self.desired.iter().any(|c| c == channel)
    }

    fn command(&mut self, method: Method, channel: &str) -> WireCommand {
        let id = self.next_id;
        self.next_id += 1;
        WireCommand {
            method,
            params: vec![channel.to_string()],
            id,
        }
    }
}

/// Kline channel name: `"<symbol lowercased>@kline_<interval>[@<±HH:MM>]"`.
#[must_use]
pub fn kline_channel(symbol: &str, interval: &str, timezone: Option<&str>) -> String {
    let mut channel = format!("{}@kline_{}", symbol.to_lowercase(), interval);
    if let Some(tz) = timezone {
        channel.push('@');
        channel.push_str(tz);
    }
    channel
}

/// Format a UTC offset in minutes as `±HH:MM`.
#[must_use]
pub fn utc_offset(minutes: i32) -> String {
    let sign = if minutes < 0 { '-' } else { '+' };
    let abs = minutes.unsigned_abs();
    format!("{}{:02}:{:02}", sign, abs / 60, abs % 60)
}
