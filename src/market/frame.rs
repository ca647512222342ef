//! Frame decoding for market feeds.
//!
//! [`decode`] turns one raw transport frame into a [`Message`]. It never
//! panics and never returns an error: frames it cannot make sense of are
//! logged and dropped by returning `None`.
//!
//! # Wire shapes
//!
//! ```text
//! "ping"                                   -> Message::Ping (no JSON)
//! {"event":"ping"}                         -> Message::Ping
//! {"event":"pong","ts":1700000000000}      -> Message::Pong
//! {"stream":"btcusdt@kline_1m","data":{…}} -> Message::Data (topic = stream, payload = data)
//! {"e":"kline","s":"BTCUSDT",…}            -> Message::Data (topic = "kline", payload = frame)
//! <zlib bytes>                             -> inflated, then as above
//! ```

use serde_json::Value;

use super::compression::inflate;
use super::DecodeError;

/// Raw transport unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload, usually zlib-compressed JSON.
    Binary(Vec<u8>),
}

/// A data message routed to feed subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    /// Channel the message belongs to (empty when the frame named none).
    pub topic: String,
    /// Message body.
    pub payload: Value,
}

/// Decoded feed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server heartbeat; must be answered with a pong.
    Ping,
    /// Server answer to a client ping.
    Pong {
        /// Server timestamp, when present.
        ts: Option<i64>,
    },
    /// Anything else.
    Data(MarketData),
}

/// Keys that name the channel of a data frame, in lookup order.
const TOPIC_KEYS: [&str; 4] = ["stream", "topic", "channel", "e"];

/// Decode a raw frame. Returns `None` for malformed input.
#[must_use]
pub fn decode(frame: &Frame) -> Option<Message> {
    let result = match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(data) => decode_binary(data),
    };

    match result {
        Ok(message) => Some(message),
        Err(e) => {
            log::debug!("[Decoder] Dropping frame: {}", e);
            None
        }
    }
}

fn decode_text(text: &str) -> Result<Message, DecodeError> {
    if text.trim() == "ping" {
        return Ok(Message::Ping);
    }
    let value = serde_json::from_str::<Value>(text)
        .map_err(|e| DecodeError::Json(format!("{e} in {:?}", preview(text))))?;
    Ok(classify(value))
}

fn decode_binary(data: &[u8]) -> Result<Message, DecodeError> {
    // Some gateways send plain JSON in binary frames.
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(message) = decode_text(text) {
            return Ok(message);
        }
    }

    let inflated = inflate(data)?;
    let text = String::from_utf8(inflated)
        .map_err(|e| DecodeError::Json(format!("inflated frame is not UTF-8: {e}")))?;
    decode_text(&text)
}

fn classify(value: Value) -> Message {
    match value.get("event").and_then(Value::as_str) {
        Some("ping") => return Message::Ping,
        Some("pong") => {
            return Message::Pong {
                ts: value.get("ts").and_then(Value::as_i64),
            }
        }
        _ => {}
    }

    let topic = TOPIC_KEYS
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    // Combined-stream envelope: {"stream": "...", "data": {...}}
    let payload = match value {
        Value::Object(mut map) if map.contains_key("stream") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    Message::Data(MarketData { topic, payload })
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(80) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
