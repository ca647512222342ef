//! Marketstream - real-time transport core for a trading dashboard.
//!
//! This crate owns the two streaming paths the dashboard depends on:
//! self-healing WebSocket feeds for market data and notifications, and the
//! HTTP event stream that delivers an assistant's reply one event at a time.
//!
//! # Architecture
//!
//! ```text
//!   market::ConnectionRegistry ──► ConnectionSupervisor (one per ChannelKey)
//!                                     ├── ws (tokio-tungstenite transport)
//!                                     ├── frame::decode (text / zlib binary)
//!                                     ├── Watchdog (stale detection)
//!                                     ├── SubscriptionManager (desired set)
//!                                     └── StatusPublisher (watch fan-out)
//!
//!   chat::ChatPipeline
//!     StreamSessionController ──► OrderedQueue ──► IncrementalRenderer
//!                                                      └──► SessionStore ──► ThreadStore
//! ```
//!
//! # Modules
//!
//! - [`market`] - WebSocket supervision, decoding, subscriptions, status
//! - [`chat`] - streamed assistant replies and ordered rendering
//! - [`config`] - configuration loading/saving
//! - [`ws`] - shared WebSocket transport

pub mod chat;
pub mod clock;
pub mod config;
pub mod constants;
pub mod market;
pub mod ws;

// Re-export commonly used types
pub use chat::{ChatPipeline, ChatRequest, SessionId, StreamEvent, StreamEventKind};
pub use config::Config;
pub use market::{ChannelKey, ConnectionRegistry, ConnectionState, ConnectionSupervisor};
