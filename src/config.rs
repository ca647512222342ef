//! Configuration loading and persistence.
//!
//! Settings live in `config.json` under the platform config directory and
//! can be overridden per field with `MARKETSTREAM_*` environment variables.
//! The API key is only ever read from the environment; it is never written
//! to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs};

use crate::chat::{
    Credentials, PipelineConfig, RenderPolicy, RevealOptions, StreamSessionController,
};
use crate::constants::{
    CONNECT_TIMEOUT, ERROR_GRACE_DELAY, HEARTBEAT_TICK_INTERVAL, OBSERVATION_CADENCE,
    OBSERVATION_CHUNK_SIZE, RECONNECT_DELAY, STALE_TIMEOUT, STREAM_IDLE_TIMEOUT, TEXT_CADENCE,
    TEXT_CHUNK_SIZE,
};
use crate::market::{ChannelKey, SupervisorConfig};

const CONFIG_FILE: &str = "config.json";

/// Configuration for marketstream.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Market-data WebSocket endpoint.
    pub market_ws_url: String,
    /// Chat streaming endpoint.
    pub chat_url: String,
    /// Account sent in the account header.
    pub account_id: String,
    /// API key - NOT serialized to disk (environment only).
    #[serde(skip)]
    pub api_key: String,
    /// User the chat turns run as.
    pub user_id: String,
    /// Delay before reconnecting a dropped socket, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Watchdog tick interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence before a socket counts as dead, in milliseconds.
    pub stale_timeout_ms: u64,
    /// WebSocket handshake timeout, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Chat stream idle timeout, in seconds.
    pub stream_idle_timeout_secs: u64,
    /// Pause between an error and finalizing its turn, in milliseconds.
    pub error_grace_ms: u64,
    /// Characters per tick for thought and answer text (0 = instant).
    pub text_chunk_size: usize,
    /// Tick cadence for thought and answer text, in milliseconds.
    pub text_cadence_ms: u64,
    /// Characters per tick for observations (0 = instant).
    pub observation_chunk_size: usize,
    /// Tick cadence for observations, in milliseconds.
    pub observation_cadence_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            market_ws_url: "wss://stream.binance.com:9443/stream".to_string(),
            chat_url: "http://localhost:8000/api/chat/stream".to_string(),
            account_id: String::new(),
            api_key: String::new(),
            user_id: String::new(),
            reconnect_delay_ms: millis(RECONNECT_DELAY),
            heartbeat_interval_ms: millis(HEARTBEAT_TICK_INTERVAL),
            stale_timeout_ms: millis(STALE_TIMEOUT),
            connect_timeout_ms: millis(CONNECT_TIMEOUT),
            stream_idle_timeout_secs: STREAM_IDLE_TIMEOUT.as_secs(),
            error_grace_ms: millis(ERROR_GRACE_DELAY),
            text_chunk_size: TEXT_CHUNK_SIZE,
            text_cadence_ms: millis(TEXT_CADENCE),
            observation_chunk_size: OBSERVATION_CHUNK_SIZE,
            observation_cadence_ms: millis(OBSERVATION_CADENCE),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("market_ws_url", &self.market_ws_url)
            .field("chat_url", &self.chat_url)
            .field("account_id", &self.account_id)
            .field("api_key", &if self.has_api_key() { "[set]" } else { "[unset]" })
            .field("user_id", &self.user_id)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("stale_timeout_ms", &self.stale_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `MARKETSTREAM_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("MARKETSTREAM_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("marketstream")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields the defaults; an unreadable one is an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads a config file. Fields it omits keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Applies `MARKETSTREAM_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`; unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("MARKETSTREAM_WS_URL") {
            self.market_ws_url = url;
        }
        if let Some(url) = lookup("MARKETSTREAM_CHAT_URL") {
            self.chat_url = url;
        }
        if let Some(account_id) = lookup("MARKETSTREAM_ACCOUNT_ID") {
            self.account_id = account_id;
        }
        if let Some(api_key) = lookup("MARKETSTREAM_API_KEY") {
            self.api_key = api_key;
        }
        if let Some(user_id) = lookup("MARKETSTREAM_USER_ID") {
            self.user_id = user_id;
        }

        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(ms) = number("MARKETSTREAM_RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = ms;
        }
        if let Some(ms) = number("MARKETSTREAM_STALE_TIMEOUT_MS") {
            self.stale_timeout_ms = ms;
        }
        if let Some(secs) = number("MARKETSTREAM_STREAM_IDLE_TIMEOUT_SECS") {
            self.stream_idle_timeout_secs = secs;
        }
    }

    /// Persists the configuration to the config directory.
    /// Note: the API key is NOT saved.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Persists the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether an API key was provided.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Supervisor settings for `key` at the configured market endpoint.
    pub fn supervisor_config(&self, key: impl Into<ChannelKey>) -> SupervisorConfig {
        SupervisorConfig::new(key, self.market_ws_url.clone())
            .reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
            .heartbeat(
                Duration::from_millis(self.heartbeat_interval_ms.max(1)),
                Duration::from_millis(self.stale_timeout_ms),
            )
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    /// Credentials for the chat stream.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            account_id: self.account_id.clone(),
            api_key: self.api_key.clone(),
        }
    }

    /// Render and grace settings for the chat pipeline.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let text = RevealOptions::new(
            self.text_chunk_size,
            Duration::from_millis(self.text_cadence_ms),
        );
        PipelineConfig {
            render: RenderPolicy {
                thought: text,
                observation: RevealOptions::new(
                    self.observation_chunk_size,
                    Duration::from_millis(self.observation_cadence_ms),
                ),
                final_answer: text,
                ..RenderPolicy::default()
            },
            error_grace: Duration::from_millis(self.error_grace_ms),
            ..PipelineConfig::default()
        }
    }

    /// Stream controller for the configured chat endpoint.
    pub fn stream_controller(&self) -> Result<StreamSessionController> {
        Ok(
            StreamSessionController::new(self.chat_url.clone(), self.credentials())?
                .idle_timeout(Duration::from_secs(self.stream_idle_timeout_secs.max(1))),
        )
    }
}
