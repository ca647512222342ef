//! One supervisor per channel key.
//!
//! The [`ConnectionRegistry`] is where callers express interest in a feed.
//! The first `acquire` for a key spawns its supervisor, later ones share it,
//! and the last `release` tears it down. Re-acquiring a key with a different
//! URL tears the old socket down before the new one is created, so a key
//! never has two live sockets. The same holds after `release`: a supervisor
//! that is still closing is kept as the predecessor of the next one for
//! its key.

use std::collections::HashMap;
use std::sync::Arc;

use super::status::StatusPublisher;
use super::supervisor::{ConnectionSupervisor, SupervisorConfig};
use super::ChannelKey;

#[derive(Debug)]
struct Entry {
    supervisor: Arc<ConnectionSupervisor>,
    interest: usize,
}

/// Registry of live supervisors keyed by [`ChannelKey`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    status: StatusPublisher,
    entries: HashMap<ChannelKey, Entry>,
    retiring: HashMap<ChannelKey, Arc<ConnectionSupervisor>>,
}

impl ConnectionRegistry {
    /// Create a registry publishing into a fresh [`StatusPublisher`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry publishing into an existing publisher.
    #[must_use]
    pub fn with_status(status: StatusPublisher) -> Self {
        Self {
            status,
            entries: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Status publisher shared by every supervisor in this registry.
    #[must_use]
    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    /// Register interest in `config.key`, spawning its supervisor if needed.
    pub fn acquire(&mut self, config: SupervisorConfig) -> Arc<ConnectionSupervisor> {
        let key = config.key.clone();

        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.supervisor.url() == config.url {
                entry.interest += 1;
                log::debug!("[Registry] {}: interest now {}", key, entry.interest);
                return Arc::clone(&entry.supervisor);
            }
            log::info!(
                "[Registry] {}: endpoint changed {} -> {}, replacing connection",
                key,
                entry.supervisor.url(),
                config.url
            );
        }

        self.retiring.retain(|_, old| !old.is_finished());
        let (predecessor, interest) = match self.entries.remove(&key) {
            Some(old) => (Some(old.supervisor), old.interest + 1),
            None => (self.retiring.remove(&key), 1),
        };

        let supervisor = Arc::new(match predecessor {
            Some(old) => ConnectionSupervisor::replacing(config, self.status.clone(), &old),
            None => ConnectionSupervisor::connect(config, self.status.clone()),
        });
        self.entries.insert(
            key,
            Entry {
                supervisor: Arc::clone(&supervisor),
                interest,
            },
        );
        supervisor
    }

    /// Drop one unit of interest. Returns `true` if the supervisor was torn down.
    pub fn release(&mut self, key: &ChannelKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            log::debug!("[Registry] {}: release without interest", key);
            return false;
        };
        entry.interest = entry.interest.saturating_sub(1);
        if entry.interest > 0 {
            return false;
        }
        self.disconnect(key)
    }

    /// Tear down `key` regardless of interest. Returns `true` if it existed.
    pub fn disconnect(&mut self, key: &ChannelKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.retire(key.clone(), entry.supervisor);
                true
            }
            None => false,
        }
    }

    /// Tear down every connection.
    pub fn disconnect_all(&mut self) {
        let entries: Vec<_> = self.entries.drain().collect();
        for (key, entry) in entries {
            self.retire(key, entry.supervisor);
        }
    }

    /// Wait until every supervisor this registry tore down has exited.
    pub async fn wait_retired(&mut self) {
        let retired: Vec<_> = self.retiring.drain().map(|(_, old)| old).collect();
        for old in retired {
            old.disconnect_and_wait().await;
        }
    }

    fn retire(&mut self, key: ChannelKey, supervisor: Arc<ConnectionSupervisor>) {
        supervisor.disconnect();
        log::info!("[Registry] {}: torn down", key);
        self.retiring.insert(key, supervisor);
    }

    /// Forward a host visibility change to every supervisor.
    pub fn notify_visible(&self) {
        for entry in self.entries.values() {
            entry.supervisor.notify_visible();
        }
    }

    /// Supervisor for `key`, if live.
    #[must_use]
    pub fn get(&self, key: &ChannelKey) -> Option<Arc<ConnectionSupervisor>> {
        self.entries.get(key).map(|e| Arc::clone(&e.supervisor))
    }

    /// Number of live supervisors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no supervisor is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(key: &str, url: &str) -> SupervisorConfig {
        SupervisorConfig::new(key, url)
            .reconnect_delay(Duration::from_secs(60))
            .connect_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_acquire_shares_supervisor() {
        let mut registry = ConnectionRegistry::new();
        let first = registry.acquire(config("market", "ws://127.0.0.1:1/ws"));
        let second = registry.acquire(config("market", "ws://127.0.0.1:1/ws"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_last_release_tears_down() {
        let mut registry = ConnectionRegistry::new();
        let key = ChannelKey::from("market");
        let supervisor = registry.acquire(config("market", "ws://127.0.0.1:1/ws"));
        registry.acquire(config("market", "ws://127.0.0.1:1/ws"));

        assert!(!registry.release(&key));
        assert!(supervisor.need_reconnect());
        assert!(registry.release(&key));
        assert!(!supervisor.need_reconnect());
        assert!(registry.is_empty());
        assert!(!registry.release(&key));
    }

    #[tokio::test]
    async fn test_changed_url_replaces_connection() {
        let mut registry = ConnectionRegistry::new();
        let old = registry.acquire(config("market", "ws://127.0.0.1:1/a"));
        let new = registry.acquire(config("market", "ws://127.0.0.1:1/b"));

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!old.need_reconnect(), "old socket torn down first");
        assert!(new.need_reconnect());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reacquire_after_release_waits_for_old_task() {
        let mut registry = ConnectionRegistry::new();
        let key = ChannelKey::from("market");
        let old = registry.acquire(config("market", "ws://127.0.0.1:1/ws"));
        assert!(registry.release(&key));

        let new = registry.acquire(config("market", "ws://127.0.0.1:1/ws"));
        assert!(!Arc::ptr_eq(&old, &new));
        tokio::time::timeout(Duration::from_secs(5), old.disconnect_and_wait())
            .await
            .expect("old task exits");
        assert!(old.is_finished());
        assert!(!new.is_finished());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let mut registry = ConnectionRegistry::new();
        let market = registry.acquire(config("market", "ws://127.0.0.1:1/ws"));
        let private = registry.acquire(config("private", "ws://127.0.0.1:1/ws"));

        assert!(registry.disconnect(&"private".into()));
        assert!(!private.need_reconnect());
        assert!(market.need_reconnect());
        assert!(registry.get(&"market".into()).is_some());
        assert!(registry.get(&"private".into()).is_none());
    }
}
