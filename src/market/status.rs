//! Connection status fan-out.
//!
//! [`StatusPublisher`] keeps the last known [`ConnectionState`] per channel
//! key in a `tokio::sync::watch` channel, so any number of readers can follow
//! a key independently and late readers still see the current state.
//!
//! A key is owned by at most one supervisor at a time. [`StatusPublisher::claim`]
//! hands out a fresh owner generation; [`StatusPublisher::publish_as`] from an
//! older generation is ignored, so a replaced supervisor that is still closing
//! cannot overwrite its successor's state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::{ChannelKey, ConnectionState};

#[derive(Debug)]
struct Slot {
    sender: watch::Sender<ConnectionState>,
    owner: u64,
}

impl Slot {
    fn new(state: ConnectionState, owner: u64) -> Self {
        Self {
            sender: watch::channel(state).0,
            owner,
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    by_key: HashMap<ChannelKey, Slot>,
    last_owner: u64,
}

/// Shared, cloneable publisher of per-key connection state.
#[derive(Debug, Clone, Default)]
pub struct StatusPublisher {
    slots: Arc<Mutex<Slots>>,
}

impl StatusPublisher {
    /// Create an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new state for `key` and wake its readers, whoever owns it.
    pub fn publish(&self, key: &ChannelKey, state: ConnectionState) {
        let mut slots = self.lock();
        match slots.by_key.get(key) {
            Some(slot) => replace(key, &slot.sender, state),
            None => {
                log::debug!("[Status] {}: {}", key, state);
                slots.by_key.insert(key.clone(), Slot::new(state, 0));
            }
        }
    }

    /// Take ownership of `key`. Publishes from earlier owners are ignored from now on.
    pub fn claim(&self, key: &ChannelKey) -> u64 {
        let mut slots = self.lock();
        slots.last_owner += 1;
        let owner = slots.last_owner;
        slots
            .by_key
            .entry(key.clone())
            .or_insert_with(|| Slot::new(ConnectionState::Unconnected, owner))
            .owner = owner;
        owner
    }

    /// Record a new state for `key` on behalf of `owner`.
    ///
    /// Returns `false`, without touching the state, when another owner has
    /// claimed the key since.
    pub fn publish_as(&self, key: &ChannelKey, owner: u64, state: ConnectionState) -> bool {
        let mut slots = self.lock();
        match slots.by_key.get(key) {
            Some(slot) if slot.owner != owner => {
                log::trace!("[Status] {}: stale {} from owner {} ignored", key, state, owner);
                false
            }
            Some(slot) => {
                replace(key, &slot.sender, state);
                true
            }
            None => {
                log::debug!("[Status] {}: {}", key, state);
                slots.by_key.insert(key.clone(), Slot::new(state, owner));
                true
            }
        }
    }

    /// Follow the state of `key`.
    ///
    /// The receiver starts at the last published state, or
    /// [`ConnectionState::Unconnected`] if nothing was published yet.
    #[must_use]
    pub fn subscribe(&self, key: &ChannelKey) -> watch::Receiver<ConnectionState> {
        self.lock()
            .by_key
            .entry(key.clone())
            .or_insert_with(|| Slot::new(ConnectionState::Unconnected, 0))
            .sender
            .subscribe()
    }

    /// Last known state of `key`.
    #[must_use]
    pub fn current(&self, key: &ChannelKey) -> ConnectionState {
        self.lock()
            .by_key
            .get(key)
            .map_or(ConnectionState::Unconnected, |slot| *slot.sender.borrow())
    }

    /// Drop the retained state of `key`. Existing readers see the channel close.
    pub fn forget(&self, key: &ChannelKey) {
        self.lock().by_key.remove(key);
    }

    /// Snapshot of every known key and its state.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ChannelKey, ConnectionState)> {
        let mut all: Vec<_> = self
            .lock()
            .by_key
            .iter()
            .map(|(key, slot)| (key.clone(), *slot.sender.borrow()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn replace(key: &ChannelKey, sender: &watch::Sender<ConnectionState>, state: ConnectionState) {
    // send_replace stores the value even when nobody is listening.
    let previous = sender.send_replace(state);
    if previous != state {
        log::debug!("[Status] {}: {} -> {}", key, previous, state);
    }
}
