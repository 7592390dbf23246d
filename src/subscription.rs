//! Subscription registry.
//!
//! Tracks which channels the session has asked for and which are active.
//! An entry is created when a subscribe request is issued and becomes active
//! when the server confirms it, either by listing the channel in the
//! subscribe acknowledgment or by delivering an event on it first.
//! Re-subscribing to a known channel never creates a second entry, and
//! unsubscribing only marks the entry inactive so history is kept.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub channel: String,
    pub active: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// channel -> active
    entries: HashMap<String, bool>,
    /// Channels with a subscribe request in flight.
    awaiting: HashSet<String>,
}

/// Set of channel subscriptions of one session.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a subscribe request for `channel` is being sent.
    ///
    /// Returns `true` if the channel was not known before.
    pub fn request(&self, channel: &str) -> bool {
        let mut inner = self.write();
        inner.awaiting.insert(channel.to_string());
        if inner.entries.contains_key(channel) {
            false
        } else {
            inner.entries.insert(channel.to_string(), false);
            true
        }
    }

    /// Mark `channel` active.
    pub fn confirm(&self, channel: &str) {
        let mut inner = self.write();
        inner.awaiting.remove(channel);
        inner.entries.insert(channel.to_string(), true);
    }

    /// An event arrived on `channel`: activate it if a request is in flight.
    ///
    /// Returns `true` if this activated the channel.
    pub fn confirm_on_event(&self, channel: &str) -> bool {
        {
            let inner = self.read();
            if !inner.awaiting.contains(channel) {
                return false;
            }
        }
        let mut inner = self.write();
        if !inner.awaiting.remove(channel) {
            return false;
        }
        match inner.entries.insert(channel.to_string(), true) {
            Some(true) => false,
            _ => true,
        }
    }

    /// The server refused `channel`. An already active entry stays active.
    pub fn reject(&self, channel: &str) {
        self.write().awaiting.remove(channel);
    }

    /// Mark `channel` inactive. Returns `true` if it was active.
    pub fn deactivate(&self, channel: &str) -> bool {
        let mut inner = self.write();
        inner.awaiting.remove(channel);
        match inner.entries.get_mut(channel) {
            Some(active) => std::mem::replace(active, false),
            None => false,
        }
    }

    pub fn is_active(&self, channel: &str) -> bool {
        self.read().entries.get(channel).copied().unwrap_or(false)
    }

    /// Active channels, sorted.
    pub fn list_active(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .read()
            .entries
            .iter()
            .filter(|(_, active)| **active)
            .map(|(channel, _)| channel.clone())
            .collect();
        active.sort();
        active
    }

    /// All entries, sorted by channel.
    pub fn entries(&self) -> Vec<SubscriptionEntry> {
        let mut entries: Vec<SubscriptionEntry> = self
            .read()
            .entries
            .iter()
            .map(|(channel, active)| SubscriptionEntry {
                channel: channel.clone(),
                active: *active,
            })
            .collect();
        entries.sort_by(|a, b| a.channel.cmp(&b.channel));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
