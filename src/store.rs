//! Local datastore: verified items keyed by their 512-bit id, with the
//! bookkeeping needed for republication, expiry and cache pruning.
//!
//! The store itself never verifies anything; the node engine only hands it
//! items that already passed full validation. Precedence between two items
//! under the same key is the item ordering rule: larger creation timestamp
//! wins, ties broken by signature bytes, so the outcome is independent of
//! arrival order.

use std::collections::HashMap;

use tracing::debug;

use crate::identity::NodeId;
use crate::item::SignedItem;

/// What happened to an offered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First item under this key.
    Inserted,
    /// Replaced an older item under the same key.
    Replaced,
    /// Identical to the stored item; nothing changed.
    Unchanged,
    /// Older than the stored item; dropped.
    Superseded,
}

struct Entry {
    item: SignedItem,
    last_requested_ms: u64,
    last_republished_ms: u64,
}

#[derive(Default)]
pub struct Datastore {
    items: HashMap<NodeId, Entry>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert or replace under the item's key. An insert or replacement
    /// counts as a republication receipt: the entry will sit out the next
    /// republish cycle.
    pub fn insert(&mut self, item: SignedItem, now_ms: u64) -> StoreOutcome {
        match self.items.get_mut(&item.key) {
            None => {
                self.items.insert(
                    item.key,
                    Entry {
                        item,
                        last_requested_ms: now_ms,
                        last_republished_ms: now_ms,
                    },
                );
                StoreOutcome::Inserted
            }
            Some(entry) => {
                if item.timestamp == entry.item.timestamp && item.sig == entry.item.sig {
                    StoreOutcome::Unchanged
                } else if item.supersedes(&entry.item) {
                    entry.item = item;
                    entry.last_republished_ms = now_ms;
                    StoreOutcome::Replaced
                } else {
                    StoreOutcome::Superseded
                }
            }
        }
    }

    /// Fetch an item, marking the key as requested.
    pub fn get(&mut self, key: &NodeId, now_ms: u64) -> Option<SignedItem> {
        let entry = self.items.get_mut(key)?;
        entry.last_requested_ms = now_ms;
        Some(entry.item.clone())
    }

    /// Fetch without touching request bookkeeping.
    pub fn peek(&self, key: &NodeId) -> Option<&SignedItem> {
        self.items.get(key).map(|e| &e.item)
    }

    pub fn remove(&mut self, key: &NodeId) -> Option<SignedItem> {
        self.items.remove(key).map(|e| e.item)
    }

    /// Drop every item whose expiry lies in the past. Returns the removed
    /// keys.
    pub fn expire_scan(&mut self, wall_now_ms: u64) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .items
            .iter()
            .filter(|(_, e)| e.item.expires != 0 && e.item.expires < wall_now_ms)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.items.remove(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired items removed");
        }
        expired
    }

    /// Items whose last republication is at least `interval_ms` old.
    pub fn republish_due(&self, now_ms: u64, interval_ms: u64) -> Vec<SignedItem> {
        self.items
            .values()
            .filter(|e| now_ms.saturating_sub(e.last_republished_ms) >= interval_ms)
            .map(|e| e.item.clone())
            .collect()
    }

    pub fn mark_republished(&mut self, key: &NodeId, now_ms: u64) {
        if let Some(entry) = self.items.get_mut(key) {
            entry.last_republished_ms = now_ms;
        }
    }

    /// Keys that nobody has asked for in `interval_ms`. Candidates for cache
    /// pruning; the caller decides based on keyspace distance whether an
    /// entry is a caching copy or one we are responsible for.
    pub fn stale_request_keys(&self, now_ms: u64, interval_ms: u64) -> Vec<NodeId> {
        self.items
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.last_requested_ms) >= interval_ms)
            .map(|(k, _)| *k)
            .collect()
    }
}
