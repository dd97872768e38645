//! Named broker counters
//!
//! Counters are plain `u64` accumulators keyed by name. Known names are
//! listed as constants; embedding code may add its own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use compact_str::CompactString;
use dashmap::DashMap;

pub const CONNECTIONS_ACCEPTED: &str = "connections.accepted";
pub const CONNECTIONS_ACTIVE: &str = "connections.active";
pub const MESSAGES_RECEIVED: &str = "messages.received";
pub const MESSAGES_SENT: &str = "messages.sent";
pub const MESSAGES_DROPPED: &str = "messages.dropped";
pub const EVENTS_MIRRORED: &str = "events.mirrored";
pub const EVENTS_MIRROR_FAILED: &str = "events.mirror_failed";

#[derive(Debug, Default)]
pub struct Stats {
    counters: DashMap<CompactString, AtomicU64, ahash::RandomState>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(CompactString::from(name))
            .or_default()
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    pub fn sub(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.get(name) {
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(value))
            });
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Reset one counter to zero, returning its previous value
    pub fn reset(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.swap(0, Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Point-in-time copy of every counter, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}
