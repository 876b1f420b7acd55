//! Hub statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared between a hub and its tasks.
#[derive(Debug)]
pub struct HubStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    encode_failures: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    adds_applied: AtomicU64,
    deletes_applied: AtomicU64,
    started_at: Instant,
}

/// Point-in-time copy of [`HubStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub encode_failures: u64,
    pub received: u64,
    pub dropped: u64,
    pub adds_applied: u64,
    pub deletes_applied: u64,
}

impl HubStats {
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            adds_applied: AtomicU64::new(0),
            deletes_applied: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_add(&self) {
        self.adds_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages accepted by the transport.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliveries seen by the consumer, valid or not.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Deliveries discarded as malformed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Time since the hub started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published(),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            received: self.received(),
            dropped: self.dropped(),
            adds_applied: self.adds_applied.load(Ordering::Relaxed),
            deletes_applied: self.deletes_applied.load(Ordering::Relaxed),
        }
    }
}

impl Default for HubStats {
    fn default() -> Self {
        Self::new()
    }
}
