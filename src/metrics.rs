//! Plain atomic counters exposed via `Cache::metrics()`.
//!
//! A handful of `AtomicU64` counters bumped inline at the call sites that
//! already know the event happened, snapshotted into a plain `Copy` struct
//! on read.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub partial_evictions: AtomicU64,
    pub cleaner_invocations: AtomicU64,
    pub checkpoints_begun: AtomicU64,
    pub checkpoints_ended: AtomicU64,
    pub clones_produced: AtomicU64,
    pub bytes_resident: AtomicU64,
}

/// Point-in-time snapshot, returned by [`Metrics::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub partial_evictions: u64,
    pub cleaner_invocations: u64,
    pub checkpoints_begun: u64,
    pub checkpoints_ended: u64,
    pub clones_produced: u64,
    pub bytes_resident: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            partial_evictions: self.partial_evictions.load(Ordering::Relaxed),
            cleaner_invocations: self.cleaner_invocations.load(Ordering::Relaxed),
            checkpoints_begun: self.checkpoints_begun.load(Ordering::Relaxed),
            checkpoints_ended: self.checkpoints_ended.load(Ordering::Relaxed),
            clones_produced: self.clones_produced.load(Ordering::Relaxed),
            bytes_resident: self.bytes_resident.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_bytes_resident(&self, value: u64) {
        self.bytes_resident.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = Metrics::default();
        m.hits.fetch_add(3, Ordering::Relaxed);
        m.evictions.fetch_add(1, Ordering::Relaxed);
        let snap = m.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.evictions, 1);
    }
}
