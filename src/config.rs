//! Cache configuration and watermark tuple.
//!
//! One plain, `serde`-derived struct with a `Default` impl, built with a
//! small builder rather than a long positional constructor.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Paired size thresholds the evictor uses to avoid oscillating between
/// eviction-active and eviction-idle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Watermarks {
    pub low_target: u64,
    pub low_hysteresis: u64,
    pub high_target: u64,
    pub high_hysteresis: u64,
}

impl Watermarks {
    /// Derive a reasonable watermark tuple from a single size limit, the
    /// way most buffer pools size their knobs off one "capacity" number.
    pub fn from_size_limit(size_limit: u64) -> Self {
        Self {
            low_target: size_limit * 7 / 10,
            low_hysteresis: size_limit * 8 / 10,
            high_target: size_limit,
            high_hysteresis: size_limit * 9 / 10,
        }
    }

    pub fn validate(&self) -> bool {
        self.low_target <= self.low_hysteresis
            && self.low_hysteresis <= self.high_hysteresis
            && self.high_hysteresis <= self.high_target
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total resident byte budget; also used to derive default watermarks.
    pub size_limit: u64,
    pub watermarks: Watermarks,
    pub eviction_period: Duration,
    pub cleaner_period: Duration,
    pub cleaner_iterations: usize,
    /// Shared worker-pool thread count (client fetches + cache flushes +
    /// checkpoint clones all share one pool).
    pub worker_threads: usize,
}

impl CacheConfig {
    pub fn new(size_limit: u64) -> Self {
        Self {
            size_limit,
            watermarks: Watermarks::from_size_limit(size_limit),
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_limit: 64 * 1024 * 1024,
            watermarks: Watermarks::from_size_limit(64 * 1024 * 1024),
            eviction_period: Duration::from_secs(1),
            cleaner_period: Duration::from_secs(1),
            cleaner_iterations: 16,
            worker_threads: 4,
        }
    }
}
