//! Pinning in-memory page cache core: a page table with a pin/unpin
//! protocol, a CLOCK-based evictor, a copy-on-write checkpointer, and a
//! background cleaner, all serialized by one global lock order.
//!
//! This crate has no binary target. Downstream crates depend on it and
//! supply the callback implementations in [`pair::PairCallbacks`],
//! [`cachefile::FileCallbacks`], and [`checkpoint::CheckpointLog`] — the
//! on-disk format, the write-ahead log, and the transaction manager all
//! live outside this crate.

pub mod cache;
pub mod cachefile;
pub mod checkpoint;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod evictor;
pub mod jobs;
pub mod locks;
pub mod metrics;
pub mod page_table;
pub mod pair;

pub use cache::{Cache, PinGuard};
pub use cachefile::{Cachefile, CachefileList, FileCallbacks, FileId};
pub use checkpoint::{CheckpointLog, CheckpointState, Checkpointer};
pub use cleaner::Cleaner;
pub use config::{CacheConfig, Watermarks};
pub use error::{CacheError, Result};
pub use evictor::Evictor;
pub use jobs::{BackgroundJobManager, WorkerPool};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pair::{EvictionCost, FetchResult, FlushCtx, Pair, PairCallbacks, SizeAttrs};

/// Install a `tracing_subscriber::fmt` subscriber driven by `RUST_LOG`
/// (`EnvFilter`). Opt-in: nothing in this crate calls this on its own, so
/// embedding applications that already run their own subscriber are never
/// second-guessed.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
