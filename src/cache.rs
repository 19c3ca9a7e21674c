//! Top-level composition: `create`/`open_file`/`close_file`/`get_and_pin`/
//! `unpin`/`verify`.
//!
//! One struct owns the table, the evictor, and the worker pools, and
//! exposes pin/unpin plus lifecycle setters. The pin/unpin pair itself is
//! expressed as an RAII guard (`PinGuard`, released on `Drop`) rather than
//! a pair of free functions — see `DESIGN.md` for the rationale.

use crate::cachefile::{Cachefile, CachefileList, FileCallbacks};
use crate::checkpoint::{CheckpointLog, CheckpointState, Checkpointer};
use crate::cleaner::Cleaner;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::evictor::Evictor;
use crate::jobs::{BackgroundJobManager, WorkerPool};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::page_table::PairList;
use crate::pair::{FetchResult, FlushCtx, Pair, PairCallbacks, PairValue, SizeAttrs};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

enum ValueGuard {
    Read(RwLockReadGuard<'static, PairValue>),
    Write(RwLockWriteGuard<'static, PairValue>),
}

impl ValueGuard {
    fn dirty(&self) -> bool {
        match self {
            ValueGuard::Read(g) => g.dirty,
            ValueGuard::Write(g) => g.dirty,
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            ValueGuard::Read(g) => &g.data,
            ValueGuard::Write(g) => &g.data,
        }
    }

    fn attrs(&self) -> SizeAttrs {
        match self {
            ValueGuard::Read(g) => g.attrs,
            ValueGuard::Write(g) => g.attrs,
        }
    }
}

/// # Safety
/// The returned guard's lifetime is tied to `PinGuard::pair`, which keeps
/// the `Pair` (and its `PageLock`) alive for at least as long as the guard
/// lives; `PinGuard` declares `guard` before `pair` so `Drop` releases the
/// lock first. The lock is never accessed after its owning `Pair` could be
/// dropped.
unsafe fn extend_read(g: RwLockReadGuard<'_, PairValue>) -> RwLockReadGuard<'static, PairValue> {
    std::mem::transmute(g)
}

/// # Safety: see [`extend_read`].
unsafe fn extend_write(g: RwLockWriteGuard<'_, PairValue>) -> RwLockWriteGuard<'static, PairValue> {
    std::mem::transmute(g)
}

/// RAII realization of the pin/unpin pair: dropping the guard
/// performs `unpin`'s three steps. `mark_dirty`/`set_attrs` correspond to
/// `unpin`'s `new_dirty`/`new_attr` parameters.
pub struct PinGuard {
    guard: Option<ValueGuard>,
    pair: Arc<Pair>,
    evictor: Arc<Evictor>,
    checkpointer: Arc<Checkpointer>,
    new_dirty: bool,
    new_attrs: Option<SizeAttrs>,
}

impl PinGuard {
    pub fn data(&self) -> &[u8] {
        self.guard.as_ref().unwrap().data()
    }

    /// `None` if this guard was taken in read mode. A write-pinner that was
    /// already holding this pin before a `begin_checkpoint` call would have
    /// missed `get_and_pin`'s own pending-bit resolution, so this resolves
    /// pending again (a no-op if already cleared) against the pre-mutation
    /// bytes before handing out mutable access — the "clone-before-modify"
    /// guarantee §4.4 describes for a pinner that observes pending go true
    /// while it already holds the lock.
    pub fn data_mut(&mut self) -> Option<&mut Vec<u8>> {
        let ValueGuard::Write(g) = self.guard.as_mut().unwrap() else {
            return None;
        };
        self.checkpointer.resolve_pending(&self.pair, &g.data, g.attrs, true);
        let ValueGuard::Write(g) = self.guard.as_mut().unwrap() else {
            unreachable!()
        };
        Some(&mut g.data)
    }

    pub fn attrs(&self) -> SizeAttrs {
        self.guard.as_ref().unwrap().attrs()
    }

    pub fn is_dirty(&self) -> bool {
        self.guard.as_ref().unwrap().dirty()
    }

    /// Corresponds to `unpin`'s `new_dirty` argument.
    pub fn mark_dirty(&mut self) {
        self.new_dirty = true;
    }

    /// Corresponds to `unpin`'s `new_attr` argument.
    pub fn set_attrs(&mut self, attrs: SizeAttrs) {
        self.new_attrs = Some(attrs);
    }

    pub fn block(&self) -> u64 {
        self.pair.block
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        match guard {
            ValueGuard::Write(mut g) => {
                let old_size = g.attrs.size;
                if self.new_dirty {
                    g.dirty = true;
                }
                if let Some(attrs) = self.new_attrs.take() {
                    g.attrs = attrs;
                }
                let delta = g.attrs.size as i64 - old_size as i64;
                drop(g);
                if delta != 0 {
                    self.evictor.account_insert(delta);
                }
            }
            ValueGuard::Read(g) => drop(g),
        }
    }
}

/// Top-level cache.
pub struct Cache {
    config: CacheConfig,
    table: Arc<PairList>,
    cachefiles: Arc<CachefileList>,
    evictor: Arc<Evictor>,
    cleaner: Arc<Cleaner>,
    checkpointer: Arc<Checkpointer>,
    client_pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
    checkpoint_period_millis: AtomicU64,
    checkpoint_thread: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    checkpoint_thread_shutdown: std::sync::atomic::AtomicBool,
    shutdown: std::sync::atomic::AtomicBool,
}

impl Cache {
    /// `create(size_limit, initial_lsn, logger)`. `size_limit` and
    /// the watermark/period knobs live in `config` (see `DESIGN.md`'s Open
    /// Question decisions); `initial_lsn` is handed to the log collaborator
    /// by the caller before `create` runs, so it is accepted here only for
    /// observability.
    pub fn create(config: CacheConfig, initial_lsn: u64, logger: Arc<dyn CheckpointLog>) -> Arc<Self> {
        debug!(initial_lsn, "creating cache");
        let table = Arc::new(PairList::new());
        let metrics = Arc::new(Metrics::default());
        let client_pool = WorkerPool::new("bufcache-client", config.worker_threads);
        let cache_pool = WorkerPool::new("bufcache-flush", config.worker_threads);
        let clone_pool = WorkerPool::new("bufcache-clone", (config.worker_threads / 2).max(1));

        let cachefiles = Arc::new(CachefileList::new(cache_pool.clone()));
        let evictor = Evictor::new(&config, table.clone(), cache_pool, metrics.clone());
        evictor.start();
        let cleaner = Cleaner::new(table.clone(), metrics.clone(), config.cleaner_period, config.cleaner_iterations);
        cleaner.start();

        let clones_bjm = BackgroundJobManager::new(clone_pool);
        let checkpointer = Arc::new(Checkpointer::new(
            table.clone(),
            cachefiles.clone(),
            logger,
            metrics.clone(),
            clones_bjm,
        ));

        Arc::new(Self {
            config,
            table,
            cachefiles,
            evictor,
            cleaner,
            checkpointer,
            client_pool,
            metrics,
            checkpoint_period_millis: AtomicU64::new(0),
            checkpoint_thread: parking_lot::Mutex::new(None),
            checkpoint_thread_shutdown: std::sync::atomic::AtomicBool::new(false),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.client_pool
    }

    // --- file registry -----------------------------------------------

    pub fn open_file(
        &self,
        path: &Path,
        create: bool,
        callbacks: Arc<dyn PairCallbacks>,
        file_callbacks: Arc<dyn FileCallbacks>,
    ) -> Result<Arc<Cachefile>> {
        self.cachefiles.open(path, create, callbacks, file_callbacks)
    }

    /// `close_file`: quiesce background jobs, flush all dirty
    /// pairs, remove pairs, optionally unlink. Registry removal is
    /// deferred to `end_checkpoint` if the file is currently marked
    /// `for_checkpoint`.
    pub fn close_file(&self, cachefile: &Arc<Cachefile>, unlink: bool) -> Result<()> {
        cachefile.set_unlink_on_close(unlink);
        cachefile.jobs.drain();

        for pair in self.table.snapshot_ring() {
            if pair.file.filenum != cachefile.filenum {
                continue;
            }
            let guard = pair.value.write();
            if guard.dirty {
                let disk = pair.disk.try_lock();
                let disk_data = disk.as_ref().and_then(|d| d.disk_data.clone());
                pair.callbacks.flush(
                    cachefile,
                    pair.block,
                    &guard.data,
                    &disk_data,
                    FlushCtx {
                        write: true,
                        keep: false,
                        for_checkpoint: false,
                        is_clone: false,
                    },
                )?;
            }
            let size = guard.attrs.size;
            drop(guard);
            self.table.evict(&pair);
            self.evictor.account_insert(-(size as i64));
        }

        cachefile.file_callbacks.close_userdata(cachefile)?;

        if cachefile.is_for_checkpoint() {
            self.cachefiles.queue_removal(cachefile.filenum);
        } else if let Some(removed) = self.cachefiles.remove(cachefile.filenum) {
            if removed.unlink_on_close() {
                std::fs::remove_file(&removed.path)?;
            }
        }
        Ok(())
    }

    // --- pin protocol ---------------------------------------------------

    /// `get_and_pin`. Blocks on a cache miss's fetch and on the
    /// flow-control condition if resident size is past the high watermark.
    pub fn get_and_pin(&self, cachefile: &Arc<Cachefile>, block: u64, hash: u64, write: bool) -> Result<PinGuard> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::ShuttingDown);
        }
        let existing = self.table.find_pair(cachefile.filenum, block, hash);

        let pair = match existing {
            Some(pair) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                pair
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                let fetched = cachefile.callbacks.fetch(cachefile, block)?;
                let size = fetched.attrs.size;
                let pair = Arc::new(Pair::new(
                    cachefile.clone(),
                    block,
                    hash,
                    cachefile.callbacks.clone(),
                    None,
                    fetched,
                ));
                self.table.put(pair.clone());
                self.evictor.account_insert(size as i64);
                pair
            }
        };

        let value_guard = if write {
            ValueGuard::Write(unsafe { extend_write(pair.value.write()) })
        } else {
            ValueGuard::Read(unsafe { extend_read(pair.value.read()) })
        };

        self.checkpointer
            .resolve_pending(&pair, value_guard.data(), value_guard.attrs(), value_guard.dirty());

        self.evictor.wait_if_over_watermark();

        Ok(PinGuard {
            guard: Some(value_guard),
            pair,
            evictor: self.evictor.clone(),
            checkpointer: self.checkpointer.clone(),
            new_dirty: false,
            new_attrs: None,
        })
    }

    /// Non-blocking variant: `Ok(None)` on a
    /// miss or if pinning would block.
    pub fn maybe_get_and_pin(&self, cachefile: &Arc<Cachefile>, block: u64, hash: u64, write: bool) -> Result<Option<PinGuard>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::ShuttingDown);
        }
        let Some(pair) = self.table.find_pair(cachefile.filenum, block, hash) else {
            return Ok(None);
        };

        let value_guard = if write {
            match pair.value.try_write() {
                Some(g) => ValueGuard::Write(unsafe { extend_write(g) }),
                None => return Ok(None),
            }
        } else {
            match pair.value.try_read() {
                Some(g) => ValueGuard::Read(unsafe { extend_read(g) }),
                None => return Ok(None),
            }
        };

        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        self.checkpointer
            .resolve_pending(&pair, value_guard.data(), value_guard.attrs(), value_guard.dirty());

        Ok(Some(PinGuard {
            guard: Some(value_guard),
            pair,
            evictor: self.evictor.clone(),
            checkpointer: self.checkpointer.clone(),
            new_dirty: false,
            new_attrs: None,
        }))
    }

    // --- evictor passthrough --------------------------------------------

    pub fn reserve_memory(&self, fraction: f64) -> u64 {
        self.evictor.reserve_memory(fraction)
    }

    pub fn release_reserved_memory(&self, n: u64) {
        self.evictor.release_reserved_memory(n)
    }

    // --- checkpoint -------------------------------------------------------

    pub fn begin_checkpoint(&self) -> Result<()> {
        self.checkpointer.begin_checkpoint()
    }

    pub fn end_checkpoint(&self, aggressive: bool) -> Result<()> {
        self.checkpointer.end_checkpoint(aggressive)
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        self.checkpointer.state()
    }

    /// `0` disables the automatic periodic checkpoint thread (the default).
    /// A single background thread driven by a minimal periodic timer is one
    /// of several scheduling strategies an embedder may choose; this leaves
    /// its cadence to the embedder.
    pub fn set_checkpoint_period(self: &Arc<Self>, period: Duration) {
        self.checkpoint_period_millis
            .store(period.as_millis() as u64, Ordering::Release);
        let mut thread = self.checkpoint_thread.lock();
        if thread.is_none() && period > Duration::ZERO {
            let this = Arc::clone(self);
            *thread = Some(
                std::thread::Builder::new()
                    .name("bufcache-checkpoint".to_string())
                    .spawn(move || this.checkpoint_loop())
                    .expect("failed to spawn checkpoint thread"),
            );
        }
    }

    fn checkpoint_loop(&self) {
        loop {
            let millis = self.checkpoint_period_millis.load(Ordering::Acquire);
            if millis == 0 || self.checkpoint_thread_shutdown.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(Duration::from_millis(millis));
            if self.checkpoint_thread_shutdown.load(Ordering::Acquire) {
                return;
            }
            if self.checkpointer.state() == CheckpointState::Idle {
                if self.begin_checkpoint().is_ok() {
                    let _ = self.end_checkpoint(false);
                }
            }
        }
    }

    pub fn set_cleaner_period(&self, period: Duration) {
        self.cleaner.set_period(period);
    }

    pub fn set_cleaner_iterations(&self, iterations: usize) {
        self.cleaner.set_iterations(iterations);
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Count of pairs currently resident, for tests and operator tooling.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_resident(&self, cachefile: &Arc<Cachefile>, block: u64, hash: u64) -> bool {
        self.table.find_pair(cachefile.filenum, block, hash).is_some()
    }

    /// Debug walk asserting that the pending-flag count matches the pending
    /// list's length and that the sum of resident pair sizes matches the
    /// evictor's tracked size. Callers should treat a failure as fatal.
    pub fn verify(&self) -> Result<()> {
        let ring = self.table.snapshot_ring();
        let pending = self.table.snapshot_pending();
        let flagged = ring.iter().filter(|p| p.is_checkpoint_pending()).count();
        if flagged != pending.len() {
            return Err(CacheError::ResourceExhausted(format!(
                "pending-flag mismatch: {flagged} pairs flagged pending but {} on pending list",
                pending.len()
            )));
        }
        let total: u64 = ring.iter().map(|p| p.resident_size()).sum();
        if total != self.evictor.size_current() {
            return Err(CacheError::ResourceExhausted(format!(
                "size accounting mismatch: sum of pair sizes {total} != size_current {}",
                self.evictor.size_current()
            )));
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.checkpoint_thread_shutdown.store(true, Ordering::Release);
        self.checkpoint_period_millis.store(0, Ordering::Release);
        if let Some(handle) = self.checkpoint_thread.lock().take() {
            let _ = handle.join();
        }
        self.cleaner.shutdown();
        self.evictor.shutdown();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
