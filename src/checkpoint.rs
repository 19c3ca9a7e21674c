//! Checkpoint protocol: begin/end state machine, pending-bit scan, clone
//! coordination.
//!
//! A dirty-page scan feeds a background writer; the four-lock acquisition
//! sequence and pending-bit resolution protocol implement the
//! copy-on-write handshake between a checkpoint and a concurrent pinner.

use crate::cachefile::CachefileList;
use crate::error::{CacheError, Result};
use crate::jobs::BackgroundJobManager;
use crate::metrics::Metrics;
use crate::pair::{FlushCtx, Pair, SizeAttrs};
use crate::page_table::PairList;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// The checkpoint state machine: `Idle -> Begun -> Writing ->
/// Ended -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Idle,
    Begun,
    Writing,
    Ended,
}

/// External collaborator supplying LSNs and log records").
pub trait CheckpointLog: Send + Sync {
    fn checkpoint_lsn(&self) -> u64;
    fn log_begin_checkpoint(&self, lsn: u64) -> Result<()>;
    fn log_end_checkpoint(&self, lsn: u64) -> Result<()>;
}

pub struct Checkpointer {
    table: Arc<PairList>,
    cachefiles: Arc<CachefileList>,
    logger: Arc<dyn CheckpointLog>,
    metrics: Arc<Metrics>,
    state: Mutex<CheckpointState>,
    current_lsn: Mutex<Option<u64>>,
    /// `m_checkpoint_clones_bjm` in the source design: tracks foreground
    /// clone writes submitted during §4.4 pending resolution so
    /// `end_checkpoint` can drain them.
    pub clones_bjm: Arc<BackgroundJobManager>,
}

impl Checkpointer {
    pub fn new(
        table: Arc<PairList>,
        cachefiles: Arc<CachefileList>,
        logger: Arc<dyn CheckpointLog>,
        metrics: Arc<Metrics>,
        clones_bjm: Arc<BackgroundJobManager>,
    ) -> Self {
        Self {
            table,
            cachefiles,
            logger,
            metrics,
            state: Mutex::new(CheckpointState::Idle),
            current_lsn: Mutex::new(None),
            clones_bjm,
        }
    }

    pub fn state(&self) -> CheckpointState {
        *self.state.lock()
    }

    /// Exclusive: only one checkpoint may run at a time.
    ///
    /// Lock acquisition order is: `pending_lock_expensive`, then (via
    /// `CachefileList::with_exclusive`)
    /// `cachefile_list.lock`, then `pending_lock_cheap` for the mark pass
    /// itself. `list_lock` is taken internally by
    /// `PairList::mark_for_checkpoint` for the whole ring walk, matching
    /// position 2 in the order.
    pub fn begin_checkpoint(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != CheckpointState::Idle {
                return Err(CacheError::AlreadyExists);
            }
            *state = CheckpointState::Begun;
        }

        let _expensive = self.table.pending_lock_expensive.write();

        let lsn = self.cachefiles.with_exclusive(|files| {
            let lsn = self.logger.checkpoint_lsn();
            self.logger.log_begin_checkpoint(lsn)?;
            for file in files {
                file.file_callbacks.log_fassociate_during_checkpoint(file)?;
                file.set_for_checkpoint(true);
            }

            let _cheap = self.table.pending_lock_cheap.write();
            let marked = self.table.mark_for_checkpoint(|pair| pair.file.is_for_checkpoint());
            debug!(marked, "begin_checkpoint marked pending pairs");

            Ok(lsn)
        })?;

        *self.current_lsn.lock() = Some(lsn);
        *self.state.lock() = CheckpointState::Writing;
        self.metrics.checkpoints_begun.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resolve a pinner's observation of `checkpoint_pending`.
    /// Called with the pair's value lock already held (reader or writer) —
    /// either suffices to exclude a concurrent mutator, since cloning here
    /// only copies bytes out, not a state mutation of `value_data` itself.
    ///
    /// The pending-list splice happens first, under the list lock, *before*
    /// `pending_lock_cheap` is taken to flip the bit, since the cheap lock
    /// is a leaf lock that may not have the list lock taken after it.
    pub fn resolve_pending(&self, pair: &Arc<Pair>, data: &[u8], attrs: SizeAttrs, dirty: bool) {
        self.table.pending_pairs_remove(pair);

        let was_pending = {
            let _cheap = self.table.pending_lock_cheap.read();
            pair.checkpoint_pending.swap(false, Ordering::AcqRel)
        };

        if !was_pending || !dirty {
            return;
        }

        let (clone_value, clone_attrs) = pair.callbacks.clone_value(data, attrs);
        {
            let mut disk = pair.disk.lock();
            disk.cloned_value = Some(clone_value);
            disk.cloned_attrs = clone_attrs;
        }
        self.metrics.clones_produced.fetch_add(1, Ordering::Relaxed);
        debug!(block = pair.block, "checkpoint clone produced");

        let job_pair = pair.clone();
        self.clones_bjm.submit(move || {
            let mut disk = job_pair.disk.lock();
            let Some(clone_bytes) = disk.cloned_value.clone() else {
                return;
            };
            let disk_data = disk.disk_data.clone();
            if let Err(err) = job_pair.callbacks.flush(
                &job_pair.file,
                job_pair.block,
                &clone_bytes,
                &disk_data,
                FlushCtx {
                    write: true,
                    keep: true,
                    for_checkpoint: true,
                    is_clone: true,
                },
            ) {
                tracing::warn!(block = job_pair.block, %err, "checkpoint clone flush failed, will retry next checkpoint");
            }
            disk.cloned_value = None;
        });
    }

    /// Walk the pending list, flush every dirty pair (clone if one exists,
    /// else the live value), drain the clone pool, fsync-equivalent each
    /// participating file, log the end record.
    pub fn end_checkpoint(&self, aggressive: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != CheckpointState::Writing {
                return Err(CacheError::NotFound);
            }
            *state = CheckpointState::Ended;
        }

        for pair in self.table.snapshot_pending() {
            let guard = pair.value.write();
            let dirty = guard.dirty;
            if dirty {
                let mut disk = pair.disk.try_lock();
                let (bytes, is_clone): (Vec<u8>, bool) =
                    match disk.as_mut().and_then(|d| d.cloned_value.clone()) {
                        Some(bytes) => (bytes, true),
                        None => (guard.data.clone(), false),
                    };
                let disk_data = disk.as_ref().and_then(|d| d.disk_data.clone());
                pair.callbacks.flush(
                    &pair.file,
                    pair.block,
                    &bytes,
                    &disk_data,
                    FlushCtx {
                        write: true,
                        keep: true,
                        for_checkpoint: true,
                        is_clone,
                    },
                )?;
                if let Some(d) = disk.as_mut() {
                    d.cloned_value = None;
                }
            }
            pair.checkpoint_pending.store(false, Ordering::Release);
            drop(guard);
            self.table.pending_pairs_remove(&pair);
        }

        self.clones_bjm.drain();

        let files = self.cachefiles.snapshot();
        for file in &files {
            if file.is_for_checkpoint() {
                file.file_callbacks.checkpoint_userdata(file)?;
            }
        }

        let lsn = self.current_lsn.lock().take().unwrap_or(0);
        self.logger.log_end_checkpoint(lsn)?;
        for file in &files {
            if file.is_for_checkpoint() {
                file.file_callbacks.end_checkpoint_userdata(file)?;
            }
        }

        for filenum in self.cachefiles.drain_pending_removal() {
            if let Some(file) = self.cachefiles.remove(filenum) {
                if file.unlink_on_close() {
                    let _ = std::fs::remove_file(&file.path);
                }
            }
        }
        for file in &files {
            file.set_for_checkpoint(false);
        }

        let _ = aggressive;
        self.metrics.checkpoints_ended.fetch_add(1, Ordering::Relaxed);
        *self.state.lock() = CheckpointState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::{Cachefile, FileCallbacks, FileId};
    use crate::jobs::WorkerPool;
    use crate::pair::{FetchResult, PairCallbacks};
    use std::fs::OpenOptions;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FlushCounter {
        flushes: Arc<AtomicUsize>,
    }

    impl PairCallbacks for FlushCounter {
        fn fetch(&self, _cachefile: &Cachefile, _block: u64) -> Result<FetchResult> {
            unreachable!()
        }
        fn flush(
            &self,
            _cachefile: &Cachefile,
            _block: u64,
            _value: &[u8],
            _disk_data: &Option<Vec<u8>>,
            ctx: FlushCtx,
        ) -> Result<()> {
            assert!(ctx.for_checkpoint);
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct NoopFileCallbacks;
    impl FileCallbacks for NoopFileCallbacks {
        fn log_fassociate_during_checkpoint(&self, _cachefile: &Cachefile) -> Result<()> {
            Ok(())
        }
        fn begin_checkpoint_userdata(&self, _cachefile: &Cachefile, _lsn: u64) -> Result<()> {
            Ok(())
        }
        fn checkpoint_userdata(&self, _cachefile: &Cachefile) -> Result<()> {
            Ok(())
        }
        fn end_checkpoint_userdata(&self, _cachefile: &Cachefile) -> Result<()> {
            Ok(())
        }
        fn close_userdata(&self, _cachefile: &Cachefile) -> Result<()> {
            Ok(())
        }
    }

    struct FixedLog;
    impl CheckpointLog for FixedLog {
        fn checkpoint_lsn(&self) -> u64 {
            100
        }
        fn log_begin_checkpoint(&self, _lsn: u64) -> Result<()> {
            Ok(())
        }
        fn log_end_checkpoint(&self, _lsn: u64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn checkpoint_of_pinned_pages_flushes_only_dirty_block() {
        // Scenario 1: pin block 1 dirty, block 2 clean; begin
        // checkpoint; unpin both; end checkpoint. Only block 1 flushes.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let flushes = Arc::new(AtomicUsize::new(0));
        let callbacks: Arc<dyn PairCallbacks> = Arc::new(FlushCounter { flushes: flushes.clone() });
        let pool = WorkerPool::new("test-ckpt", 1);
        let cachefile = Arc::new(Cachefile {
            filenum: 1,
            path,
            fileid: FileId { dev: 0, ino: 1 },
            file,
            callbacks: callbacks.clone(),
            file_callbacks: Arc::new(NoopFileCallbacks),
            for_checkpoint: AtomicBool::new(false),
            unlink_on_close: AtomicBool::new(false),
            jobs: crate::jobs::BackgroundJobManager::new(pool.clone()),
        });

        let table = Arc::new(PairList::new());
        let block1 = Arc::new(Pair::new(
            cachefile.clone(),
            1,
            1,
            callbacks.clone(),
            None,
            FetchResult {
                value: vec![1u8; 8],
                attrs: SizeAttrs { size: 8 },
                dirty: true,
                disk_data: None,
            },
        ));
        let block2 = Arc::new(Pair::new(
            cachefile.clone(),
            2,
            2,
            callbacks.clone(),
            None,
            FetchResult {
                value: vec![2u8; 8],
                attrs: SizeAttrs { size: 8 },
                dirty: false,
                disk_data: None,
            },
        ));
        table.put(block1.clone());
        table.put(block2.clone());

        let cachefiles = Arc::new(CachefileList::new(pool.clone()));
        cachefiles
            .open(
                &cachefile.path,
                false,
                callbacks.clone(),
                Arc::new(NoopFileCallbacks),
            )
            .unwrap();

        let metrics = Arc::new(Metrics::default());
        let clones_bjm = crate::jobs::BackgroundJobManager::new(pool);
        let checkpointer = Checkpointer::new(table.clone(), cachefiles, Arc::new(FixedLog), metrics, clones_bjm);

        checkpointer.begin_checkpoint().unwrap();
        assert_eq!(checkpointer.state(), CheckpointState::Writing);
        checkpointer.end_checkpoint(false).unwrap();

        assert_eq!(flushes.load(Ordering::Relaxed), 1);
        assert_eq!(checkpointer.state(), CheckpointState::Idle);
    }

    #[test]
    fn begin_checkpoint_rejects_concurrent_begin() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(PairList::new());
        let pool = WorkerPool::new("test-ckpt2", 1);
        let cachefiles = Arc::new(CachefileList::new(pool.clone()));
        let metrics = Arc::new(Metrics::default());
        let clones_bjm = crate::jobs::BackgroundJobManager::new(pool);
        let checkpointer = Checkpointer::new(table, cachefiles, Arc::new(FixedLog), metrics, clones_bjm);
        let _ = dir;

        checkpointer.begin_checkpoint().unwrap();
        let err = checkpointer.begin_checkpoint().unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists));
    }
}
