//! The cache entry.
//!
//! Identity fields set once at creation, a pin count, a dirty flag, and a
//! page-aligned-ish byte buffer, behind a three-lock partition rather than
//! a single `RwLock`.

use crate::cachefile::Cachefile;
use crate::locks::{NonBlockingMutex, PageLock};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Size/attribute bundle returned alongside a page's bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeAttrs {
    pub size: u64,
}

/// Outcome of `fetch`.
pub struct FetchResult {
    pub value: Vec<u8>,
    pub attrs: SizeAttrs,
    pub dirty: bool,
    pub disk_data: Option<Vec<u8>>,
}

/// Context passed to the `flush` callback.
pub struct FlushCtx {
    pub write: bool,
    pub keep: bool,
    pub for_checkpoint: bool,
    pub is_clone: bool,
}

/// Whether a partial eviction is worth doing in-thread or needs to be
/// dispatched to a worker.
pub enum EvictionCost {
    Cheap,
    RequiresIo,
}

/// Callbacks attached to a pair at creation. One implementation is shared
/// (via `Arc`) by every pair belonging to the same cachefile; no per-pair
/// callback set is stored, only a shared reference to the one the owning
/// cachefile registered.
pub trait PairCallbacks: Send + Sync {
    fn fetch(&self, cachefile: &Cachefile, block: u64) -> crate::error::Result<FetchResult>;

    fn flush(
        &self,
        cachefile: &Cachefile,
        block: u64,
        value: &[u8],
        disk_data: &Option<Vec<u8>>,
        ctx: FlushCtx,
    ) -> crate::error::Result<()>;

    fn partial_eviction_estimate(&self, _value: &[u8]) -> Option<(u64, EvictionCost)> {
        None
    }

    fn partial_eviction(&self, _value: &mut Vec<u8>) -> crate::error::Result<Option<SizeAttrs>> {
        Ok(None)
    }

    fn cleaner(&self, _value: &[u8]) -> bool {
        false
    }

    /// Produce a standalone snapshot of `value`. Subsequent writers may
    /// proceed without coordinating with whoever is writing the clone out.
    fn clone_value(&self, value: &[u8], attrs: SizeAttrs) -> (Vec<u8>, SizeAttrs) {
        (value.to_vec(), attrs)
    }
}

/// Protected by `pair.mutex`: the clock counter and pending-list backlinks
/// (the backlinks themselves live in `page_table::Slot`, guarded by the
/// list lock; this struct holds only what the mutex itself guards).
pub(crate) struct PairState {
    pub count: u8,
}

/// Protected by `value_rwlock`.
pub(crate) struct PairValue {
    pub data: Vec<u8>,
    pub attrs: SizeAttrs,
    pub dirty: bool,
}

/// Protected by `disk_nb_mutex`.
#[derive(Default)]
pub(crate) struct PairDisk {
    pub cloned_value: Option<Vec<u8>>,
    pub cloned_attrs: SizeAttrs,
    pub disk_data: Option<Vec<u8>>,
}

pub(crate) const MAX_CLOCK_COUNT: u8 = 5;

/// One cached page.
pub struct Pair {
    pub file: Arc<Cachefile>,
    pub block: u64,
    pub hash: u64,

    pub(crate) state: parking_lot::Mutex<PairState>,
    pub(crate) value: PageLock<PairValue>,
    pub(crate) disk: NonBlockingMutex<PairDisk>,

    /// Dual-protected: mutual exclusion against a concurrent begin-checkpoint
    /// comes from the pending locks in `page_table.rs`, not from this flag's
    /// atomicity alone.
    pub(crate) checkpoint_pending: AtomicBool,

    pub callbacks: Arc<dyn PairCallbacks>,
    pub extra: Option<Arc<dyn Any + Send + Sync>>,

    /// Arena slot this pair currently occupies in `page_table::PairList`,
    /// giving `evict`/`pending_pairs_remove` O(1) lookup instead of a
    /// bucket-chain walk. `usize::MAX` means "not yet inserted".
    pub(crate) slot_index: AtomicUsize,
}

pub(crate) const NOT_INSERTED: usize = usize::MAX;

impl Pair {
    pub fn new(
        file: Arc<Cachefile>,
        block: u64,
        hash: u64,
        callbacks: Arc<dyn PairCallbacks>,
        extra: Option<Arc<dyn Any + Send + Sync>>,
        fetched: FetchResult,
    ) -> Self {
        Self {
            file,
            block,
            hash,
            state: parking_lot::Mutex::new(PairState { count: 1 }),
            value: PageLock::new(PairValue {
                data: fetched.value,
                attrs: fetched.attrs,
                dirty: fetched.dirty,
            }),
            disk: NonBlockingMutex::new(PairDisk {
                disk_data: fetched.disk_data,
                ..Default::default()
            }),
            checkpoint_pending: AtomicBool::new(false),
            callbacks,
            extra,
            slot_index: AtomicUsize::new(NOT_INSERTED),
        }
    }

    pub(crate) fn slot_index(&self) -> Option<usize> {
        match self.slot_index.load(Ordering::Acquire) {
            NOT_INSERTED => None,
            idx => Some(idx),
        }
    }

    /// Current resident size: live value bytes plus any outstanding clone.
    pub fn resident_size(&self) -> u64 {
        let value = self.value.read();
        let disk = self.disk.try_lock();
        let cloned = disk.map(|d| d.cloned_attrs.size).unwrap_or(0);
        value.attrs.size + cloned
    }

    pub fn is_checkpoint_pending(&self) -> bool {
        self.checkpoint_pending.load(Ordering::Acquire)
    }

    /// Clock "touch": bump the count towards `MAX_CLOCK_COUNT`, giving the
    /// pair another sweep's worth of second chances.
    pub fn touch(&self) {
        let mut state = self.state.lock();
        if state.count < MAX_CLOCK_COUNT {
            state.count += 1;
        }
    }

    /// Exposes the clock-counter mutex to the evictor's sweep. Kept as an
    /// explicit accessor rather than a public field since every other
    /// caller should go through `touch`.
    pub(crate) fn clock_state(&self) -> parking_lot::MutexGuard<'_, PairState> {
        self.state.lock()
    }
}

impl std::fmt::Debug for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair")
            .field("file", &self.file.filenum)
            .field("block", &self.block)
            .finish()
    }
}
