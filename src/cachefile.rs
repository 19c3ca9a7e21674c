//! Open-file registry.
//!
//! Wraps an open file handle and uses a `(dev, ino)` dedupe check to
//! reject two opens of the same underlying file.

use crate::error::{CacheError, Result};
use crate::jobs::{BackgroundJobManager, WorkerPool};
use crate::pair::PairCallbacks;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Callbacks a cachefile registers for checkpoint bookkeeping. The `note_*` hooks default to no-ops since most
/// collaborators have nothing to track there.
pub trait FileCallbacks: Send + Sync {
    fn log_fassociate_during_checkpoint(&self, cachefile: &Cachefile) -> Result<()>;
    fn begin_checkpoint_userdata(&self, cachefile: &Cachefile, checkpoint_lsn: u64) -> Result<()>;
    fn checkpoint_userdata(&self, cachefile: &Cachefile) -> Result<()>;
    fn end_checkpoint_userdata(&self, cachefile: &Cachefile) -> Result<()>;
    fn close_userdata(&self, cachefile: &Cachefile) -> Result<()>;

    fn note_pin_by_checkpoint(&self, _cachefile: &Cachefile) {}
    fn note_unpin_by_checkpoint(&self, _cachefile: &Cachefile) {}
}

/// Stable on-disk identity used to reject two opens of the same file
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl FileId {
    fn of(file: &File) -> Result<Self> {
        let meta = file.metadata()?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// A registered open file.
pub struct Cachefile {
    pub filenum: u64,
    pub path: PathBuf,
    pub fileid: FileId,
    pub file: File,

    pub callbacks: Arc<dyn PairCallbacks>,
    pub file_callbacks: Arc<dyn FileCallbacks>,

    pub for_checkpoint: AtomicBool,
    pub unlink_on_close: AtomicBool,

    /// Quiesces clone/flush jobs for this file on close.
    pub jobs: Arc<BackgroundJobManager>,
}

impl Cachefile {
    pub fn is_for_checkpoint(&self) -> bool {
        self.for_checkpoint.load(Ordering::Acquire)
    }

    pub fn set_for_checkpoint(&self, value: bool) {
        self.for_checkpoint.store(value, Ordering::Release);
    }

    pub fn unlink_on_close(&self) -> bool {
        self.unlink_on_close.load(Ordering::Acquire)
    }

    pub fn set_unlink_on_close(&self, value: bool) {
        self.unlink_on_close.store(value, Ordering::Release);
    }
}

impl std::fmt::Debug for Cachefile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cachefile")
            .field("filenum", &self.filenum)
            .field("path", &self.path)
            .finish()
    }
}

/// Registry of open cachefiles: filenum allocation and fileid dedupe,
/// guarded by one lock per the global lock order's `cachefile_list.lock`
///.
pub struct CachefileList {
    inner: parking_lot::RwLock<Inner>,
    next_filenum: AtomicU64,
    worker_pool: Arc<WorkerPool>,
    /// Filenums of files closed while a checkpoint had them marked
    /// `for_checkpoint`; actually removed at `end_checkpoint` step 5
    ///.
    pending_removal: parking_lot::Mutex<Vec<u64>>,
}

struct Inner {
    by_filenum: HashMap<u64, Arc<Cachefile>>,
    by_fileid: HashMap<FileId, u64>,
}

impl CachefileList {
    pub fn new(worker_pool: Arc<WorkerPool>) -> Self {
        Self {
            inner: parking_lot::RwLock::new(Inner {
                by_filenum: HashMap::new(),
                by_fileid: HashMap::new(),
            }),
            next_filenum: AtomicU64::new(1),
            worker_pool,
            pending_removal: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn queue_removal(&self, filenum: u64) {
        self.pending_removal.lock().push(filenum);
    }

    pub fn drain_pending_removal(&self) -> Vec<u64> {
        std::mem::take(&mut self.pending_removal.lock())
    }

    /// Hold the registry exclusively for the duration of `f` (global lock
    /// order position 3, `cachefile_list.lock`): used by `begin_checkpoint`
    /// to mark every open file `for_checkpoint` atomically with respect to
    /// concurrent `open`/`close`.
    pub fn with_exclusive<R>(&self, f: impl FnOnce(&[Arc<Cachefile>]) -> Result<R>) -> Result<R> {
        let inner = self.inner.write();
        let mut files: Vec<_> = inner.by_filenum.values().cloned().collect();
        files.sort_by_key(|cf| cf.filenum);
        f(&files)
    }

    /// Open `path`, reject a duplicate on-disk identity, register the file
    /// under a fresh filenum.
    pub fn open(
        &self,
        path: &Path,
        create: bool,
        callbacks: Arc<dyn PairCallbacks>,
        file_callbacks: Arc<dyn FileCallbacks>,
    ) -> Result<Arc<Cachefile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        let fileid = FileId::of(&file)?;

        let mut inner = self.inner.write();
        if inner.by_fileid.contains_key(&fileid) {
            return Err(CacheError::DuplicateFileid(path.display().to_string()));
        }

        let filenum = self.next_filenum.fetch_add(1, Ordering::AcqRel);
        let cachefile = Arc::new(Cachefile {
            filenum,
            path: path.to_path_buf(),
            fileid,
            file,
            callbacks,
            file_callbacks,
            for_checkpoint: AtomicBool::new(false),
            unlink_on_close: AtomicBool::new(false),
            jobs: BackgroundJobManager::new(self.worker_pool.clone()),
        });

        inner.by_filenum.insert(filenum, cachefile.clone());
        inner.by_fileid.insert(fileid, filenum);
        Ok(cachefile)
    }

    pub fn get(&self, filenum: u64) -> Option<Arc<Cachefile>> {
        self.inner.read().by_filenum.get(&filenum).cloned()
    }

    pub fn remove(&self, filenum: u64) -> Option<Arc<Cachefile>> {
        let mut inner = self.inner.write();
        let cachefile = inner.by_filenum.remove(&filenum)?;
        inner.by_fileid.remove(&cachefile.fileid);
        Some(cachefile)
    }

    /// Snapshot of every currently open file, in filenum order, for use by
    /// `begin_checkpoint`'s association/mark pass.
    pub fn snapshot(&self) -> Vec<Arc<Cachefile>> {
        let inner = self.inner.read();
        let mut files: Vec<_> = inner.by_filenum.values().cloned().collect();
        files.sort_by_key(|f| f.filenum);
        files
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_filenum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
