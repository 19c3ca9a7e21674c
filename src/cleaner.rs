//! Periodic non-evicting sweep that invokes the cleaner callback.
//!
//! A named thread looping on a fixed period, doing bounded work per wakeup.
//! Unlike a flusher that also evicts, the cleaner never mutates table
//! membership — it only calls out to a callback.

use crate::metrics::Metrics;
use crate::page_table::PairList;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct Cleaner {
    table: Arc<PairList>,
    metrics: Arc<Metrics>,
    period_millis: AtomicU64,
    iterations: AtomicUsize,
    shutdown: AtomicBool,
    thread: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Cleaner {
    pub fn new(table: Arc<PairList>, metrics: Arc<Metrics>, period: Duration, iterations: usize) -> Arc<Self> {
        Arc::new(Self {
            table,
            metrics,
            period_millis: AtomicU64::new(period.as_millis() as u64),
            iterations: AtomicUsize::new(iterations),
            shutdown: AtomicBool::new(false),
            thread: parking_lot::Mutex::new(None),
        })
    }

    /// Takes effect on the cleaner thread's next sleep, matching the
    /// background threads' "observe between iterations" cancellation model
    ///.
    pub fn set_period(&self, period: Duration) {
        self.period_millis.store(period.as_millis() as u64, Ordering::Release);
    }

    pub fn set_iterations(&self, iterations: usize) {
        self.iterations.store(iterations, Ordering::Release);
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("bufcache-cleaner".to_string())
            .spawn(move || this.run_loop())
            .expect("failed to spawn cleaner thread");
        *self.thread.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.run_once();
            std::thread::sleep(Duration::from_millis(self.period_millis.load(Ordering::Acquire)));
        }
    }

    /// Run up to `iterations` steps: pick the pair at `cleaner_head`,
    /// attempt a non-blocking shared acquire, invoke the callback outside
    /// the list lock, advance.
    pub fn run_once(&self) -> usize {
        let iterations = self.iterations.load(Ordering::Acquire);
        let mut invoked = 0;
        for _ in 0..iterations {
            let Some(pair) = self.table.cleaner_candidate() else {
                break;
            };
            if let Some(guard) = pair.value.try_read() {
                let did_work = pair.callbacks.cleaner(&guard.data);
                drop(guard);
                if did_work {
                    invoked += 1;
                    self.metrics.cleaner_invocations.fetch_add(1, Ordering::Relaxed);
                    debug!(block = pair.block, "cleaner invoked");
                }
            }
            self.table.advance_cleaner();
        }
        invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::{Cachefile, FileCallbacks, FileId};
    use crate::jobs::{BackgroundJobManager, WorkerPool};
    use crate::pair::{FetchResult, FlushCtx, Pair, PairCallbacks, SizeAttrs};
    use std::fs::OpenOptions;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct CountingCleaner {
        count: Arc<StdAtomicUsize>,
    }

    impl PairCallbacks for CountingCleaner {
        fn fetch(&self, _cachefile: &Cachefile, _block: u64) -> crate::error::Result<FetchResult> {
            unreachable!("fixture pairs are pre-populated")
        }
        fn flush(
            &self,
            _cachefile: &Cachefile,
            _block: u64,
            _value: &[u8],
            _disk_data: &Option<Vec<u8>>,
            _ctx: FlushCtx,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        fn cleaner(&self, _value: &[u8]) -> bool {
            self.count.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    struct NoopFileCallbacks;
    impl FileCallbacks for NoopFileCallbacks {
        fn log_fassociate_during_checkpoint(&self, _cachefile: &Cachefile) -> crate::error::Result<()> {
            Ok(())
        }
        fn begin_checkpoint_userdata(&self, _cachefile: &Cachefile, _lsn: u64) -> crate::error::Result<()> {
            Ok(())
        }
        fn checkpoint_userdata(&self, _cachefile: &Cachefile) -> crate::error::Result<()> {
            Ok(())
        }
        fn end_checkpoint_userdata(&self, _cachefile: &Cachefile) -> crate::error::Result<()> {
            Ok(())
        }
        fn close_userdata(&self, _cachefile: &Cachefile) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cleaner_invokes_callback_exactly_k_times_and_keeps_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let count = Arc::new(StdAtomicUsize::new(0));
        let callbacks: Arc<dyn PairCallbacks> = Arc::new(CountingCleaner { count: count.clone() });
        let pool = WorkerPool::new("test-cleaner", 1);
        let cachefile = Arc::new(Cachefile {
            filenum: 1,
            path,
            fileid: FileId { dev: 0, ino: 1 },
            file,
            callbacks: callbacks.clone(),
            file_callbacks: Arc::new(NoopFileCallbacks),
            for_checkpoint: AtomicBool::new(false),
            unlink_on_close: AtomicBool::new(false),
            jobs: BackgroundJobManager::new(pool),
        });

        let table = Arc::new(PairList::new());
        for block in 0..10u64 {
            table.put(Arc::new(Pair::new(
                cachefile.clone(),
                block,
                block,
                callbacks.clone(),
                None,
                FetchResult {
                    value: vec![0u8; 4],
                    attrs: SizeAttrs { size: 4 },
                    dirty: false,
                    disk_data: None,
                },
            )));
        }

        let metrics = Arc::new(Metrics::default());
        let cleaner = Cleaner::new(table.clone(), metrics.clone(), Duration::from_secs(1), 6);
        let invoked = cleaner.run_once();

        assert_eq!(invoked, 6);
        assert_eq!(count.load(Ordering::Relaxed), 6);
        assert_eq!(table.len(), 10);
        assert_eq!(metrics.snapshot().cleaner_invocations, 6);
    }
}
