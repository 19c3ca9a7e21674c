//! Background job manager and the shared worker pool it
//! schedules onto.
//!
//! A `crossbeam::queue::SegQueue` task queue drained by a fixed set of named
//! OS threads. `BackgroundJobManager` adds the per-file in-flight counter
//! and drain barrier that `close_file` and `end_checkpoint` wait on.

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of worker threads draining a shared task queue.
///
/// One instance backs the client fetch pool, the cache flush pool, and the
/// (smaller) checkpoint-clone pool; callers size each instance independently
/// via [`WorkerPool::new`].
pub struct WorkerPool {
    queue: Arc<SegQueue<Task>>,
    shutdown: Arc<AtomicBool>,
    parked: Arc<Condvar>,
    parked_lock: Arc<Mutex<()>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, num_threads: usize) -> Arc<Self> {
        let queue: Arc<SegQueue<Task>> = Arc::new(SegQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let parked = Arc::new(Condvar::new());
        let parked_lock = Arc::new(Mutex::new(()));

        let mut handles = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            let parked = parked.clone();
            let parked_lock = parked_lock.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || loop {
                    if let Some(task) = queue.pop() {
                        task();
                        continue;
                    }
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let mut guard = parked_lock.lock();
                    if queue.is_empty() && !shutdown.load(Ordering::Acquire) {
                        parked.wait_for(&mut guard, Duration::from_millis(50));
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Arc::new(Self {
            queue,
            shutdown,
            parked,
            parked_lock,
            handles: Mutex::new(handles),
        })
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(task));
        self.parked.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.parked.notify_all();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tracks in-flight background work for one cachefile and exposes a drain
/// barrier. Used by `close_file` (quiesce all clone/flush jobs for the
/// file) and by `end_checkpoint` (wait for foreground-scheduled clone
/// writes submitted to the checkpoint-clone pool).
pub struct BackgroundJobManager {
    pool: Arc<WorkerPool>,
    in_flight: AtomicU64,
    drained: Condvar,
    drain_lock: Mutex<()>,
}

impl BackgroundJobManager {
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            in_flight: AtomicU64::new(0),
            drained: Condvar::new(),
            drain_lock: Mutex::new(()),
        })
    }

    /// Submit a job, tracked until it completes.
    pub fn submit<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let this = Arc::clone(self);
        self.pool.submit(move || {
            job();
            this.complete_one();
        });
    }

    fn complete_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.drain_lock.lock();
            self.drained.notify_all();
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Block until every job submitted so far has completed.
    pub fn drain(&self) {
        let mut guard = self.drain_lock.lock();
        while self.in_flight.load(Ordering::Acquire) > 0 {
            self.drained.wait_for(&mut guard, Duration::from_millis(50));
        }
    }
}
