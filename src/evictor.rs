//! CLOCK-sweep eviction engine: size accounting, watermarks, flow control,
//! partial eviction dispatch.
//!
//! Uses a clock-hand/count decrement shape for the sweep, and a
//! background-thread/watermark structure for flow control.

use crate::config::{CacheConfig, Watermarks};
use crate::jobs::WorkerPool;
use crate::metrics::Metrics;
use crate::page_table::PairList;
use crate::pair::{EvictionCost, FlushCtx, Pair};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Evictor {
    table: Arc<PairList>,
    worker_pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
    watermarks: Watermarks,
    period: Duration,

    size_current: AtomicU64,
    size_reserved: AtomicU64,
    size_evicting: AtomicU64,

    wake: Condvar,
    wake_lock: Mutex<()>,
    flow_control: Condvar,
    flow_lock: Mutex<()>,

    shutdown: AtomicBool,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Evictor {
    pub fn new(config: &CacheConfig, table: Arc<PairList>, worker_pool: Arc<WorkerPool>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            table,
            worker_pool,
            metrics,
            watermarks: config.watermarks,
            period: config.eviction_period,
            size_current: AtomicU64::new(0),
            size_reserved: AtomicU64::new(0),
            size_evicting: AtomicU64::new(0),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
            flow_control: Condvar::new(),
            flow_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("bufcache-evictor".to_string())
            .spawn(move || this.run_loop())
            .expect("failed to spawn evictor thread");
        *self.thread.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(self: &Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.run_eviction();
            let mut guard = self.wake_lock.lock();
            if !self.shutdown.load(Ordering::Acquire) {
                self.wake.wait_for(&mut guard, self.period);
            }
        }
    }

    pub fn size_current(&self) -> u64 {
        self.size_current.load(Ordering::Acquire)
    }

    pub fn size_reserved(&self) -> u64 {
        self.size_reserved.load(Ordering::Acquire)
    }

    pub fn size_evicting(&self) -> u64 {
        self.size_evicting.load(Ordering::Acquire)
    }

    fn occupied(&self) -> u64 {
        self.size_current.load(Ordering::Acquire)
            + self.size_reserved.load(Ordering::Acquire)
            + self.size_evicting.load(Ordering::Acquire)
    }

    /// Called by `get_and_pin` after a fetch changes `attr`. Wakes the eviction thread on demand once past the low-hysteresis
    /// watermark.
    pub fn account_insert(&self, delta: i64) {
        if delta >= 0 {
            self.size_current.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.size_current.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
        self.metrics.set_bytes_resident(self.size_current.load(Ordering::Acquire));
        if self.occupied() > self.watermarks.low_hysteresis {
            self.wake.notify_one();
        }
    }

    fn account_remove(&self, size: u64) {
        self.size_current.fetch_sub(size, Ordering::AcqRel);
        self.metrics.set_bytes_resident(self.size_current.load(Ordering::Acquire));
    }

    pub fn reserve_memory(&self, fraction: f64) -> u64 {
        let bytes = (self.watermarks.high_target as f64 * fraction) as u64;
        self.size_reserved.fetch_add(bytes, Ordering::AcqRel);
        bytes
    }

    pub fn release_reserved_memory(&self, n: u64) {
        self.size_reserved.fetch_sub(n, Ordering::AcqRel);
    }

    pub fn should_client_thread_sleep(&self) -> bool {
        self.occupied() > self.watermarks.high_target
    }

    pub fn should_sleeping_clients_wakeup(&self) -> bool {
        self.occupied() < self.watermarks.high_hysteresis
    }

    /// Block the calling (client) thread until resident size has drained
    /// below the high-hysteresis watermark.
    pub fn wait_if_over_watermark(&self) {
        if !self.should_client_thread_sleep() {
            return;
        }
        let mut guard = self.flow_lock.lock();
        while self.should_client_thread_sleep() {
            self.flow_control.wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    fn broadcast_flow_control_if_ready(&self) {
        if self.should_sleeping_clients_wakeup() {
            let _guard = self.flow_lock.lock();
            self.flow_control.notify_all();
        }
    }

    /// The CLOCK sweep: runs while occupied size exceeds the low
    /// watermark.
    pub fn run_eviction(self: &Arc<Self>) {
        while self.occupied() > self.watermarks.low_target {
            let Some(pair) = self.table.clock_candidate() else {
                break;
            };
            if !self.run_eviction_on_pair(&pair) {
                // Nothing evictable found this pass; avoid a tight spin.
                break;
            }
        }
        self.broadcast_flow_control_if_ready();
    }

    /// Examine the pair at the clock hand. Returns `false` when a full lap
    /// made no progress (caller should stop spinning).
    fn run_eviction_on_pair(self: &Arc<Self>, pair: &Arc<Pair>) -> bool {
        {
            let mut state = pair.clock_state();
            if state.count > 0 {
                state.count -= 1;
                drop(state);
                self.table.advance_clock();
                return true;
            }
        }

        let Some(mut guard) = pair.value.try_write() else {
            self.table.advance_clock();
            return true;
        };

        if let Some((bytes, cost)) = pair.callbacks.partial_eviction_estimate(&guard.data) {
            match cost {
                EvictionCost::Cheap => {
                    if let Ok(Some(new_attrs)) = pair.callbacks.partial_eviction(&mut guard.data) {
                        let delta = new_attrs.size as i64 - guard.attrs.size as i64;
                        guard.attrs = new_attrs;
                        drop(guard);
                        self.account_insert(delta);
                        self.metrics.partial_evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    self.table.advance_clock();
                }
                EvictionCost::RequiresIo => {
                    drop(guard);
                    self.size_evicting.fetch_add(bytes, Ordering::AcqRel);
                    let pair = pair.clone();
                    let this = Arc::clone(self);
                    self.table.advance_clock();
                    self.worker_pool.submit(move || {
                        if let Some(mut guard) = pair.value.try_write() {
                            if let Ok(Some(new_attrs)) = pair.callbacks.partial_eviction(&mut guard.data) {
                                let delta = new_attrs.size as i64 - guard.attrs.size as i64;
                                guard.attrs = new_attrs;
                                drop(guard);
                                this.account_insert(delta);
                            }
                        }
                        this.size_evicting.fetch_sub(bytes, Ordering::AcqRel);
                        this.metrics.partial_evictions.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }
            return true;
        }

        let dirty = guard.dirty;
        drop(guard);
        self.table.advance_clock();
        if !dirty {
            self.evict_pair(pair.clone(), false);
        } else {
            let checkpoint_pending = pair.is_checkpoint_pending();
            let pair = pair.clone();
            let this = Arc::clone(self);
            self.worker_pool.submit(move || {
                this.evict_pair(pair, checkpoint_pending);
            });
        }
        true
    }

    /// Remove `pair` from the table and free its value. A foreground pinner
    /// may have grabbed the pair again in the window between the clock
    /// decision and this call; a failed non-blocking write-acquire here
    /// means the pair has a nonzero pin count and is left resident for the
    /// next sweep.
    pub fn evict_pair(&self, pair: Arc<Pair>, for_checkpoint: bool) -> bool {
        let Some(guard) = pair.value.try_write() else {
            return false;
        };
        let dirty = guard.dirty;
        let size = guard.attrs.size;
        if dirty {
            let disk = pair.disk.try_lock();
            let disk_data = disk.as_ref().and_then(|d| d.disk_data.clone());
            if let Err(err) = pair.callbacks.flush(
                &pair.file,
                pair.block,
                &guard.data,
                &disk_data,
                FlushCtx {
                    write: true,
                    keep: false,
                    for_checkpoint,
                    is_clone: false,
                },
            ) {
                warn!(block = pair.block, %err, "eviction flush failed, leaving pair resident for retry");
                return false;
            }
        }
        drop(guard);
        self.table.evict(&pair);
        self.account_remove(size);
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(block = pair.block, "evicted pair");
        true
    }
}
