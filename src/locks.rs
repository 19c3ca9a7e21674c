//! Lock primitives the pin protocol rests on.
//!
//! Two lock classes, built on `parking_lot::{Mutex, RwLock, Condvar}` rather
//! than the `std::sync` equivalents:
//!
//! - [`PageLock`]: a reader/writer lock that can track whether its current
//!   exclusive holder is doing an "expensive" operation (disk I/O). Used
//!   for `value_rwlock` and for the two named pending locks
//!   (`pending_lock_expensive` / `pending_lock_cheap`) in `page_table.rs`.
//! - [`NonBlockingMutex`]: a mutex whose only blocking entry point is
//!   explicit, so callers are forced to acknowledge that a blocking
//!   acquisition is only safe while holding at most `pair.mutex`.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};

/// A reader/writer lock that records whether its exclusive holder is
/// performing an expensive (I/O) operation.
///
/// The flag is advisory bookkeeping, not enforcement: callers that are
/// about to hold the lock across disk I/O call [`PageLock::write_expensive`]
/// instead of `write`, so that other components (the checkpointer, in
/// particular) can tell a page is mid-write rather than merely modified.
pub struct PageLock<T> {
    inner: RwLock<T>,
    expensive_hold: AtomicBool,
}

impl<T> PageLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
            expensive_hold: AtomicBool::new(false),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    /// Acquire the lock exclusively for an operation that will block on
    /// disk I/O. The "expensive" flag is visible via [`PageLock::is_expensive_held`]
    /// for the duration of the returned guard.
    pub fn write_expensive(&self) -> ExpensiveWriteGuard<'_, T> {
        let guard = self.inner.write();
        self.expensive_hold.store(true, Ordering::Release);
        ExpensiveWriteGuard {
            guard: Some(guard),
            flag: &self.expensive_hold,
        }
    }

    pub fn is_expensive_held(&self) -> bool {
        self.expensive_hold.load(Ordering::Acquire)
    }
}

pub struct ExpensiveWriteGuard<'a, T> {
    guard: Option<RwLockWriteGuard<'a, T>>,
    flag: &'a AtomicBool,
}

impl<'a, T> std::ops::Deref for ExpensiveWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> std::ops::DerefMut for ExpensiveWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for ExpensiveWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        self.flag.store(false, Ordering::Release);
    }
}

/// A single-writer, non-blocking-by-default mutex.
///
/// Held exclusively for the entire duration of a disk write of a pair, or
/// while a clone is outstanding. [`NonBlockingMutex::try_lock`] is
/// always safe to call with any other lock held; [`NonBlockingMutex::lock`]
/// (blocking) must only be called while holding at most `pair.mutex`, per
/// the global lock order.
pub struct NonBlockingMutex<T> {
    inner: parking_lot::Mutex<T>,
}

impl<T> NonBlockingMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: parking_lot::Mutex::new(value),
        }
    }

    pub fn try_lock(&self) -> Option<parking_lot::MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Blocking acquisition. Caller must hold at most `pair.mutex`.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, T> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expensive_flag_tracks_holder() {
        let lock = PageLock::new(0u32);
        assert!(!lock.is_expensive_held());
        {
            let _g = lock.write_expensive();
            assert!(lock.is_expensive_held());
        }
        assert!(!lock.is_expensive_held());
    }

    #[test]
    fn non_blocking_mutex_try_lock_fails_when_held() {
        let m = NonBlockingMutex::new(0u32);
        let _g = m.lock();
        assert!(m.try_lock().is_none());
    }
}
