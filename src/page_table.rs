//! The page table: bucketed hash index, CLOCK ring, pending list, cleaner
//! cursor.
//!
//! An arena-backed structure where the hash chain, clock ring, and pending
//! list intrusively share the same
//! slot, following the "arena + indices" alternative the design explicitly
//! allows in place of raw intrusive pointers.

use crate::locks::PageLock;
use crate::pair::Pair;
use std::sync::Arc;

/// Load factor above which a bucket doubling runs.
const GROW_LOAD_FACTOR: f64 = 1.0;
/// Load factor below which a bucket halving runs.
const SHRINK_LOAD_FACTOR: f64 = 0.25;
const MIN_BUCKETS: usize = 8;

struct Slot {
    pair: Arc<Pair>,
    bucket_prev: Option<usize>,
    bucket_next: Option<usize>,
    ring_prev: usize,
    ring_next: usize,
    pending_prev: Option<usize>,
    pending_next: Option<usize>,
    on_pending: bool,
}

struct Inner {
    buckets: Vec<Option<usize>>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    len: usize,
    clock_head: Option<usize>,
    cleaner_head: Option<usize>,
    pending_head: Option<usize>,
    pending_tail: Option<usize>,
}

impl Inner {
    fn new() -> Self {
        Self {
            buckets: vec![None; MIN_BUCKETS],
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            clock_head: None,
            cleaner_head: None,
            pending_head: None,
            pending_tail: None,
        }
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) % self.buckets.len()
    }

    fn alloc_slot(&mut self, slot: Slot) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn bucket_insert(&mut self, bucket: usize, idx: usize) {
        let old_head = self.buckets[bucket];
        if let Some(head) = old_head {
            self.slots[head].as_mut().unwrap().bucket_prev = Some(idx);
        }
        let slot = self.slots[idx].as_mut().unwrap();
        slot.bucket_prev = None;
        slot.bucket_next = old_head;
        self.buckets[bucket] = Some(idx);
    }

    fn bucket_unlink(&mut self, bucket: usize, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().unwrap();
            (slot.bucket_prev, slot.bucket_next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().bucket_next = next,
            None => self.buckets[bucket] = next,
        }
        if let Some(n) = next {
            self.slots[n].as_mut().unwrap().bucket_prev = prev;
        }
    }

    /// Insert `idx` into the ring just before `clock_head` (new pairs sweep
    /// last).
    fn ring_insert(&mut self, idx: usize) {
        match self.clock_head {
            None => {
                self.slots[idx].as_mut().unwrap().ring_prev = idx;
                self.slots[idx].as_mut().unwrap().ring_next = idx;
                self.clock_head = Some(idx);
                self.cleaner_head = Some(idx);
            }
            Some(head) => {
                let tail = self.slots[head].as_ref().unwrap().ring_prev;
                self.slots[tail].as_mut().unwrap().ring_next = idx;
                self.slots[head].as_mut().unwrap().ring_prev = idx;
                let slot = self.slots[idx].as_mut().unwrap();
                slot.ring_prev = tail;
                slot.ring_next = head;
            }
        }
    }

    fn ring_remove(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().unwrap();
            (slot.ring_prev, slot.ring_next)
        };
        if prev == idx {
            // sole ring member
            self.clock_head = None;
            self.cleaner_head = None;
        } else {
            self.slots[prev].as_mut().unwrap().ring_next = next;
            self.slots[next].as_mut().unwrap().ring_prev = prev;
            if self.clock_head == Some(idx) {
                self.clock_head = Some(next);
            }
            if self.cleaner_head == Some(idx) {
                self.cleaner_head = Some(next);
            }
        }
    }

    fn pending_insert(&mut self, idx: usize) {
        let slot = self.slots[idx].as_mut().unwrap();
        slot.pending_prev = self.pending_tail;
        slot.pending_next = None;
        slot.on_pending = true;
        match self.pending_tail {
            Some(tail) => self.slots[tail].as_mut().unwrap().pending_next = Some(idx),
            None => self.pending_head = Some(idx),
        }
        self.pending_tail = Some(idx);
    }

    fn pending_remove(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_mut().unwrap();
            if !slot.on_pending {
                return;
            }
            slot.on_pending = false;
            (slot.pending_prev, slot.pending_next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().pending_next = next,
            None => self.pending_head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().pending_prev = prev,
            None => self.pending_tail = prev,
        }
    }

    fn load_factor(&self) -> f64 {
        self.len as f64 / self.buckets.len() as f64
    }

    fn rehash(&mut self, new_bucket_count: usize) {
        let mut new_buckets: Vec<Option<usize>> = vec![None; new_bucket_count];
        let slot_indices: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        for idx in slot_indices {
            let hash = self.slots[idx].as_ref().unwrap().pair.hash;
            let bucket = (hash as usize) % new_bucket_count;
            let old_head = new_buckets[bucket];
            {
                let slot = self.slots[idx].as_mut().unwrap();
                slot.bucket_prev = None;
                slot.bucket_next = old_head;
            }
            if let Some(head) = old_head {
                self.slots[head].as_mut().unwrap().bucket_prev = Some(idx);
            }
            new_buckets[bucket] = Some(idx);
        }
        self.buckets = new_buckets;
    }

    fn maybe_resize(&mut self) {
        if self.load_factor() > GROW_LOAD_FACTOR {
            self.rehash(self.buckets.len() * 2);
        } else if self.load_factor() < SHRINK_LOAD_FACTOR && self.buckets.len() > MIN_BUCKETS {
            let target = (self.buckets.len() / 2).max(MIN_BUCKETS);
            self.rehash(target);
        }
    }
}

/// The page table: hash index, CLOCK ring, pending list, cleaner cursor,
/// and the two pending locks from the global lock order.
pub struct PairList {
    inner: parking_lot::RwLock<Inner>,
    /// Position 1 in the lock order: held in write mode across
    /// `begin_checkpoint`'s whole mark pass; held in write mode by the
    /// evictor across a disk write (`write_expensive`).
    pub pending_lock_expensive: PageLock<()>,
    /// Position 5 (leaf) in the lock order: held briefly by foreground
    /// pinners resolving a pending bit, and by `begin_checkpoint`'s final
    /// mark step.
    pub pending_lock_cheap: PageLock<()>,
}

impl Default for PairList {
    fn default() -> Self {
        Self::new()
    }
}

impl PairList {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(Inner::new()),
            pending_lock_expensive: PageLock::new(()),
            pending_lock_cheap: PageLock::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-locked hash-chain lookup.
    pub fn find_pair(&self, filenum: u64, block: u64, hash: u64) -> Option<Arc<Pair>> {
        let inner = self.inner.read();
        let bucket = inner.bucket_of(hash);
        let mut cur = inner.buckets[bucket];
        while let Some(idx) = cur {
            let slot = inner.slots[idx].as_ref().unwrap();
            if slot.pair.hash == hash && slot.pair.block == block && slot.pair.file.filenum == filenum {
                return Some(slot.pair.clone());
            }
            cur = slot.bucket_next;
        }
        None
    }

    /// Insert at the head of its hash bucket and just before `clock_head`
    /// on the ring. Write-locked.
    pub fn put(&self, pair: Arc<Pair>) {
        let hash = pair.hash;
        let mut inner = self.inner.write();
        let bucket = inner.bucket_of(hash);
        let slot = Slot {
            pair: pair.clone(),
            bucket_prev: None,
            bucket_next: None,
            ring_prev: 0,
            ring_next: 0,
            pending_prev: None,
            pending_next: None,
            on_pending: false,
        };
        let idx = inner.alloc_slot(slot);
        inner.bucket_insert(bucket, idx);
        inner.ring_insert(idx);
        inner.len += 1;
        pair.slot_index
            .store(idx, std::sync::atomic::Ordering::Release);
        inner.maybe_resize();
    }

    /// Remove from hash chain, ring, and pending list. Write-locked. Caller
    /// must already hold `pair.mutex` and have observed a zero pin count
    ///.
    pub fn evict(&self, pair: &Arc<Pair>) {
        let mut inner = self.inner.write();
        let Some(idx) = pair.slot_index() else {
            return;
        };
        let bucket = inner.bucket_of(pair.hash);
        if inner.slots[idx].as_ref().map(|s| s.on_pending).unwrap_or(false) {
            inner.pending_remove(idx);
        }
        inner.ring_remove(idx);
        inner.bucket_unlink(bucket, idx);
        inner.slots[idx] = None;
        inner.free.push(idx);
        inner.len -= 1;
        pair.slot_index
            .store(crate::pair::NOT_INSERTED, std::sync::atomic::Ordering::Release);
        inner.maybe_resize();
    }

    /// Detach `pair` from the pending list without evicting it.
    pub fn pending_pairs_remove(&self, pair: &Arc<Pair>) {
        let mut inner = self.inner.write();
        if let Some(idx) = pair.slot_index() {
            inner.pending_remove(idx);
        }
    }

    /// Walk the clock ring once under a single list-lock hold, setting
    /// `checkpoint_pending` and splicing onto `pending_head` for every
    /// pair `predicate` accepts. Returns the count
    /// marked.
    pub fn mark_for_checkpoint<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Arc<Pair>) -> bool,
    {
        let mut inner = self.inner.write();
        let Some(head) = inner.clock_head else {
            return 0;
        };
        let mut marked = 0;
        let mut cur = head;
        loop {
            let pair = inner.slots[cur].as_ref().unwrap().pair.clone();
            if predicate(&pair) {
                pair.checkpoint_pending
                    .store(true, std::sync::atomic::Ordering::Release);
                if !inner.slots[cur].as_ref().unwrap().on_pending {
                    inner.pending_insert(cur);
                }
                marked += 1;
            }
            cur = inner.slots[cur].as_ref().unwrap().ring_next;
            if cur == head {
                break;
            }
        }
        marked
    }

    /// The pair currently at the clock hand, without advancing it.
    pub fn clock_candidate(&self) -> Option<Arc<Pair>> {
        let inner = self.inner.read();
        inner.clock_head.map(|idx| inner.slots[idx].as_ref().unwrap().pair.clone())
    }

    pub fn advance_clock(&self) {
        let mut inner = self.inner.write();
        if let Some(idx) = inner.clock_head {
            inner.clock_head = Some(inner.slots[idx].as_ref().unwrap().ring_next);
        }
    }

    /// The pair currently at the cleaner cursor, without advancing it.
    pub fn cleaner_candidate(&self) -> Option<Arc<Pair>> {
        let inner = self.inner.read();
        inner
            .cleaner_head
            .map(|idx| inner.slots[idx].as_ref().unwrap().pair.clone())
    }

    pub fn advance_cleaner(&self) {
        let mut inner = self.inner.write();
        if let Some(idx) = inner.cleaner_head {
            inner.cleaner_head = Some(inner.slots[idx].as_ref().unwrap().ring_next);
        }
    }

    /// Walk the whole ring once, yielding every resident pair. Read-locked for the duration of the snapshot;
    /// the walk itself operates on a cloned `Vec<Arc<Pair>>` so the list
    /// lock is not held while the caller marks pending bits.
    pub fn snapshot_ring(&self) -> Vec<Arc<Pair>> {
        let inner = self.inner.read();
        let Some(head) = inner.clock_head else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(inner.len);
        let mut cur = head;
        loop {
            let slot = inner.slots[cur].as_ref().unwrap();
            out.push(slot.pair.clone());
            cur = slot.ring_next;
            if cur == head {
                break;
            }
        }
        out
    }

    /// Snapshot of the pending list in order, for `end_checkpoint`'s walk
    ///.
    pub fn snapshot_pending(&self) -> Vec<Arc<Pair>> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut cur = inner.pending_head;
        while let Some(idx) = cur {
            let slot = inner.slots[idx].as_ref().unwrap();
            out.push(slot.pair.clone());
            cur = slot.pending_next;
        }
        out
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.read().buckets.len()
    }
}
