//! Thread-safe hash dictionary used for caches and lookup tables.
//!
//! Entries live in a fixed slot array. Each bucket holds the index of the first slot
//! of its collision chain; slots link to the next one through an atomic index. Writers
//! take a per-bucket spin lock (a CAS on a flag), never a table-wide lock, so
//! operations on keys in different buckets proceed in parallel. Free slots form a
//! lock-free stack whose head carries a version tag against ABA.
//!
//! Growth is configured per dictionary: a fixed dictionary stops caching when full,
//! a rehashing one takes the table write lock, doubles the storage and relinks every chain.

use std::cell::UnsafeCell;
use std::collections::hash_map::RandomState;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

const LOG_TARGET: &str = "lume::dictionary";
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryGrowth {
    /// `add` fails once every slot is used; the dictionary keeps serving lookups.
    Fixed,
    /// Double the storage when full, up to `max_capacity` slots.
    Rehash { max_capacity: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct DictionaryConfig {
    pub capacity: usize,
    pub growth: DictionaryGrowth,
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            growth: DictionaryGrowth::Fixed,
        }
    }
}

struct Bucket {
    locked: AtomicBool,
    head: AtomicU32,
}

impl Bucket {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            head: AtomicU32::new(NIL),
        }
    }

    fn lock(&self) -> BucketGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        BucketGuard { bucket: self }
    }
}

struct BucketGuard<'a> {
    bucket: &'a Bucket,
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        self.bucket.locked.store(false, Ordering::Release);
    }
}

struct Slot<K, V> {
    /// Next slot in the collision chain, or in the free list while unused.
    next: AtomicU32,
    entry: UnsafeCell<Option<(K, V)>>,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            entry: UnsafeCell::new(None),
        }
    }
}

struct Table<K, V> {
    buckets: Box<[Bucket]>,
    slots: Box<[Slot<K, V>]>,
    /// `(version << 32) | index` of the first free slot.
    free_head: AtomicU64,
    /// Slots below this index have been handed out at least once.
    watermark: AtomicU32,
    len: AtomicUsize,
}

// Entries are only touched while holding the lock of the bucket whose chain holds
// them, by the single thread that popped the slot from the free list, or under the
// table write lock.
unsafe impl<K: Send, V: Send> Send for Table<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Table<K, V> {}

impl<K, V> Table<K, V> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, NIL as usize - 1);
        Self {
            buckets: (0..capacity.next_power_of_two())
                .map(|_| Bucket::new())
                .collect(),
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            free_head: AtomicU64::new(NIL as u64),
            watermark: AtomicU32::new(0),
            len: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn bucket_index(&self, hash: u64) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let index = head as u32;
            if index == NIL {
                break;
            }
            let next = self.slots[index as usize].next.load(Ordering::Acquire);
            let tagged = (((head >> 32) + 1) << 32) | next as u64;
            match self.free_head.compare_exchange_weak(
                head,
                tagged,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => head = actual,
            }
        }
        let mut mark = self.watermark.load(Ordering::Acquire);
        loop {
            if mark as usize >= self.slots.len() {
                return None;
            }
            match self.watermark.compare_exchange_weak(
                mark,
                mark + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(mark),
                Err(actual) => mark = actual,
            }
        }
    }

    fn push_free(&self, index: u32) {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            self.slots[index as usize]
                .next
                .store(head as u32, Ordering::Release);
            let tagged = (((head >> 32) + 1) << 32) | index as u64;
            match self.free_head.compare_exchange_weak(
                head,
                tagged,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// # Safety
    /// The caller holds the lock of the bucket whose chain contains `index`, or owns the
    /// slot exclusively, and no other reference to the entry is alive.
    #[allow(clippy::mut_from_ref)]
    unsafe fn entry(&self, index: u32) -> &mut Option<(K, V)> {
        &mut *self.slots[index as usize].entry.get()
    }

    /// Walks a locked chain. Returns `(previous, found)` slot indices.
    ///
    /// # Safety
    /// The caller holds the bucket lock.
    unsafe fn find(&self, bucket: &Bucket, key: &K) -> Option<(u32, u32)>
    where
        K: Eq,
    {
        let mut previous = NIL;
        let mut current = bucket.head.load(Ordering::Acquire);
        while current != NIL {
            if matches!(self.entry(current), Some((k, _)) if *k == *key) {
                return Some((previous, current));
            }
            previous = current;
            current = self.slots[current as usize].next.load(Ordering::Acquire);
        }
        None
    }

    /// Links an exclusively owned slot at the head of a locked chain.
    ///
    /// # Safety
    /// The caller holds the bucket lock and owns `index`.
    unsafe fn link(&self, bucket: &Bucket, index: u32, key: K, value: V) {
        *self.entry(index) = Some((key, value));
        self.slots[index as usize]
            .next
            .store(bucket.head.load(Ordering::Acquire), Ordering::Release);
        bucket.head.store(index, Ordering::Release);
        self.len.fetch_add(1, Ordering::AcqRel);
    }
}

enum Insert<K, V> {
    Added(V),
    Exists(V),
    Full(K),
}

/// Concurrent dictionary with per-bucket locking and weakly consistent enumeration.
///
/// Concurrent `add` calls with different keys never lose an entry. Racing `add`/`remove`
/// on the same key leave the dictionary consistent with either outcome.
pub struct ConcurrentDictionary<K, V, S = RandomState> {
    label: &'static str,
    table: RwLock<Table<K, V>>,
    hasher: S,
    growth: DictionaryGrowth,
    overflow_reported: AtomicBool,
}

impl<K: Hash + Eq, V: Clone> ConcurrentDictionary<K, V, RandomState> {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(
            "dictionary",
            DictionaryConfig {
                capacity,
                growth: DictionaryGrowth::Fixed,
            },
        )
    }

    pub fn with_config(label: &'static str, config: DictionaryConfig) -> Self {
        Self::with_hasher(label, config, RandomState::new())
    }
}

impl<K: Hash + Eq, V: Clone, S: BuildHasher> ConcurrentDictionary<K, V, S> {
    pub fn with_hasher(label: &'static str, config: DictionaryConfig, hasher: S) -> Self {
        Self {
            label,
            table: RwLock::new(Table::new(config.capacity)),
            hasher,
            growth: config.growth,
            overflow_reported: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Table<K, V>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.read().capacity()
    }

    fn try_insert<F: FnOnce() -> V>(
        &self,
        hash: u64,
        key: K,
        make: &mut Option<F>,
    ) -> Insert<K, V> {
        let table = self.read();
        let bucket = &table.buckets[table.bucket_index(hash)];
        let _guard = bucket.lock();
        // SAFETY: the bucket lock is held for every entry access below, and the slot
        // returned by `pop_free` is owned by this thread until linked.
        unsafe {
            if let Some((_, found)) = table.find(bucket, &key) {
                if let Some((_, v)) = table.entry(found) {
                    return Insert::Exists(v.clone());
                }
            }
            let Some(index) = table.pop_free() else {
                return Insert::Full(key);
            };
            let Some(make) = make.take() else {
                table.push_free(index);
                return Insert::Full(key);
            };
            let value = make();
            table.link(bucket, index, key, value.clone());
            Insert::Added(value)
        }
    }

    /// Retries after growth. A factory still present when `Full` is returned never ran.
    fn insert<F: FnOnce() -> V>(&self, key: K, make: &mut Option<F>) -> Insert<K, V> {
        let hash = self.hasher.hash_one(&key);
        let mut key = key;
        loop {
            let observed = self.capacity();
            match self.try_insert(hash, key, make) {
                Insert::Full(rejected) => {
                    if !self.grow(observed) {
                        self.report_overflow();
                        return Insert::Full(rejected);
                    }
                    key = rejected;
                }
                done => return done,
            }
        }
    }

    fn report_overflow(&self) {
        if !self.overflow_reported.swap(true, Ordering::AcqRel) {
            log::warn!(
                target: LOG_TARGET,
                "{} is full ({} entries); further entries are not cached",
                self.label,
                self.capacity()
            );
        }
    }

    /// Doubles the storage if the configuration allows it. Returns `true` when the
    /// table now has more room than `observed` (possibly grown by another thread).
    fn grow(&self, observed: usize) -> bool {
        let DictionaryGrowth::Rehash { max_capacity } = self.growth else {
            return false;
        };
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.capacity() > observed {
            return true;
        }
        if table.capacity() >= max_capacity {
            return false;
        }
        let new_capacity = (table.capacity() * 2).min(max_capacity);
        let grown = Table::new(new_capacity);
        for slot in table.slots.iter_mut() {
            if let Some((key, value)) = slot.entry.get_mut().take() {
                let hash = self.hasher.hash_one(&key);
                let bucket = &grown.buckets[grown.bucket_index(hash)];
                // Exclusive access under the write lock; no bucket lock needed.
                let index = grown.watermark.fetch_add(1, Ordering::Relaxed);
                // SAFETY: `grown` is not shared yet and `index` is fresh.
                unsafe { grown.link(bucket, index, key, value) };
            }
        }
        log::debug!(
            target: LOG_TARGET,
            "{} rehashed from {} to {} slots",
            self.label,
            table.capacity(),
            new_capacity
        );
        *table = grown;
        true
    }

    /// Inserts `value` unless `key` is present. Returns `false` when the key already
    /// exists or the dictionary is full (a degraded, non-fatal condition).
    pub fn add(&self, key: K, value: V) -> bool {
        matches!(self.insert(key, &mut Some(|| value)), Insert::Added(_))
    }

    /// Returns the existing value for `key`, or stores and returns `make()`.
    /// When the dictionary is full the made value is returned without being cached.
    ///
    /// `make` runs while the key's bucket is locked and must not use this dictionary.
    pub fn get_or_add(&self, key: K, make: impl FnOnce() -> V) -> V {
        let mut make = Some(make);
        match self.insert(key, &mut make) {
            Insert::Added(v) | Insert::Exists(v) => v,
            Insert::Full(_) => match make.take() {
                Some(make) => make(),
                None => unreachable!("a stored value is reported as added"),
            },
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.remove_if(key, |_| true)
    }

    /// Removes `key` only if `accept` returns true for its current value. The check and
    /// the removal happen under one bucket lock.
    pub fn remove_if(&self, key: &K, accept: impl FnOnce(&V) -> bool) -> Option<V> {
        let hash = self.hasher.hash_one(key);
        let table = self.read();
        let bucket = &table.buckets[table.bucket_index(hash)];
        let removed = {
            let _guard = bucket.lock();
            // SAFETY: bucket lock held.
            unsafe {
                let (previous, found) = table.find(bucket, key)?;
                if !table.entry(found).as_ref().is_some_and(|(_, v)| accept(v)) {
                    return None;
                }
                let next = table.slots[found as usize].next.load(Ordering::Acquire);
                if previous == NIL {
                    bucket.head.store(next, Ordering::Release);
                } else {
                    table.slots[previous as usize]
                        .next
                        .store(next, Ordering::Release);
                }
                let entry = table.entry(found).take();
                (found, entry)
            }
        };
        let (index, entry) = removed;
        table.push_free(index);
        table.len.fetch_sub(1, Ordering::AcqRel);
        entry.map(|(_, v)| v)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hash = self.hasher.hash_one(key);
        let table = self.read();
        let bucket = &table.buckets[table.bucket_index(hash)];
        let _guard = bucket.lock();
        // SAFETY: bucket lock held.
        unsafe {
            let (_, found) = table.find(bucket, key)?;
            table.entry(found).as_ref().map(|(_, v)| v.clone())
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hasher.hash_one(key);
        let table = self.read();
        let bucket = &table.buckets[table.bucket_index(hash)];
        let _guard = bucket.lock();
        // SAFETY: bucket lock held.
        unsafe { table.find(bucket, key).is_some() }
    }

    /// Mutates the value for `key` in place under its bucket lock. Returns `false` if absent.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        let hash = self.hasher.hash_one(key);
        let table = self.read();
        let bucket = &table.buckets[table.bucket_index(hash)];
        let _guard = bucket.lock();
        // SAFETY: bucket lock held.
        unsafe {
            let Some((_, found)) = table.find(bucket, key) else {
                return false;
            };
            match table.entry(found) {
                Some((_, v)) => {
                    f(v);
                    true
                }
                None => false,
            }
        }
    }

    /// Removes every entry for which `keep` returns `false`.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let table = self.read();
        let mut removed = 0;
        for bucket in table.buckets.iter() {
            let _guard = bucket.lock();
            let mut previous = NIL;
            let mut current = bucket.head.load(Ordering::Acquire);
            while current != NIL {
                let next = table.slots[current as usize].next.load(Ordering::Acquire);
                // SAFETY: bucket lock held.
                let drop_entry = unsafe {
                    matches!(table.entry(current), Some((k, v)) if !keep(k, v))
                };
                if drop_entry {
                    if previous == NIL {
                        bucket.head.store(next, Ordering::Release);
                    } else {
                        table.slots[previous as usize]
                            .next
                            .store(next, Ordering::Release);
                    }
                    // SAFETY: bucket lock held; the slot is unlinked before it is freed.
                    unsafe { table.entry(current).take() };
                    table.push_free(current);
                    table.len.fetch_sub(1, Ordering::AcqRel);
                    removed += 1;
                } else {
                    previous = current;
                }
                current = next;
            }
        }
        removed
    }

    /// Lazy walk over the values, one bucket at a time. Entries added or removed
    /// during the walk may or may not be observed, and a rehash during the walk may
    /// yield a value twice. Call again to restart.
    ///
    /// No lock is held between steps, so the dictionary can be mutated (and grown)
    /// from inside the loop.
    pub fn enumerate(&self) -> Enumerate<'_, K, V, S> {
        Enumerate {
            dictionary: self,
            bucket: 0,
            pending: VecDeque::new(),
        }
    }

    /// Values with their keys, same consistency as [`Self::enumerate`].
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        let table = self.read();
        let mut out = Vec::with_capacity(table.len.load(Ordering::Acquire));
        for bucket in table.buckets.iter() {
            let _guard = bucket.lock();
            let mut current = bucket.head.load(Ordering::Acquire);
            while current != NIL {
                // SAFETY: bucket lock held.
                if let Some((k, v)) = unsafe { table.entry(current) } {
                    out.push((k.clone(), v.clone()));
                }
                current = table.slots[current as usize].next.load(Ordering::Acquire);
            }
        }
        out
    }
}

impl<K, V, S> fmt::Debug for ConcurrentDictionary<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ConcurrentDictionary")
            .field("label", &self.label)
            .field("len", &table.len.load(Ordering::Relaxed))
            .field("capacity", &table.capacity())
            .field("growth", &self.growth)
            .finish()
    }
}

/// Iterator returned by [`ConcurrentDictionary::enumerate`].
pub struct Enumerate<'a, K, V, S = RandomState> {
    dictionary: &'a ConcurrentDictionary<K, V, S>,
    bucket: usize,
    /// Values of the last visited bucket not yet yielded.
    pending: VecDeque<V>,
}

impl<K: Hash + Eq, V: Clone, S: BuildHasher> Iterator for Enumerate<'_, K, V, S> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        loop {
            if let Some(v) = self.pending.pop_front() {
                return Some(v);
            }
            let table = self.dictionary.read();
            let bucket = table.buckets.get(self.bucket)?;
            self.bucket += 1;
            let _guard = bucket.lock();
            let mut current = bucket.head.load(Ordering::Acquire);
            while current != NIL {
                // SAFETY: bucket lock held.
                if let Some((_, v)) = unsafe { table.entry(current) } {
                    self.pending.push_back(v.clone());
                }
                current = table.slots[current as usize].next.load(Ordering::Acquire);
            }
        }
    }
}
