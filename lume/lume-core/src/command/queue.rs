//! Command queue with a ring of recyclable command pool items.
//!
//! Each pool item bundles one native allocator with a fixed set of pre-allocated
//! command lists. A thread keeps a plain `(ring index, device generation, epoch)`
//! copy of the item it last acquired from; the copy goes stale when the device
//! generation moves on ([`crate::GraphicsDevice::reset_command_allocation`]) or
//! when another thread recycles the item.

use super::list::{CommandList, ListOrigin, PooledList};
use super::Fence;
use crate::backend::{NativeCommandAllocator, NativeCommandList, NativeQueue, Submission};
use crate::barrier::ResourceBarrierEngine;
use crate::device::DeviceShared;
use crate::diagnostics::LogCategory;
use crate::dictionary::{ConcurrentDictionary, DictionaryConfig, DictionaryGrowth};
use crate::error::{RhiError, RhiResult};
use crate::handle_pool::Handle;
use crate::memory::StackArena;
use crate::QueueType;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::ThreadId;

pub type QueueHandle = Handle<QueueEntry>;

const THREAD_CACHE_LIMIT: usize = 1 << 16;

/// Device-side entry for a queue; fences refer to queues through it.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub(crate) native: Arc<dyn NativeQueue>,
    pub(crate) queue_type: QueueType,
}

impl QueueEntry {
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedPool {
    index: usize,
    generation: u64,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ThreadCacheEntry {
    pool: Option<CachedPool>,
    /// Lists acquired by this thread that have not been executed or dropped.
    open_lists: u32,
}

pub(crate) struct CommandPoolItem {
    allocator: Box<dyn NativeCommandAllocator>,
    slots: Vec<Option<PooledList>>,
    next_slot: usize,
    in_use: bool,
    outstanding: usize,
    /// Must be reached before `allocator` may be reset.
    fence_value: u64,
}

impl CommandPoolItem {
    fn take_list(&mut self) -> Option<(usize, PooledList)> {
        let count = self.slots.len();
        for step in 0..count {
            let slot = (self.next_slot + step) % count;
            if let Some(list) = self.slots[slot].take() {
                self.next_slot = (slot + 1) % count;
                self.outstanding += 1;
                self.in_use = true;
                return Some((slot, list));
            }
        }
        None
    }
}

#[derive(Default)]
struct RingSlot {
    item: Option<CommandPoolItem>,
    /// Bumped every time the item's allocator is reset.
    epoch: u64,
}

pub(crate) struct QueueInner {
    pub(crate) handle: QueueHandle,
    pub(crate) queue_type: QueueType,
    pub(crate) device: Arc<DeviceShared>,
    pub(crate) native: Arc<dyn NativeQueue>,
    submitted: AtomicU64,
    submit_lock: Mutex<()>,
    ring: Box<[Mutex<RingSlot>]>,
    ring_cursor: AtomicUsize,
    thread_cache: ConcurrentDictionary<ThreadId, ThreadCacheEntry>,
    /// Device generation the thread cache was last pruned at.
    pruned_generation: AtomicU64,
}

impl QueueInner {
    /// Drops cache entries of threads with no open list whose pool item belongs to an
    /// older generation. Once the cache is half full every idle entry goes.
    fn prune_thread_cache(&self, generation: u64) {
        let previous = self.pruned_generation.swap(generation, Ordering::AcqRel);
        let crowded = self.thread_cache.len() >= THREAD_CACHE_LIMIT / 2;
        if previous == generation && !crowded {
            return;
        }
        let removed = self.thread_cache.retain(|_, entry| {
            entry.open_lists > 0
                || (!crowded && entry.pool.is_some_and(|p| p.generation == generation))
        });
        if removed > 0 {
            log::debug!(
                target: "lume::submission",
                "{:?} queue dropped {} idle thread cache entries",
                self.queue_type,
                removed
            );
        }
    }

    fn create_pool_item(&self) -> RhiResult<CommandPoolItem> {
        let options = &self.device.options;
        let mut allocator = self.native.create_command_allocator()?;
        let mut slots = Vec::with_capacity(options.command_lists_per_pool);
        for _ in 0..options.command_lists_per_pool.max(1) {
            let native = allocator.allocate_list(self.queue_type)?;
            let scratch = self
                .device
                .arena
                .carve_stack_arena(options.command_list_scratch_bytes)?;
            slots.push(Some(PooledList {
                native,
                scratch,
                engine: ResourceBarrierEngine::new(self.device.caps.texture_layouts),
            }));
        }
        Ok(CommandPoolItem {
            allocator,
            slots,
            next_slot: 0,
            in_use: false,
            outstanding: 0,
            fence_value: 0,
        })
    }

    /// Takes a list from the item this thread cached. `None` when the cache is stale;
    /// `Some(None)` when the item is current but has no free list left.
    fn take_cached(&self, cached: CachedPool) -> Option<Option<(ListOrigin, PooledList)>> {
        let mut slot = lock(&self.ring[cached.index]);
        if slot.epoch != cached.epoch {
            return None;
        }
        let epoch = slot.epoch;
        let item = slot.item.as_mut()?;
        Some(item.take_list().map(|(list_slot, list)| {
            (
                ListOrigin::Pooled {
                    ring_index: cached.index,
                    slot: list_slot,
                    epoch,
                },
                list,
            )
        }))
    }

    /// Advances around the ring to the next item that is idle, waits for its fence and
    /// recycles it.
    fn take_from_ring(&self) -> RhiResult<Option<(ListOrigin, PooledList)>> {
        let len = self.ring.len();
        let start = self.ring_cursor.fetch_add(1, Ordering::Relaxed);
        for step in 0..len {
            let index = (start + step) % len;
            let mut slot = match self.ring[index].try_lock() {
                Ok(slot) => slot,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => continue,
            };
            if slot.item.as_ref().is_some_and(|item| item.in_use) {
                continue;
            }
            if slot.item.is_none() {
                slot.item = Some(self.create_pool_item()?);
            }
            slot.epoch += 1;
            let epoch = slot.epoch;
            let Some(item) = slot.item.as_mut() else {
                continue;
            };
            if self.native.completed_value() < item.fence_value {
                log::debug!(
                    target: "lume::submission",
                    "waiting for fence {} before recycling pool item {}",
                    item.fence_value,
                    index
                );
                self.native.wait_for_value(item.fence_value);
            }
            item.allocator.reset()?;
            item.next_slot = 0;
            let Some((list_slot, list)) = item.take_list() else {
                continue;
            };
            return Ok(Some((
                ListOrigin::Pooled {
                    ring_index: index,
                    slot: list_slot,
                    epoch,
                },
                list,
            )));
        }
        Ok(None)
    }

    fn overflow_list(&self) -> RhiResult<(ListOrigin, PooledList)> {
        self.device.diagnostics.warning(
            LogCategory::Submission,
            "acquire_command_list",
            format!(
                "{:?} queue command pool exhausted; allocating a list outside the pool",
                self.queue_type
            ),
        );
        let mut allocator = self.native.create_command_allocator()?;
        let native = allocator.allocate_list(self.queue_type)?;
        let scratch = StackArena::with_capacity(self.device.options.command_list_scratch_bytes)?;
        Ok((
            ListOrigin::Overflow { allocator },
            PooledList {
                native,
                scratch,
                engine: ResourceBarrierEngine::new(self.device.caps.texture_layouts),
            },
        ))
    }

    /// Returns a list to its pool item once it is executed or abandoned.
    pub(crate) fn release(
        &self,
        thread: ThreadId,
        origin: ListOrigin,
        list: PooledList,
        submitted: Option<u64>,
    ) {
        self.thread_cache.update(&thread, |entry| {
            entry.open_lists = entry.open_lists.saturating_sub(1);
        });
        let ListOrigin::Pooled {
            ring_index,
            slot,
            epoch,
        } = origin
        else {
            return;
        };
        let mut ring_slot = lock(&self.ring[ring_index]);
        if ring_slot.epoch != epoch {
            log::error!(
                target: "lume::submission",
                "pool item {} was recycled while a list from it was outstanding",
                ring_index
            );
            return;
        }
        let Some(item) = ring_slot.item.as_mut() else {
            return;
        };
        if let Some(value) = submitted {
            item.fence_value = item.fence_value.max(value);
        }
        item.slots[slot] = Some(list);
        item.outstanding = item.outstanding.saturating_sub(1);
        if item.outstanding == 0 {
            item.in_use = false;
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let last = self.submitted.load(Ordering::Acquire);
        self.native.wait_for_value(last);
        lock(&self.device.queues).remove(self.handle);
    }
}

/// A command queue. Cloning shares the queue.
#[derive(Clone)]
pub struct CommandQueue {
    pub(crate) inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        handle: QueueHandle,
        queue_type: QueueType,
        native: Arc<dyn NativeQueue>,
    ) -> Self {
        let ring = (0..device.options.command_pool_ring_size.max(1))
            .map(|_| Mutex::new(RingSlot::default()))
            .collect();
        let thread_cache = ConcurrentDictionary::with_config(
            "command pool thread cache",
            DictionaryConfig {
                capacity: 64,
                growth: DictionaryGrowth::Rehash {
                    max_capacity: THREAD_CACHE_LIMIT,
                },
            },
        );
        Self {
            inner: Arc::new(QueueInner {
                handle,
                queue_type,
                device,
                native,
                submitted: AtomicU64::new(0),
                submit_lock: Mutex::new(()),
                ring,
                ring_cursor: AtomicUsize::new(0),
                thread_cache,
                pruned_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.inner.handle
    }

    pub fn queue_type(&self) -> QueueType {
        self.inner.queue_type
    }

    /// Value of the most recent submission.
    pub fn last_submitted_value(&self) -> u64 {
        self.inner.submitted.load(Ordering::Acquire)
    }

    pub fn completed_value(&self) -> u64 {
        self.inner.native.completed_value()
    }

    /// Threads currently holding an entry in this queue's command pool cache.
    pub fn cached_thread_count(&self) -> usize {
        self.inner.thread_cache.len()
    }

    /// Blocks until everything submitted so far has completed.
    pub fn wait_idle(&self) {
        self.inner
            .native
            .wait_for_value(self.last_submitted_value());
    }

    /// Hands out a command list in the recording state.
    ///
    /// Acquiring while this thread still holds an un-executed list from this queue is
    /// a usage error; it is reported and the acquire still succeeds.
    pub fn acquire_command_list(&self) -> RhiResult<CommandList> {
        const FUNCTION: &str = "acquire_command_list";
        let inner = &self.inner;
        let thread = std::thread::current().id();
        let generation = inner.device.command_pool_generation.load(Ordering::Acquire);
        inner.prune_thread_cache(generation);

        let entry = inner
            .thread_cache
            .get_or_add(thread, ThreadCacheEntry::default);
        if entry.open_lists > 0 {
            inner.device.diagnostics.error(
                LogCategory::Submission,
                FUNCTION,
                format!(
                    "thread {:?} acquired a second {:?} command list before executing the first",
                    thread, inner.queue_type
                ),
            );
        }

        let cached = entry.pool.filter(|c| c.generation == generation);
        let taken = match cached.and_then(|c| inner.take_cached(c)) {
            Some(taken) => taken,
            None => inner.take_from_ring().inspect_err(|e| {
                inner
                    .device
                    .diagnostics
                    .error(LogCategory::Submission, FUNCTION, e.to_string())
            })?,
        };
        let (origin, mut list) = match taken {
            Some(taken) => taken,
            None => inner.overflow_list()?,
        };

        let pool = match origin {
            ListOrigin::Pooled {
                ring_index, epoch, ..
            } => Some(CachedPool {
                index: ring_index,
                generation,
                epoch,
            }),
            ListOrigin::Overflow { .. } => entry.pool,
        };
        let updated = inner.thread_cache.update(&thread, |entry| {
            entry.pool = pool;
            entry.open_lists += 1;
        });
        if !updated {
            // Pruned by another thread since the lookup above.
            inner.thread_cache.add(
                thread,
                ThreadCacheEntry {
                    pool,
                    open_lists: entry.open_lists + 1,
                },
            );
        }

        list.scratch.reset();
        list.engine.reset();
        if let Err(e) = list.native.begin() {
            inner
                .device
                .diagnostics
                .error(LogCategory::Submission, FUNCTION, e.to_string());
            inner.release(thread, origin, list, None);
            return Err(e);
        }
        Ok(CommandList::new(Arc::clone(inner), thread, origin, list))
    }

    /// Submits `lists` in order as one native submission after the queue waits for
    /// `wait_fences`. Returns the fence signalled when all of them complete.
    pub fn execute_command_lists(
        &self,
        lists: Vec<CommandList>,
        wait_fences: &[Fence],
    ) -> RhiResult<Fence> {
        const FUNCTION: &str = "execute_command_lists";
        let inner = &self.inner;
        let diagnostics = &inner.device.diagnostics;
        for list in &lists {
            if !Arc::ptr_eq(&list.queue, inner) {
                let err = RhiError::Usage("command list belongs to another queue".into());
                diagnostics.error(LogCategory::Submission, FUNCTION, err.to_string());
                return Err(err);
            }
            if !list.is_committed() {
                let err = RhiError::Usage("command list was never committed".into());
                diagnostics.error(LogCategory::Submission, FUNCTION, err.to_string());
                return Err(err);
            }
        }

        let mut waits = Vec::with_capacity(wait_fences.len());
        for fence in wait_fences {
            // Work on one queue completes in submission order.
            if fence.queue == inner.handle {
                continue;
            }
            match inner.device.queue_native(fence.queue) {
                Some(native) => waits.push((native, fence.value)),
                None => {
                    let err = RhiError::StaleHandle("queue");
                    diagnostics.error(
                        LogCategory::Submission,
                        FUNCTION,
                        format!("{} waits on a queue that no longer exists", fence),
                    );
                    return Err(err);
                }
            }
        }

        let value = {
            let _submit = lock(&inner.submit_lock);
            let value = inner.submitted.load(Ordering::Acquire) + 1;
            let natives: Vec<&dyn NativeCommandList> =
                lists.iter().map(|list| list.native()).collect();
            inner
                .native
                .submit(Submission {
                    lists: &natives,
                    waits: &waits,
                    signal_value: value,
                })
                .inspect_err(|e| {
                    diagnostics.error(LogCategory::Submission, FUNCTION, e.to_string())
                })?;
            inner.submitted.store(value, Ordering::Release);
            value
        };
        log::trace!(
            target: "lume::submission",
            "{:?} queue submitted {} lists, signal {}",
            inner.queue_type,
            lists.len(),
            value
        );
        for mut list in lists {
            list.mark_submitted(value);
        }
        Ok(Fence {
            queue: inner.handle,
            value,
        })
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("handle", &self.inner.handle)
            .field("queue_type", &self.inner.queue_type)
            .field("submitted", &self.last_submitted_value())
            .finish()
    }
}
