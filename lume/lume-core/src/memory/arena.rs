//! Thread-safe root arena.

use super::region::VirtualRegion;
use super::stack::StackArena;
use super::{align_up, ArenaError, LOG_TARGET};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Whether an allocation is physically backed right away or only claims address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationState {
    #[default]
    Committed,
    /// Backed lazily through [`MemoryArena::commit`]. Reserved allocations are
    /// page-aligned and rounded up to whole pages.
    Reserved,
}

#[derive(Debug, Clone, Copy)]
pub struct ArenaConfig {
    /// Reserved ceiling; allocations past it fail.
    pub maximum_bytes: usize,
    pub page_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            maximum_bytes: 64 * 1024 * 1024,
            page_size: 4096,
        }
    }
}

/// Root bump allocator. Allocation is a lock-free CAS on the cursor, so a shared
/// reference can be used from any number of threads.
///
/// `allocated_bytes() <= committed_bytes() <= maximum_bytes()` holds at all times.
pub struct MemoryArena {
    region: Arc<VirtualRegion>,
    cursor: AtomicUsize,
    allocated: AtomicUsize,
    reserved: AtomicUsize,
    free_children: Arc<ChildRanges>,
}

/// Committed sub-range once owned by a [`StackArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildRange {
    pub offset: usize,
    pub len: usize,
}

/// Ranges returned by dropped stack arenas, handed out again before the cursor moves.
#[derive(Debug, Default)]
pub(crate) struct ChildRanges {
    ranges: Mutex<Vec<ChildRange>>,
}

impl ChildRanges {
    fn lock(&self) -> MutexGuard<'_, Vec<ChildRange>> {
        self.ranges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn give_back(&self, range: ChildRange) {
        self.lock().push(range);
    }

    /// Smallest free range that holds `bytes`.
    fn take_fitting(&self, bytes: usize) -> Option<ChildRange> {
        let mut ranges = self.lock();
        let (index, _) = ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| r.len >= bytes)
            .min_by_key(|(_, r)| r.len)?;
        Some(ranges.swap_remove(index))
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

impl MemoryArena {
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        if config.maximum_bytes == 0 {
            return Err(ArenaError::InvalidConfig("maximum_bytes must be non-zero"));
        }
        let region = VirtualRegion::new(config.maximum_bytes, config.page_size)?;
        Ok(Self {
            region: Arc::new(region),
            cursor: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            free_children: Arc::default(),
        })
    }

    pub fn with_capacity(maximum_bytes: usize) -> Result<Self, ArenaError> {
        Self::new(ArenaConfig {
            maximum_bytes,
            ..ArenaConfig::default()
        })
    }

    /// Bytes handed out by committed allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn committed_bytes(&self) -> usize {
        self.region.committed_bytes()
    }

    pub fn maximum_bytes(&self) -> usize {
        self.region.len()
    }

    /// Address space claimed by reserved allocations, committed or not.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Position of the bump cursor, including alignment padding.
    pub fn used_bytes(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn page_size(&self) -> usize {
        self.region.page_size()
    }

    pub fn allocate(
        &self,
        size: usize,
        alignment: usize,
        state: AllocationState,
    ) -> Result<ArenaAllocation<'_>, ArenaError> {
        if !alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment(alignment));
        }
        let page = self.page_size();
        let (size, alignment) = match state {
            AllocationState::Committed => (size, alignment),
            AllocationState::Reserved => (
                align_up(size, page).ok_or_else(|| self.exhausted(size))?,
                alignment.max(page),
            ),
        };
        let offset = self.bump(size, alignment)?;
        match state {
            AllocationState::Committed => {
                self.region.commit(offset, size);
                self.allocated.fetch_add(size, Ordering::AcqRel);
            }
            AllocationState::Reserved => {
                self.reserved.fetch_add(size, Ordering::AcqRel);
            }
        }
        Ok(ArenaAllocation {
            arena: self,
            offset,
            len: size,
            state,
        })
    }

    fn bump(&self, size: usize, alignment: usize) -> Result<usize, ArenaError> {
        let maximum = self.maximum_bytes();
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let start = align_up(current, alignment).ok_or_else(|| self.exhausted(size))?;
            let end = start
                .checked_add(size)
                .filter(|end| *end <= maximum)
                .ok_or_else(|| self.exhausted(size))?;
            match self.cursor.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(start),
                Err(actual) => current = actual,
            }
        }
    }

    fn exhausted(&self, requested: usize) -> ArenaError {
        let err = ArenaError::CapacityExceeded {
            requested,
            used: self.used_bytes(),
            maximum: self.maximum_bytes(),
        };
        log::error!(target: LOG_TARGET, "{}", err);
        err
    }

    fn check_owner(&self, allocation: &ArenaAllocation<'_>) -> Result<(), ArenaError> {
        if std::ptr::eq(allocation.arena, self) {
            Ok(())
        } else {
            Err(ArenaError::ForeignAllocation)
        }
    }

    fn page_span(
        &self,
        allocation: &ArenaAllocation<'_>,
        offset: usize,
        len: usize,
    ) -> Result<(usize, usize), ArenaError> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= allocation.len)
            .ok_or(ArenaError::OutOfBounds {
                offset,
                end: offset.saturating_add(len),
            })?;
        let page = self.page_size();
        let start = allocation.offset + (offset & !(page - 1));
        let end = allocation.offset + align_up(end, page).unwrap_or(allocation.len);
        Ok((start, end.min(allocation.offset + allocation.len) - start))
    }

    /// Backs the pages covering `offset..offset+len` of a reserved allocation.
    /// Committing pages that are already committed is a no-op.
    pub fn commit(
        &self,
        allocation: &ArenaAllocation<'_>,
        offset: usize,
        len: usize,
    ) -> Result<(), ArenaError> {
        self.check_owner(allocation)?;
        if allocation.state == AllocationState::Committed {
            return Ok(());
        }
        let (start, span) = self.page_span(allocation, offset, len)?;
        let pages = self.region.commit(start, span);
        log::trace!(target: LOG_TARGET, "committed {} pages at {:#x}", pages, start);
        Ok(())
    }

    /// Returns the pages covering the range to the backing store without shrinking the
    /// allocation. Their contents are discarded. Only reserved allocations can decommit.
    ///
    /// Takes the allocation mutably so no slice from [`ArenaAllocation::bytes`] can
    /// observe the pages being zeroed.
    pub fn decommit(
        &self,
        allocation: &mut ArenaAllocation<'_>,
        offset: usize,
        len: usize,
    ) -> Result<(), ArenaError> {
        self.check_owner(allocation)?;
        if allocation.state != AllocationState::Reserved {
            return Err(ArenaError::NotReserved);
        }
        let (start, span) = self.page_span(allocation, offset, len)?;
        let pages = self.region.decommit(start, span);
        log::trace!(target: LOG_TARGET, "decommitted {} pages at {:#x}", pages, start);
        Ok(())
    }

    /// Carves a committed sub-range into a single-thread [`StackArena`].
    ///
    /// The range goes back to this arena when the stack arena drops and is reused by a
    /// later carve of the same or smaller size.
    pub fn carve_stack_arena(&self, bytes: usize) -> Result<StackArena, ArenaError> {
        let range = match self.free_children.take_fitting(bytes) {
            Some(range) => range,
            None => {
                let allocation = self.allocate(bytes, 16, AllocationState::Committed)?;
                ChildRange {
                    offset: allocation.offset,
                    len: allocation.len,
                }
            }
        };
        Ok(StackArena::carved(
            Arc::clone(&self.region),
            Arc::clone(&self.free_children),
            range,
            bytes,
        ))
    }

    /// Child ranges waiting to be reused.
    pub fn free_child_ranges(&self) -> usize {
        self.free_children.len()
    }

    /// Rewinds the arena to empty. Refused while stack arenas carved from it are alive.
    pub fn reset(&mut self) -> Result<(), ArenaError> {
        let children = Arc::strong_count(&self.region) - 1;
        if children > 0 {
            return Err(ArenaError::ChildrenAlive(children));
        }
        *self.cursor.get_mut() = 0;
        *self.allocated.get_mut() = 0;
        *self.reserved.get_mut() = 0;
        self.free_children.lock().clear();
        Ok(())
    }
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("allocated_bytes", &self.allocated_bytes())
            .field("committed_bytes", &self.committed_bytes())
            .field("maximum_bytes", &self.maximum_bytes())
            .finish()
    }
}

/// A range handed out by [`MemoryArena::allocate`]. Lives no longer than the arena.
pub struct ArenaAllocation<'a> {
    arena: &'a MemoryArena,
    offset: usize,
    len: usize,
    state: AllocationState,
}

impl ArenaAllocation<'_> {
    /// Offset from the start of the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        self.arena.region.is_committed(self.offset, self.len)
    }

    /// Bytes of a committed sub-range.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], ArenaError> {
        let start = self.checked_range(offset, len)?;
        // SAFETY: the range is inside this allocation, committed, and initialized (zeroed region).
        Ok(unsafe { std::slice::from_raw_parts(self.arena.region.ptr_at(start), len) })
    }

    /// Mutable bytes of a committed sub-range.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], ArenaError> {
        let start = self.checked_range(offset, len)?;
        // SAFETY: as above, and `&mut self` makes the borrow unique.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.arena.region.ptr_at(start), len) })
    }

    fn checked_range(&self, offset: usize, len: usize) -> Result<usize, ArenaError> {
        let end = offset.checked_add(len).filter(|end| *end <= self.len).ok_or(
            ArenaError::OutOfBounds {
                offset,
                end: offset.saturating_add(len),
            },
        )?;
        let start = self.offset + offset;
        if len > 0 && !self.arena.region.is_committed(start, end - offset) {
            return Err(ArenaError::NotCommitted);
        }
        Ok(start)
    }
}

impl std::fmt::Debug for ArenaAllocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaAllocation")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("state", &self.state)
            .finish()
    }
}
