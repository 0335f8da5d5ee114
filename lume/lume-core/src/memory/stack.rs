//! Single-thread stack arena with LIFO scopes.

// Allocations hand out disjoint ranges through a shared borrow, like a bump allocator.
#![allow(clippy::mut_from_ref)]

use super::arena::{ChildRange, ChildRanges};
use super::region::VirtualRegion;
use super::{align_up, ArenaError, LOG_TARGET};
use std::cell::{Cell, RefCell};
use std::mem::{align_of, size_of};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct ScopeFrame {
    start: usize,
    released: bool,
}

/// Scratch arena for one thread or one command list.
///
/// Allocation borrows the arena immutably and returns references tied to that
/// borrow; rewinding ([`StackArena::pop`], [`StackArena::pop_to`]) needs `&mut self`,
/// so no allocation can outlive the bytes it points at. Scopes
/// ([`StackArena::scope`]) release everything allocated through them on drop.
pub struct StackArena {
    region: Arc<VirtualRegion>,
    base: usize,
    capacity: usize,
    cursor: Cell<usize>,
    high_water: Cell<usize>,
    scopes: RefCell<Vec<ScopeFrame>>,
    /// Where the backing range goes when this arena drops; `None` for standalone arenas.
    home: Option<(Arc<ChildRanges>, ChildRange)>,
}

/// Cursor position captured by [`StackArena::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaMark(usize);

impl StackArena {
    pub(crate) fn from_region(region: Arc<VirtualRegion>, base: usize, capacity: usize) -> Self {
        Self {
            region,
            base,
            capacity,
            cursor: Cell::new(0),
            high_water: Cell::new(0),
            scopes: RefCell::new(Vec::new()),
            home: None,
        }
    }

    pub(crate) fn carved(
        region: Arc<VirtualRegion>,
        home: Arc<ChildRanges>,
        range: ChildRange,
        capacity: usize,
    ) -> Self {
        let mut arena = Self::from_region(region, range.offset, capacity);
        arena.home = Some((home, range));
        arena
    }

    /// Standalone stack arena with its own fully committed backing range.
    pub fn with_capacity(capacity: usize) -> Result<Self, ArenaError> {
        let region = VirtualRegion::new(capacity.max(1), 4096)?;
        region.commit(0, region.len());
        Ok(Self::from_region(Arc::new(region), 0, capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated_bytes(&self) -> usize {
        self.cursor.get()
    }

    /// Largest cursor position seen since creation.
    pub fn high_water_bytes(&self) -> usize {
        self.high_water.get()
    }

    /// Number of live scopes.
    pub fn depth(&self) -> usize {
        self.scopes.borrow().iter().filter(|f| !f.released).count()
    }

    /// Opens a scope nested inside whichever scope is currently innermost.
    pub fn scope(&self) -> ArenaScope<'_> {
        let mut scopes = self.scopes.borrow_mut();
        scopes.push(ScopeFrame {
            start: self.cursor.get(),
            released: false,
        });
        ArenaScope {
            arena: self,
            depth: scopes.len(),
        }
    }

    pub fn mark(&self) -> ArenaMark {
        ArenaMark(self.cursor.get())
    }

    /// Rewinds to a mark. Marks past the cursor are ignored.
    pub fn pop_to(&mut self, mark: ArenaMark) {
        if mark.0 <= self.cursor.get() {
            self.cursor.set(mark.0);
        }
    }

    /// Releases the last `bytes` bytes.
    pub fn pop(&mut self, bytes: usize) {
        self.cursor.set(self.cursor.get().saturating_sub(bytes));
    }

    pub fn reset(&mut self) {
        self.cursor.set(0);
        self.scopes.get_mut().clear();
    }

    fn check_depth(&self, depth: usize) -> Result<(), ArenaError> {
        if self.scopes.borrow().len() == depth {
            Ok(())
        } else {
            log::error!(target: LOG_TARGET, "allocation from a scope that is not innermost");
            Err(ArenaError::ScopeNotInnermost)
        }
    }

    fn bump(&self, size: usize, align: usize) -> Result<usize, ArenaError> {
        if !align.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment(align));
        }
        let current = self.cursor.get();
        let exhausted = || {
            let err = ArenaError::CapacityExceeded {
                requested: size,
                used: current,
                maximum: self.capacity,
            };
            log::error!(target: LOG_TARGET, "stack arena: {}", err);
            err
        };
        // The region base is page-aligned, so aligning the absolute offset aligns the pointer.
        let start = align_up(self.base + current, align).ok_or_else(exhausted)? - self.base;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= self.capacity)
            .ok_or_else(exhausted)?;
        self.cursor.set(end);
        if end > self.high_water.get() {
            self.high_water.set(end);
        }
        Ok(self.base + start)
    }

    fn alloc_bytes_at(
        &self,
        depth: usize,
        size: usize,
        align: usize,
    ) -> Result<&mut [u8], ArenaError> {
        self.check_depth(depth)?;
        let offset = self.bump(size, align)?;
        // SAFETY: [offset, offset+size) is a fresh, committed, exclusively owned range.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.region.ptr_at(offset), size) };
        bytes.fill(0);
        Ok(bytes)
    }

    fn alloc_at<T: Copy>(&self, depth: usize, value: T) -> Result<&mut T, ArenaError> {
        self.check_depth(depth)?;
        let offset = self.bump(size_of::<T>(), align_of::<T>())?;
        let ptr = self.region.ptr_at(offset).cast::<T>();
        // SAFETY: aligned, in-bounds, exclusively owned.
        unsafe {
            ptr.write(value);
            Ok(&mut *ptr)
        }
    }

    fn alloc_slice_fill_iter_at<T, I>(&self, depth: usize, iter: I) -> Result<&mut [T], ArenaError>
    where
        T: Copy,
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        self.check_depth(depth)?;
        let iter = iter.into_iter();
        let len = iter.len();
        let bytes = size_of::<T>()
            .checked_mul(len)
            .ok_or(ArenaError::InvalidConfig("slice size overflows"))?;
        let offset = self.bump(bytes, align_of::<T>())?;
        let ptr = self.region.ptr_at(offset).cast::<T>();
        let mut written = 0;
        for value in iter.take(len) {
            // SAFETY: written < len, range is aligned and exclusively owned.
            unsafe { ptr.add(written).write(value) };
            written += 1;
        }
        // SAFETY: `written` elements were initialized; a short iterator leaves the tail unused.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, written) })
    }

    /// Zeroed bytes. Refused while any scope is live.
    pub fn alloc_bytes(&self, size: usize, align: usize) -> Result<&mut [u8], ArenaError> {
        self.alloc_bytes_at(0, size, align)
    }

    pub fn alloc<T: Copy>(&self, value: T) -> Result<&mut T, ArenaError> {
        self.alloc_at(0, value)
    }

    pub fn alloc_slice_copy<T: Copy>(&self, values: &[T]) -> Result<&mut [T], ArenaError> {
        self.alloc_slice_fill_iter_at(0, values.iter().copied())
    }

    pub fn alloc_slice_fill_iter<T, I>(&self, iter: I) -> Result<&mut [T], ArenaError>
    where
        T: Copy,
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        self.alloc_slice_fill_iter_at(0, iter)
    }

    fn release(&self, depth: usize) {
        let mut scopes = self.scopes.borrow_mut();
        if depth == 0 || depth > scopes.len() {
            return;
        }
        scopes[depth - 1].released = true;
        // Frames are only rewound once every frame above them has been released.
        while let Some(frame) = scopes.last().copied() {
            if !frame.released {
                break;
            }
            scopes.pop();
            self.cursor.set(frame.start);
        }
    }
}

impl std::fmt::Debug for StackArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackArena")
            .field("allocated_bytes", &self.allocated_bytes())
            .field("capacity", &self.capacity)
            .field("depth", &self.depth())
            .finish()
    }
}

/// LIFO allocation scope. Everything allocated through it is released when it drops,
/// including on early returns and unwinding.
pub struct ArenaScope<'a> {
    arena: &'a StackArena,
    depth: usize,
}

impl<'a> ArenaScope<'a> {
    /// Opens a nested scope. This scope cannot allocate until the nested one is dropped.
    pub fn scope(&self) -> ArenaScope<'a> {
        self.arena.scope()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn alloc_bytes(&self, size: usize, align: usize) -> Result<&mut [u8], ArenaError> {
        self.arena.alloc_bytes_at(self.depth, size, align)
    }

    pub fn alloc<T: Copy>(&self, value: T) -> Result<&mut T, ArenaError> {
        self.arena.alloc_at(self.depth, value)
    }

    pub fn alloc_slice_copy<T: Copy>(&self, values: &[T]) -> Result<&mut [T], ArenaError> {
        self.arena
            .alloc_slice_fill_iter_at(self.depth, values.iter().copied())
    }

    pub fn alloc_slice_fill_iter<T, I>(&self, iter: I) -> Result<&mut [T], ArenaError>
    where
        T: Copy,
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        self.arena.alloc_slice_fill_iter_at(self.depth, iter)
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        if let Some((home, range)) = self.home.take() {
            home.give_back(range);
        }
    }
}

impl Drop for ArenaScope<'_> {
    fn drop(&mut self) {
        self.arena.release(self.depth);
    }
}

impl std::fmt::Debug for ArenaScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaScope").field("depth", &self.depth).finish()
    }
}
