//! Page-granular backing store shared by a root arena and the stack arenas carved from it.

use super::ArenaError;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Zero-initialized address range with a per-page commit bitset.
///
/// The allocator maps zeroed pages lazily, so untouched pages cost address space
/// only. Commit state is bookkeeping: decommitted pages are zeroed so a later
/// commit observes fresh memory.
pub(crate) struct VirtualRegion {
    base: NonNull<u8>,
    layout: Layout,
    page_size: usize,
    pages: Box<[AtomicU64]>,
    committed_bytes: AtomicUsize,
}

// Raw memory is only handed out through disjoint arena allocations.
unsafe impl Send for VirtualRegion {}
unsafe impl Sync for VirtualRegion {}

impl VirtualRegion {
    pub fn new(bytes: usize, page_size: usize) -> Result<Self, ArenaError> {
        if !page_size.is_power_of_two() {
            return Err(ArenaError::InvalidConfig("page size must be a power of two"));
        }
        let size = super::align_up(bytes.max(page_size), page_size)
            .ok_or(ArenaError::InvalidConfig("arena size overflows"))?;
        let layout = Layout::from_size_align(size, page_size)
            .map_err(|_| ArenaError::InvalidConfig("arena layout is invalid"))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(ArenaError::OutOfMemory(size))?;
        let page_count = size / page_size;
        let pages = (0..page_count.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            base,
            layout,
            page_size,
            pages,
            committed_bytes: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes.load(Ordering::Acquire)
    }

    /// Pointer to `offset`. The caller must own the range it writes through.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len());
        // SAFETY: offset is within (or one past) the allocation.
        unsafe { self.base.as_ptr().add(offset) }
    }

    fn page_range(&self, offset: usize, len: usize) -> std::ops::Range<usize> {
        if len == 0 {
            return 0..0;
        }
        let first = offset / self.page_size;
        let last = (offset + len - 1) / self.page_size;
        first..last + 1
    }

    /// Marks the pages covering `offset..offset+len` committed. Returns the number of pages
    /// that were not committed before; already-committed pages are left untouched.
    pub fn commit(&self, offset: usize, len: usize) -> usize {
        let mut newly = 0;
        for page in self.page_range(offset, len) {
            let bit = 1u64 << (page % 64);
            let previous = self.pages[page / 64].fetch_or(bit, Ordering::AcqRel);
            if previous & bit == 0 {
                newly += 1;
            }
        }
        if newly > 0 {
            self.committed_bytes
                .fetch_add(newly * self.page_size, Ordering::AcqRel);
        }
        newly
    }

    /// Releases the pages covering the range and zeroes them. Pages that are not
    /// committed are skipped.
    pub fn decommit(&self, offset: usize, len: usize) -> usize {
        let mut released = 0;
        for page in self.page_range(offset, len) {
            let bit = 1u64 << (page % 64);
            let previous = self.pages[page / 64].fetch_and(!bit, Ordering::AcqRel);
            if previous & bit != 0 {
                released += 1;
                // SAFETY: the page lies inside the region and belongs to the caller's allocation.
                unsafe {
                    std::ptr::write_bytes(self.ptr_at(page * self.page_size), 0, self.page_size);
                }
            }
        }
        if released > 0 {
            self.committed_bytes
                .fetch_sub(released * self.page_size, Ordering::AcqRel);
        }
        released
    }

    pub fn is_committed(&self, offset: usize, len: usize) -> bool {
        self.page_range(offset, len).all(|page| {
            self.pages[page / 64].load(Ordering::Acquire) & (1u64 << (page % 64)) != 0
        })
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for VirtualRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRegion")
            .field("len", &self.len())
            .field("page_size", &self.page_size)
            .field("committed_bytes", &self.committed_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_idempotent() {
        let region = VirtualRegion::new(4 * 4096, 4096).unwrap();
        assert_eq!(region.commit(0, 4096), 1);
        assert_eq!(region.commit(0, 4096), 0);
        assert_eq!(region.commit(100, 8000), 1);
        assert_eq!(region.committed_bytes(), 2 * 4096);
        assert!(region.is_committed(0, 8192));
        assert!(!region.is_committed(0, 8193));
    }

    #[test]
    fn decommit_zeroes_and_is_idempotent() {
        let region = VirtualRegion::new(2 * 4096, 4096).unwrap();
        region.commit(4096, 4096);
        unsafe { *region.ptr_at(4096 + 8) = 0xAB };
        assert_eq!(region.decommit(4096, 4096), 1);
        assert_eq!(region.decommit(4096, 4096), 0);
        assert_eq!(region.committed_bytes(), 0);
        region.commit(4096, 4096);
        assert_eq!(unsafe { *region.ptr_at(4096 + 8) }, 0);
    }

    #[test]
    fn size_rounds_to_pages() {
        let region = VirtualRegion::new(1, 4096).unwrap();
        assert_eq!(region.len(), 4096);
        assert!(VirtualRegion::new(1, 3000).is_err());
    }
}
