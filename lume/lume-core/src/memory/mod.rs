//! Bump-allocating memory arenas.
//!
//! [`MemoryArena`] is the thread-safe root: an owned address range with atomic
//! bump allocation and explicit page commit/decommit. [`StackArena`] is a
//! single-thread child view with LIFO scopes, used for per-call scratch storage.

mod arena;
mod region;
mod stack;

pub use arena::{AllocationState, ArenaAllocation, ArenaConfig, MemoryArena};
pub use stack::{ArenaMark, ArenaScope, StackArena};

pub(crate) const LOG_TARGET: &str = "lume::memory";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("arena capacity exceeded: {requested} bytes requested with {used} of {maximum} in use")]
    CapacityExceeded {
        requested: usize,
        used: usize,
        maximum: usize,
    },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("invalid arena configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("host allocation of {0} bytes failed")]
    OutOfMemory(usize),
    #[error("range {offset}..{end} lies outside the allocation")]
    OutOfBounds { offset: usize, end: usize },
    #[error("range is not committed")]
    NotCommitted,
    #[error("operation requires a reserved allocation")]
    NotReserved,
    #[error("allocation does not belong to this arena")]
    ForeignAllocation,
    #[error("allocation scope is not the innermost live scope")]
    ScopeNotInnermost,
    #[error("arena still has {0} child arenas alive")]
    ChildrenAlive(usize),
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
