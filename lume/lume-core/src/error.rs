//! Crate-wide error type.

use crate::memory::ArenaError;

/// Failure of a device-level operation.
///
/// Capacity, usage and staleness failures are local: the operation degrades to a
/// no-op and the error is also reported through [`crate::Diagnostics`].
/// [`RhiError::Backend`] is fatal for the operation chain that produced it.
#[derive(Debug, thiserror::Error)]
pub enum RhiError {
    #[error("{kind} capacity exhausted (capacity {capacity})")]
    CapacityExhausted { kind: &'static str, capacity: usize },
    #[error("stale or invalid {0} handle")]
    StaleHandle(&'static str),
    #[error("usage error: {0}")]
    Usage(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("buffer is not host visible")]
    NotHostVisible,
    #[error("range {offset}..{end} is outside a resource of {size} bytes")]
    OutOfRange { offset: u64, end: u64, size: u64 },
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type RhiResult<T> = Result<T, RhiError>;
