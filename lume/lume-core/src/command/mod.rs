//! Command queues, pooled command lists and fences.

mod list;
mod queue;

pub use list::CommandList;
pub use queue::{CommandQueue, QueueEntry, QueueHandle};

/// A point on one queue's completion timeline.
///
/// The value only has meaning for the queue that produced it: the fence is reached
/// once that queue's completion counter is at least `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    pub(crate) queue: QueueHandle,
    pub(crate) value: u64,
}

impl Fence {
    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

impl std::fmt::Display for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fence {}@{:?}", self.value, self.queue)
    }
}
