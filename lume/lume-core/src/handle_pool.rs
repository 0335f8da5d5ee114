//! Generation-tagged slot array turning owned objects into stable, validity-checked handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

const LOG_TARGET: &str = "lume::handle";
const NO_FREE: u32 = u32::MAX;

/// Opaque 64-bit handle: generation in the high 32 bits, slot index in the low 32.
///
/// Generations start at 1, so the all-zero value is never a live handle.
pub struct Handle<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub const NULL: Self = Self::from_raw(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self::from_raw(((generation as u64) << 32) | index as u64)
    }

    pub const fn to_raw(self) -> u64 {
        self.raw
    }

    pub const fn index(self) -> u32 {
        self.raw as u32
    }

    pub const fn generation(self) -> u32 {
        (self.raw >> 32) as u32
    }

    pub const fn is_null(self) -> bool {
        self.raw == 0
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Handle(null)")
        } else {
            write!(f, "Handle({}v{})", self.index(), self.generation())
        }
    }
}

struct Slot<T, F> {
    generation: u32,
    value: Option<(T, F)>,
    next_free: u32,
}

/// Fixed-capacity pool of `T` with an optional secondary payload `F` for data that
/// is not needed on the hot lookup path.
///
/// The pool itself is not synchronized; owners wrap it in a lock or keep it on one thread.
pub struct HandlePool<T, F = ()> {
    label: &'static str,
    slots: Vec<Slot<T, F>>,
    capacity: usize,
    free_head: u32,
    len: usize,
}

impl<T, F> HandlePool<T, F> {
    pub fn new(capacity: usize) -> Self {
        Self::with_label("handle", capacity)
    }

    /// `label` names the pool in capacity warnings.
    pub fn with_label(label: &'static str, capacity: usize) -> Self {
        let capacity = capacity.min(NO_FREE as usize);
        Self {
            label,
            slots: Vec::with_capacity(capacity),
            capacity,
            free_head: NO_FREE,
            len: 0,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and `full`. Returns [`Handle::NULL`] when the pool is full.
    pub fn add_with_full(&mut self, value: T, full: F) -> Handle<T> {
        if self.free_head != NO_FREE {
            let index = self.free_head;
            let slot = &mut self.slots[index as usize];
            self.free_head = slot.next_free;
            slot.next_free = NO_FREE;
            slot.value = Some((value, full));
            self.len += 1;
            return Handle::new(index, slot.generation);
        }
        if self.slots.len() < self.capacity {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 1,
                value: Some((value, full)),
                next_free: NO_FREE,
            });
            self.len += 1;
            return Handle::new(index, 1);
        }
        log::warn!(
            target: LOG_TARGET,
            "{} pool exhausted (capacity {})",
            self.label,
            self.capacity
        );
        Handle::NULL
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T, F>> {
        let slot = self.slots.get(handle.index() as usize)?;
        (slot.generation == handle.generation() && slot.value.is_some()).then_some(slot)
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Option<&mut Slot<T, F>> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        (slot.generation == handle.generation() && slot.value.is_some()).then_some(slot)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slot(handle)?.value.as_ref().map(|(v, _)| v)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slot_mut(handle)?.value.as_mut().map(|(v, _)| v)
    }

    pub fn get_full(&self, handle: Handle<T>) -> Option<&F> {
        self.slot(handle)?.value.as_ref().map(|(_, f)| f)
    }

    pub fn get_full_mut(&mut self, handle: Handle<T>) -> Option<&mut F> {
        self.slot_mut(handle)?.value.as_mut().map(|(_, f)| f)
    }

    /// Removes both payloads. The slot's generation is bumped before the slot is
    /// linked into the free list, so `handle` and every copy of it are stale afterwards.
    pub fn remove_full(&mut self, handle: Handle<T>) -> Option<(T, F)> {
        let free_head = self.free_head;
        let slot = self.slot_mut(handle)?;
        let value = slot.value.take();
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        slot.next_free = free_head;
        self.free_head = handle.index();
        self.len -= 1;
        value
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        self.remove_full(handle).map(|(v, _)| v)
    }

    /// Live entries with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|(v, _)| (Handle::new(i as u32, slot.generation), v))
        })
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }
}

impl<T, F: Default> HandlePool<T, F> {
    pub fn add(&mut self, value: T) -> Handle<T> {
        self.add_with_full(value, F::default())
    }
}

impl<T, F> fmt::Debug for HandlePool<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePool")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_after_remove() {
        let mut pool: HandlePool<&str> = HandlePool::new(4);
        let a = pool.add("a");
        let b = pool.add("b");
        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.remove(a), Some("a"));
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.remove(a), None);
        let c = pool.add("c");
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get(c), Some(&"c"));
        assert_eq!(pool.get(b), Some(&"b"));
    }

    #[test]
    fn capacity_one_reuses_slot() {
        let mut pool: HandlePool<u32> = HandlePool::new(1);
        let first = pool.add(1);
        assert!(pool.add(2).is_null());
        pool.remove(first);
        let second = pool.add(3);
        assert!(!second.is_null());
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), first.generation() + 1);
    }

    #[test]
    fn null_and_out_of_range_fail() {
        let mut pool: HandlePool<u32> = HandlePool::new(2);
        pool.add(1);
        assert_eq!(pool.get(Handle::NULL), None);
        assert_eq!(pool.get(Handle::new(7, 1)), None);
    }

    #[test]
    fn full_payload_is_independent() {
        let mut pool: HandlePool<u32, String> = HandlePool::new(2);
        let h = pool.add_with_full(5, "native".to_string());
        *pool.get_mut(h).unwrap() += 1;
        pool.get_full_mut(h).unwrap().push('!');
        assert_eq!(pool.get(h), Some(&6));
        assert_eq!(pool.get_full(h).map(String::as_str), Some("native!"));
        assert_eq!(pool.remove_full(h), Some((6, "native!".to_string())));
        assert_eq!(pool.get_full(h), None);
    }

    #[test]
    fn random_sequences_never_alias() {
        let mut pool: HandlePool<usize> = HandlePool::new(8);
        let mut live: Vec<(Handle<usize>, usize)> = Vec::new();
        let mut dead = Vec::new();
        let mut seed = 0x2545_f491_u64;
        for step in 0..2000usize {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if seed % 3 != 0 && live.len() < 8 {
                let h = pool.add(step);
                assert!(!h.is_null());
                live.push((h, step));
            } else if !live.is_empty() {
                let (h, v) = live.swap_remove(seed as usize % live.len());
                assert_eq!(pool.remove(h), Some(v));
                dead.push(h);
            }
            for (h, v) in &live {
                assert_eq!(pool.get(*h), Some(v));
            }
            for h in dead.iter().rev().take(16) {
                assert_eq!(pool.get(*h), None);
            }
        }
        assert_eq!(pool.len(), live.len());
        assert_eq!(pool.iter().count(), live.len());
    }
}
