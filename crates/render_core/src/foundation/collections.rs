//! Generational handle pool
//!
//! Slot-based allocator handing out opaque `(index, generation)` handles.
//! Each slot records the generation it was last issued with; a handle is
//! valid only while its generation matches the slot's and the slot is live.
//! Freed slots are threaded onto an index-based free list and reused with a
//! bumped generation, so stale handles and double frees are refused instead
//! of aliasing a newer resource.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use thiserror::Error;

/// Number of bits used for the slot index inside a packed handle
pub const HANDLE_INDEX_BITS: u32 = 20;

/// Number of bits used for the generation inside a packed handle
pub const HANDLE_GENERATION_BITS: u32 = 12;

/// Largest number of slots a single pool can ever address
pub const MAX_HANDLE_SLOTS: usize = 1 << HANDLE_INDEX_BITS;

/// Default number of slots added each time a pool runs out of capacity
pub const DEFAULT_GROWTH_CHUNK: usize = 64;

const INDEX_MASK: u32 = (1 << HANDLE_INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << HANDLE_GENERATION_BITS) - 1;

/// Errors reported by [`HandlePool`] when a handle is misused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// The handle's generation no longer matches its slot, or the slot does not exist
    #[error("Stale handle: slot {index} generation {generation}")]
    StaleHandle {
        /// Slot index carried by the handle
        index: u32,
        /// Generation carried by the handle
        generation: u32,
    },

    /// The handle refers to a slot that has already been freed
    #[error("Double free: slot {index} generation {generation} is already free")]
    DoubleFree {
        /// Slot index carried by the handle
        index: u32,
        /// Generation carried by the handle
        generation: u32,
    },

    /// Growing the pool would exceed the addressable index space
    #[error("Handle pool exhausted: limit of {max_slots} slots reached")]
    PoolExhausted {
        /// Slot limit of the pool
        max_slots: usize,
    },
}

/// Opaque reference into a [`HandlePool`]
///
/// The marker type `K` names the resource kind so that, for example, a
/// command buffer handle cannot be passed where a descriptor handle is
/// expected. All kinds share the same packed 32-bit representation.
pub struct Handle<K> {
    bits: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    /// Pack an index and generation into a handle
    ///
    /// Bits above the index/generation widths are discarded.
    pub fn new(index: u32, generation: u32) -> Self {
        Self::from_bits((index & INDEX_MASK) | ((generation & GENERATION_MASK) << HANDLE_INDEX_BITS))
    }

    /// Rebuild a handle from its packed representation
    pub fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            _kind: PhantomData,
        }
    }

    /// Packed 32-bit representation
    pub fn to_bits(self) -> u32 {
        self.bits
    }

    /// Slot index
    pub fn index(self) -> u32 {
        self.bits & INDEX_MASK
    }

    /// Generation the slot had when this handle was issued
    pub fn generation(self) -> u32 {
        self.bits >> HANDLE_INDEX_BITS
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

struct Slot<T> {
    generation: u32,
    next_free: Option<u32>,
    value: Option<T>,
}

/// Growable slot array issuing generation-checked handles
pub struct HandlePool<T, K> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    count: usize,
    capacity: usize,
    growth_chunk: usize,
    max_slots: usize,
    // First generation given to freshly created slots. Raised when the
    // backing array is released so old handle values are never reissued.
    generation_floor: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<T, K> HandlePool<T, K> {
    /// Create an empty pool with the default growth chunk and full index space
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_GROWTH_CHUNK, MAX_HANDLE_SLOTS)
    }

    /// Create an empty pool that grows by `growth_chunk` slots up to `max_slots`
    ///
    /// `max_slots` is clamped to [`MAX_HANDLE_SLOTS`] and `growth_chunk` to at least one.
    pub fn with_limits(growth_chunk: usize, max_slots: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            count: 0,
            capacity: 0,
            growth_chunk: growth_chunk.max(1),
            max_slots: max_slots.min(MAX_HANDLE_SLOTS),
            generation_floor: 0,
            _kind: PhantomData,
        }
    }

    /// Store `value` in a free slot and return its handle
    pub fn allocate(&mut self, value: T) -> Result<Handle<K>, HandleError> {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            slot.generation = (slot.generation + 1) & GENERATION_MASK;
            self.free_head = slot.next_free.take();
            slot.value = Some(value);
            self.count += 1;
            return Ok(Handle::new(index, slot.generation));
        }

        if self.slots.len() == self.capacity {
            self.grow()?;
        }

        let index = self.slots.len() as u32;
        let generation = self.generation_floor;
        self.slots.push(Slot {
            generation,
            next_free: None,
            value: Some(value),
        });
        self.count += 1;
        Ok(Handle::new(index, generation))
    }

    fn grow(&mut self) -> Result<(), HandleError> {
        let new_capacity = (self.capacity + self.growth_chunk).min(self.max_slots);
        if new_capacity <= self.capacity {
            log::warn!("Handle pool exhausted at {} slots", self.max_slots);
            return Err(HandleError::PoolExhausted {
                max_slots: self.max_slots,
            });
        }

        log::trace!("Growing handle pool from {} to {} slots", self.capacity, new_capacity);
        self.slots.reserve_exact(new_capacity - self.slots.len());
        self.capacity = new_capacity;
        Ok(())
    }

    fn validate(&self, handle: Handle<K>) -> Result<usize, HandleError> {
        let index = handle.index() as usize;
        let stale = HandleError::StaleHandle {
            index: handle.index(),
            generation: handle.generation(),
        };

        let slot = self.slots.get(index).ok_or(stale)?;
        if slot.generation != handle.generation() {
            return Err(stale);
        }
        if slot.value.is_none() {
            return Err(HandleError::DoubleFree {
                index: handle.index(),
                generation: handle.generation(),
            });
        }
        Ok(index)
    }

    /// Release the slot behind `handle` and return the value it held
    ///
    /// A stale or already freed handle is refused and the pool is left untouched.
    /// Freeing the last live slot releases the whole backing array.
    pub fn free(&mut self, handle: Handle<K>) -> Result<T, HandleError> {
        let index = self.validate(handle).inspect_err(|err| {
            log::warn!("Refusing to free {:?}: {}", handle, err);
        })?;

        let slot = &mut self.slots[index];
        let value = slot.value.take().ok_or(HandleError::DoubleFree {
            index: handle.index(),
            generation: handle.generation(),
        })?;
        slot.next_free = self.free_head;
        self.free_head = Some(handle.index());
        self.count -= 1;

        if self.count == 0 {
            self.release_storage();
        }
        Ok(value)
    }

    fn release_storage(&mut self) {
        let highest = self.slots.iter().map(|slot| slot.generation).max().unwrap_or(0);
        self.generation_floor = (highest + 1) & GENERATION_MASK;
        self.slots = Vec::new();
        self.free_head = None;
        self.capacity = 0;
        log::trace!("Handle pool emptied, next generation floor {}", self.generation_floor);
    }

    /// Resolve a handle to its value
    pub fn get(&self, handle: Handle<K>) -> Result<&T, HandleError> {
        let index = self.validate(handle)?;
        self.slots[index].value.as_ref().ok_or(HandleError::DoubleFree {
            index: handle.index(),
            generation: handle.generation(),
        })
    }

    /// Resolve a handle to a mutable reference to its value
    pub fn get_mut(&mut self, handle: Handle<K>) -> Result<&mut T, HandleError> {
        let index = self.validate(handle)?;
        self.slots[index].value.as_mut().ok_or(HandleError::DoubleFree {
            index: handle.index(),
            generation: handle.generation(),
        })
    }

    /// Whether `handle` currently refers to a live slot
    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.validate(handle).is_ok()
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no slot is live
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots the pool can hold before growing again
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over live slots and their handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }
}

impl<T, K> Default for HandlePool<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Widget;
    type WidgetPool = HandlePool<u32, Widget>;

    #[test]
    fn test_handle_packing() {
        let handle: Handle<Widget> = Handle::new(0xABCDE, 0x123);
        assert_eq!(handle.index(), 0xABCDE);
        assert_eq!(handle.generation(), 0x123);
        assert_eq!(Handle::<Widget>::from_bits(handle.to_bits()), handle);
    }

    #[test]
    fn test_live_handles_are_unique() {
        let mut pool = WidgetPool::new();
        let mut live = Vec::new();
        for i in 0..200 {
            live.push(pool.allocate(i).unwrap());
        }
        for handle in live.iter().step_by(3) {
            pool.free(*handle).unwrap();
        }
        for i in 0..50 {
            live.push(pool.allocate(1000 + i).unwrap());
        }

        let live: Vec<_> = live.into_iter().filter(|h| pool.contains(*h)).collect();
        let unique: HashSet<_> = live.iter().copied().collect();
        assert_eq!(unique.len(), live.len());
        assert_eq!(live.len(), pool.len());
    }

    #[test]
    fn test_reuse_bumps_generation() {
        let mut pool = WidgetPool::new();
        let _keep = pool.allocate(0).unwrap();
        let first = pool.allocate(1).unwrap();
        pool.free(first).unwrap();

        let second = pool.allocate(2).unwrap();
        assert_eq!(second.index(), first.index());
        assert!(second.generation() > first.generation());
        assert_eq!(
            pool.get(first),
            Err(HandleError::StaleHandle { index: first.index(), generation: first.generation() })
        );
        assert_eq!(pool.get(second), Ok(&2));
    }

    #[test]
    fn test_double_free_is_refused() {
        let mut pool = WidgetPool::new();
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();

        assert_eq!(pool.free(a), Ok(1));
        assert_eq!(
            pool.free(a),
            Err(HandleError::DoubleFree { index: a.index(), generation: a.generation() })
        );

        // Free list must still be intact: exactly one reuse of a's slot
        let c = pool.allocate(3).unwrap();
        let d = pool.allocate(4).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(d.index(), a.index());
        assert_ne!(d.index(), b.index());
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.get(b), Ok(&2));
    }

    #[test]
    fn test_shrink_to_empty_never_reissues_handles() {
        let mut pool = WidgetPool::new();
        let first = pool.allocate(1).unwrap();
        pool.free(first).unwrap();
        assert_eq!(pool.capacity(), 0);
        assert!(pool.free(first).is_err());

        let second = pool.allocate(2).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert!(pool.get(first).is_err());
    }

    #[test]
    fn test_grows_in_chunks() {
        let mut pool: WidgetPool = HandlePool::with_limits(8, 64);
        for i in 0..9 {
            pool.allocate(i).unwrap();
        }
        assert_eq!(pool.capacity(), 16);
    }

    #[test]
    fn test_pool_exhausted() {
        let mut pool: WidgetPool = HandlePool::with_limits(8, 16);
        for i in 0..16 {
            pool.allocate(i).unwrap();
        }
        assert_eq!(pool.allocate(16), Err(HandleError::PoolExhausted { max_slots: 16 }));
        assert_eq!(pool.len(), 16);
    }

    #[test]
    fn test_iter_visits_live_slots() {
        let mut pool = WidgetPool::new();
        let a = pool.allocate(10).unwrap();
        let b = pool.allocate(20).unwrap();
        pool.free(a).unwrap();

        let entries: Vec<_> = pool.iter().collect();
        assert_eq!(entries, vec![(b, &20)]);
    }
}
