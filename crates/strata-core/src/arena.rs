//! Reference-counted slot arena.
//!
//! Slots live in a dense `Vec` that never shrinks. Freed indices go onto a
//! LIFO free list and are handed out again before the array grows. Every
//! release that drops the refcount to zero returns the slot's data exactly
//! once so the caller can schedule backend teardown.

use std::marker::PhantomData;

use crate::handle::{Handle, ResourceKind};

struct Slot<T> {
    data: Option<T>,
    refcount: u32,
    generation: u32,
}

/// Dense handle-to-data table with refcounts and generation checks.
pub struct HandleArena<T, K> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<T, K: ResourceKind> Default for HandleArena<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K: ResourceKind> HandleArena<T, K> {
    /// Create an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            _kind: PhantomData,
        }
    }

    /// Create an empty arena with room for `capacity` slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
            _kind: PhantomData,
        }
    }

    /// Create a slot holding `T::default()` with a refcount of one.
    pub fn create(&mut self) -> Handle<K>
    where
        T: Default,
    {
        self.create_with(T::default())
    }

    /// Create a slot holding `data` with a refcount of one.
    pub fn create_with(&mut self, data: T) -> Handle<K> {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert_eq!(slot.refcount, 0, "free list held a live {} slot", K::NAME);
            slot.data = Some(data);
            slot.refcount = 1;
            return Handle::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len())
            .ok()
            .filter(|&i| i < u32::MAX)
            .unwrap_or_else(|| panic!("{} arena exhausted the 32-bit index space", K::NAME));
        self.slots.push(Slot {
            data: Some(data),
            refcount: 1,
            generation: 0,
        });
        Handle::new(index, 0)
    }

    fn resolve(&self, handle: Handle<K>) -> Option<usize> {
        let index = handle.index()? as usize;
        let slot = self.slots.get(index)?;
        (slot.refcount > 0 && slot.generation == handle.generation()).then_some(index)
    }

    /// Increment the refcount. Returns false for invalid or stale handles
    /// and when the count is already saturated.
    pub fn add_ref(&mut self, handle: Handle<K>) -> bool {
        let Some(index) = self.resolve(handle) else {
            return false;
        };
        let slot = &mut self.slots[index];
        match slot.refcount.checked_add(1) {
            Some(count) => {
                slot.refcount = count;
                true
            }
            None => false,
        }
    }

    /// Decrement the refcount.
    ///
    /// Returns the slot data on the 1 -> 0 transition and `None` otherwise,
    /// including for invalid, stale or already-freed handles.
    pub fn release(&mut self, handle: Handle<K>) -> Option<T> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return None;
        }

        let data = slot.data.take();
        self.live -= 1;

        // A slot whose generation would wrap is retired for good, otherwise a
        // handle from generation 0 could resolve again.
        if slot.generation == u32::MAX {
            return data;
        }
        slot.generation += 1;
        self.free.push(index as u32);
        data
    }

    /// Borrow the data behind a live handle.
    #[must_use]
    pub fn get(&self, handle: Handle<K>) -> Option<&T> {
        let index = self.resolve(handle)?;
        self.slots[index].data.as_ref()
    }

    /// Mutably borrow the data behind a live handle.
    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut T> {
        let index = self.resolve(handle)?;
        self.slots[index].data.as_mut()
    }

    /// Returns true if the handle refers to a live slot.
    #[must_use]
    pub fn is_valid(&self, handle: Handle<K>) -> bool {
        self.resolve(handle).is_some()
    }

    /// Current refcount, or 0 for invalid handles.
    #[must_use]
    pub fn refcount(&self, handle: Handle<K>) -> u32 {
        self.resolve(handle)
            .map_or(0, |index| self.slots[index].refcount)
    }

    /// Number of live slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if no slot is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Length of the dense slot array, live or not.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of indices waiting on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Data stored at a dense index, if that slot is live.
    #[must_use]
    pub fn slot(&self, index: u32) -> Option<&T> {
        let slot = self.slots.get(index as usize)?;
        if slot.refcount == 0 {
            return None;
        }
        slot.data.as_ref()
    }

    /// Iterate over every live slot in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            if slot.refcount == 0 {
                return None;
            }
            slot.data
                .as_ref()
                .map(|data| (Handle::new(index as u32, slot.generation), data))
        })
    }

    /// Take the data out of every live slot, ignoring refcounts.
    ///
    /// Used on device teardown. Outstanding handles become stale.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.refcount == 0 {
                continue;
            }
            slot.refcount = 0;
            if let Some(data) = slot.data.take() {
                drained.push(data);
            }
            if slot.generation < u32::MAX {
                slot.generation += 1;
                self.free.push(index as u32);
            }
        }
        self.live = 0;
        drained
    }
}
