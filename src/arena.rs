//! Slot arena with a free list.
//!
//! Nodes and points are owned by arenas and addressed by 32-bit slot
//! indices instead of pointers. Freeing a slot pushes it on the free list;
//! the next allocation reuses it.

#[derive(Clone, Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> Arena<T> {
    pub(crate) fn alloc(&mut self, value: T) -> u32 {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            debug_assert!(self.slots[slot as usize].is_none());
            self.slots[slot as usize] = Some(value);
            return slot;
        }
        let slot = u32::try_from(self.slots.len()).expect("arena exceeds u32 slots");
        self.slots.push(Some(value));
        slot
    }

    pub(crate) fn free(&mut self, slot: u32) -> Option<T> {
        let value = self.slots.get_mut(slot as usize)?.take()?;
        self.free.push(slot);
        self.live -= 1;
        Some(value)
    }

    #[inline]
    pub(crate) fn get(&self, slot: u32) -> Option<&T> {
        self.slots.get(slot as usize)?.as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, slot: u32) -> Option<&mut T> {
        self.slots.get_mut(slot as usize)?.as_mut()
    }

    /// Overwrites an occupied slot, returning the previous value.
    pub(crate) fn replace(&mut self, slot: u32, value: T) -> Option<T> {
        let entry = self.slots.get_mut(slot as usize)?;
        if entry.is_none() {
            return None;
        }
        entry.replace(value)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_list_reuse() {
        let mut arena: Arena<&str> = Arena::default();
        let a = arena.alloc("a");
        let b = arena.alloc("b");
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.free(a), Some("a"));
        assert_eq!(arena.free(a), None, "double free must be a no-op");
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.len(), 1);

        let c = arena.alloc("c");
        assert_eq!(c, a, "freed slot should be reused");
        assert_eq!(arena.get(c), Some(&"c"));
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn test_replace_requires_occupied_slot() {
        let mut arena: Arena<u8> = Arena::default();
        let a = arena.alloc(1);
        assert_eq!(arena.replace(a, 2), Some(1));
        assert_eq!(arena.get(a), Some(&2));
        arena.free(a);
        assert_eq!(arena.replace(a, 3), None);
        assert_eq!(arena.get(a), None);
    }
}
