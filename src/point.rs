//! Indexed points and the arena that owns them.

use crate::arena::Arena;

/// A fingerprint with its id and liveness flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataPoint {
    pub id: i64,
    pub value: u64,
    /// `false` once deleted. A tombstoned point stays in its node until that
    /// node is rebuilt or the tree is cleared.
    pub active: bool,
}

impl DataPoint {
    pub fn new(id: i64, value: u64) -> Self {
        Self {
            id,
            value,
            active: true,
        }
    }
}

/// Slot index of a point inside a [`PointArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PointHandle(u32);

/// Owner of every point placed in, or buffered for, a tree.
#[derive(Clone, Debug, Default)]
pub struct PointArena {
    inner: Arena<DataPoint>,
}

impl PointArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, point: DataPoint) -> PointHandle {
        PointHandle(self.inner.alloc(point))
    }

    /// Releases a slot, returning the point it held.
    pub fn free(&mut self, handle: PointHandle) -> Option<DataPoint> {
        self.inner.free(handle.0)
    }

    #[inline]
    pub fn get(&self, handle: PointHandle) -> &DataPoint {
        self.inner.get(handle.0).expect("dangling point handle")
    }

    #[inline]
    pub fn get_mut(&mut self, handle: PointHandle) -> &mut DataPoint {
        self.inner.get_mut(handle.0).expect("dangling point handle")
    }

    #[inline]
    pub fn value(&self, handle: PointHandle) -> u64 {
        self.get(handle).value
    }

    #[inline]
    pub fn is_active(&self, handle: PointHandle) -> bool {
        self.get(handle).active
    }

    /// Occupied slots, tombstoned points included.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_flag() {
        let mut arena = PointArena::new();
        let a = arena.alloc(DataPoint::new(7, 0x77));
        assert_eq!(arena.value(a), 0x77);
        assert!(arena.is_active(a));

        arena.get_mut(a).active = false;
        assert!(!arena.is_active(a));
        assert_eq!(arena.len(), 1, "tombstones still occupy a slot");

        assert_eq!(arena.free(a).map(|p| p.id), Some(7));
        assert!(arena.is_empty());
    }
}
