//! Segment Pool
//!
//! Fixed-capacity arena owning replicated-segment state. Entries are
//! addressed by generation-checked handles: releasing an entry bumps its
//! generation so handles to the old occupant can never reach a new one.
//! Allocation and release are O(1) through an intrusive free list.

use std::fmt;

/// Opaque handle to a pooled segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentHandle {
    index: u32,
    generation: u32,
}

impl SegmentHandle {
    /// Arena slot this handle points at
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the slot had when the handle was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Fixed-capacity, generation-checked arena
#[derive(Debug)]
pub struct SegmentPool<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    capacity: usize,
    len: usize,
}

impl<T> SegmentPool<T> {
    /// Create a pool that holds at most `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_head: None,
            capacity,
            len: 0,
        }
    }

    /// Maximum number of live values
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no value is live
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of values that can still be allocated
    pub fn available(&self) -> usize {
        self.capacity - self.len
    }

    /// Store `value`, returning it back if the pool is exhausted.
    pub fn allocate(&mut self, value: T) -> Result<SegmentHandle, T> {
        if let Some(index) = self.free_head {
            let slot = &mut self.entries[index as usize];
            let (generation, next_free) = match slot {
                Entry::Vacant {
                    generation,
                    next_free,
                } => (*generation, *next_free),
                Entry::Occupied { .. } => unreachable!("free list points at occupied entry"),
            };
            *slot = Entry::Occupied { generation, value };
            self.free_head = next_free;
            self.len += 1;
            return Ok(SegmentHandle { index, generation });
        }

        if self.entries.len() >= self.capacity {
            return Err(value);
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(SegmentHandle {
            index,
            generation: 0,
        })
    }

    /// True if `handle` refers to a live value
    pub fn contains(&self, handle: SegmentHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Borrow the value behind `handle`, if it is still live.
    pub fn get(&self, handle: SegmentHandle) -> Option<&T> {
        match self.entries.get(handle.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Mutably borrow the value behind `handle`, if it is still live.
    pub fn get_mut(&mut self, handle: SegmentHandle) -> Option<&mut T> {
        match self.entries.get_mut(handle.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Remove and return the value behind `handle`. Stale handles yield `None`.
    pub fn release(&mut self, handle: SegmentHandle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let vacant = Entry::Vacant {
            generation: handle.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let old = std::mem::replace(&mut self.entries[handle.index as usize], vacant);
        self.free_head = Some(handle.index);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_get() {
        let mut pool = SegmentPool::with_capacity(2);
        let a = pool.allocate("a").unwrap();
        let b = pool.allocate("b").unwrap();

        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_exhaustion_returns_value() {
        let mut pool = SegmentPool::with_capacity(1);
        pool.allocate(1).unwrap();
        assert_eq!(pool.allocate(2), Err(2));
    }

    #[test]
    fn test_release_reuses_slot_with_new_generation() {
        let mut pool = SegmentPool::with_capacity(1);
        let first = pool.allocate(10).unwrap();
        assert_eq!(pool.release(first), Some(10));
        assert!(pool.is_empty());

        let second = pool.allocate(20).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());

        // The old handle cannot observe the new occupant.
        assert_eq!(pool.get(first), None);
        assert_eq!(pool.get(second), Some(&20));
    }

    #[test]
    fn test_double_release_is_rejected() {
        let mut pool = SegmentPool::with_capacity(4);
        let h = pool.allocate(1).unwrap();
        assert_eq!(pool.release(h), Some(1));
        assert_eq!(pool.release(h), None);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_get_mut() {
        let mut pool = SegmentPool::with_capacity(1);
        let h = pool.allocate(vec![1]).unwrap();
        pool.get_mut(h).unwrap().push(2);
        assert_eq!(pool.get(h), Some(&vec![1, 2]));
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut pool = SegmentPool::with_capacity(3);
        let a = pool.allocate('a').unwrap();
        let b = pool.allocate('b').unwrap();
        let _c = pool.allocate('c').unwrap();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.allocate('d').unwrap().index(), b.index());
        assert_eq!(pool.allocate('e').unwrap().index(), a.index());
        assert!(pool.allocate('f').is_err());
    }
}
