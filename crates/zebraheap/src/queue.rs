use crate::platform;
use crate::util::{align_up, PAGE_SIZE};
use core::ptr;

/// Fixed-capacity FIFO of slab indices.
///
/// Backs both the free list and the quarantine. Storage is mapped directly
/// from the OS so heap metadata never lives inside the reservation it
/// describes. Capacity is rounded up to a power of two for mask arithmetic.
pub struct IndexQueue {
    entries: *mut usize,
    mapped_size: usize,
    capacity: usize,
    head: usize,
    tail: usize,
    count: usize,
}

impl IndexQueue {
    /// Create a queue able to hold at least `min_capacity` indices.
    /// Returns None if the storage mapping fails.
    pub fn with_capacity(min_capacity: usize) -> Option<IndexQueue> {
        let capacity = min_capacity.max(2).next_power_of_two();
        let mapped_size = align_up(capacity * core::mem::size_of::<usize>(), PAGE_SIZE);
        let mem = unsafe { platform::map_anonymous(mapped_size) };
        if mem.is_null() {
            return None;
        }
        Some(IndexQueue {
            entries: mem as *mut usize,
            mapped_size,
            capacity,
            head: 0,
            tail: 0,
            count: 0,
        })
    }

    /// Append an index. Returns false when the queue is full.
    pub fn push(&mut self, index: usize) -> bool {
        if self.count == self.capacity {
            return false;
        }
        unsafe { self.entries.add(self.tail).write(index) };
        self.tail = (self.tail + 1) & (self.capacity - 1);
        self.count += 1;
        true
    }

    /// Remove and return the oldest index.
    pub fn pop(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let index = unsafe { self.entries.add(self.head).read() };
        self.head = (self.head + 1) & (self.capacity - 1);
        self.count -= 1;
        Some(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate the queued indices in FIFO order without consuming them.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).map(move |i| unsafe {
            self.entries.add((self.head + i) & (self.capacity - 1)).read()
        })
    }

    /// The mapped storage range, for internal-use telemetry.
    pub fn storage(&self) -> (*const u8, usize) {
        (self.entries as *const u8, self.mapped_size)
    }
}

impl Drop for IndexQueue {
    fn drop(&mut self) {
        if !self.entries.is_null() {
            unsafe { platform::unmap(self.entries as *mut u8, self.mapped_size) };
            self.entries = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = IndexQueue::with_capacity(8).unwrap();
        for i in 0..5 {
            assert!(q.push(i));
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn wraps_around_storage() {
        let mut q = IndexQueue::with_capacity(4).unwrap();
        for round in 0..10 {
            for i in 0..4 {
                assert!(q.push(round * 4 + i));
            }
            assert!(!q.push(999), "push into a full queue must fail");
            for i in 0..4 {
                assert_eq!(q.pop(), Some(round * 4 + i));
            }
        }
        assert!(q.is_empty());
    }

    #[test]
    fn capacity_rounds_up() {
        let mut q = IndexQueue::with_capacity(5).unwrap();
        for i in 0..8 {
            assert!(q.push(i), "rounded capacity should accept 8 entries");
        }
        assert!(!q.push(8));
    }

    #[test]
    fn iter_matches_fifo_order() {
        let mut q = IndexQueue::with_capacity(4).unwrap();
        q.push(7);
        q.push(3);
        q.pop();
        q.push(9);
        let seen: Vec<usize> = q.iter().collect();
        assert_eq!(seen, vec![3, 9]);
    }
}
