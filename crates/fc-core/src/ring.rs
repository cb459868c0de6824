//! Fixed-capacity FIFO ring buffer
//!
//! Used for the command log, the security event log and each shell
//! session's output history. Pushing past capacity evicts the oldest entry.

use std::collections::VecDeque;

/// Insertion-ordered store that evicts the oldest entry on overflow
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty ring holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one if the ring was full
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    /// Oldest entry
    pub fn oldest(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Newest entry
    pub fn newest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Drop entries that fail the predicate
    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.entries.retain(f);
    }
}

impl<T: Clone> RingBuffer<T> {
    /// The newest `limit` entries, oldest first
    pub fn recent(&self, limit: usize) -> Vec<T> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Copy of every entry, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.push(4), Some(1));

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut ring = RingBuffer::new(1000);
        for i in 0..1001 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 1000);
        assert_eq!(ring.oldest(), Some(&1));
        assert_eq!(ring.newest(), Some(&1000));
    }

    #[test]
    fn test_recent() {
        let mut ring = RingBuffer::new(10);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.recent(2), vec![3, 4]);
        assert_eq!(ring.recent(50), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut ring = RingBuffer::new(0);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.to_vec(), vec!["b"]);
    }
}
