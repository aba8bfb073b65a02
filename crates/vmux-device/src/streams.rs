//! Physical stream pool
//!
//! Tracks which physical stream slots of a device are in use. Slots
//! are handed out first-fit in index order; freeing a slot that is not
//! in use is a programming error and panics.

use parking_lot::Mutex;
use tracing::trace;

/// Pool of physical stream slots for one device
#[derive(Debug)]
pub struct StreamPool {
    used: Mutex<Vec<bool>>,
}

impl StreamPool {
    /// Create a pool with `capacity` slots, all free
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            used: Mutex::new(vec![false; capacity]),
        }
    }

    /// Number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.used.lock().len()
    }

    /// Number of slots currently marked used
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.used.lock().iter().filter(|u| **u).count()
    }

    /// Mark up to `count` free slots used, returning their indices
    ///
    /// Fewer than `count` indices signals a shortage; the caller
    /// decides how to react.
    pub fn allocate(&self, count: usize) -> Vec<usize> {
        if count == 0 {
            return Vec::new();
        }

        let mut used = self.used.lock();
        let mut granted = Vec::with_capacity(count);
        for (idx, slot) in used.iter_mut().enumerate() {
            if !*slot {
                *slot = true;
                granted.push(idx);
                if granted.len() == count {
                    break;
                }
            }
        }
        trace!(requested = count, granted = granted.len(), "streams allocated");
        granted
    }

    /// Return slots to the pool
    ///
    /// # Panics
    ///
    /// Panics on an index outside the pool or on a slot that is
    /// already free.
    pub fn free(&self, streams: &[usize]) {
        if streams.is_empty() {
            return;
        }

        let mut used = self.used.lock();
        for &idx in streams {
            assert!(idx < used.len(), "stream {idx} outside pool");
            assert!(used[idx], "double free of stream {idx}");
            used[idx] = false;
        }
        trace!(count = streams.len(), "streams freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocate_first_fit() {
        let pool = StreamPool::new(4);
        assert_eq!(pool.allocate(2), vec![0, 1]);
        assert_eq!(pool.allocate(1), vec![2]);

        pool.free(&[1]);
        assert_eq!(pool.allocate(2), vec![1, 3]);
    }

    #[test]
    fn test_shortage_returns_fewer() {
        let pool = StreamPool::new(2);
        let granted = pool.allocate(4);
        assert_eq!(granted, vec![0, 1]);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_allocate_zero_is_empty() {
        let pool = StreamPool::new(2);
        assert!(pool.allocate(0).is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let pool = StreamPool::new(2);
        let granted = pool.allocate(1);
        pool.free(&granted);
        pool.free(&granted);
    }

    #[test]
    #[should_panic(expected = "outside pool")]
    fn test_free_out_of_range_panics() {
        let pool = StreamPool::new(2);
        pool.free(&[5]);
    }

    #[test]
    fn test_concurrent_allocations_disjoint() {
        let pool = Arc::new(StreamPool::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || pool.allocate(8)));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for idx in handle.join().unwrap() {
                assert!(seen.insert(idx), "stream {idx} granted twice");
            }
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_freed_streams_reusable_across_threads() {
        let pool = Arc::new(StreamPool::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let granted = pool.allocate(2);
                    pool.free(&granted);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
