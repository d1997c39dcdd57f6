//! Fixed-capacity ring buffer of the most recent samples
//!
//! [`RingBuffer`] keeps the last `capacity` values appended to it. Appends
//! are O(1) and never allocate after construction; once the buffer is full
//! every append overwrites the oldest value.
//!
//! The buffer tracks how many values have been written, so a partially
//! filled buffer only ever exposes the values actually written and a full
//! one is unwrapped oldest-to-newest on read. There is no internal locking:
//! callers sharing a buffer across threads wrap it in their own mutex.

use crate::error::{CaptureError, Result};

/// Circular store of the most recent `capacity` values
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<T>,
    capacity: usize,
    /// Slot the next append writes to
    head: usize,
    /// Whether `head` has wrapped at least once
    full: bool,
}

impl<T: Clone> RingBuffer<T> {
    /// Create an empty buffer holding up to `capacity` values.
    ///
    /// Storage grows as values are appended, so the capacity is only an
    /// upper bound on memory use.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CaptureError::InvalidCapacity);
        }
        Ok(Self {
            data: Vec::new(),
            capacity,
            head: 0,
            full: false,
        })
    }

    /// Append a value, overwriting the oldest one when full
    pub fn append(&mut self, value: T) {
        if self.full {
            self.data[self.head] = value;
        } else {
            self.data.push(value);
        }
        self.head += 1;
        if self.head == self.capacity {
            self.head = 0;
            self.full = true;
        }
    }

    /// Snapshot of the valid values, ordered oldest to newest
    pub fn get(&self) -> Vec<T> {
        if !self.full {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(&self.data[self.head..]);
        out.extend_from_slice(&self.data[..self.head]);
        out
    }

    /// Snapshot of the newest `n` values (or fewer), oldest first
    pub fn latest(&self, n: usize) -> Vec<T> {
        let all = self.get();
        let skip = all.len().saturating_sub(n);
        all[skip..].to_vec()
    }

    /// Most recently appended value
    pub fn last(&self) -> Option<&T> {
        if self.data.is_empty() {
            return None;
        }
        let idx = if self.head == 0 {
            self.capacity - 1
        } else {
            self.head - 1
        };
        self.data.get(idx)
    }

    /// Discard all contents and change the capacity
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        *self = Self::new(capacity)?;
        Ok(())
    }

    /// Discard all contents, keeping the capacity
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
        self.full = false;
    }

    /// Number of valid values
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been appended since the last reset
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of values held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer has wrapped
    pub fn is_full(&self) -> bool {
        self.full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            RingBuffer::<u32>::new(0),
            Err(CaptureError::InvalidCapacity)
        ));
    }

    #[test]
    fn test_partial_fill_not_padded() {
        let mut rb = RingBuffer::new(5).unwrap();
        rb.append(1.5f64);
        rb.append(2.5);
        assert_eq!(rb.get(), vec![1.5, 2.5]);
        assert!(!rb.is_full());
    }

    #[test]
    fn test_wraps_oldest_first() {
        let mut rb = RingBuffer::new(3).unwrap();
        for x in [1, 2, 3, 4] {
            rb.append(x);
        }
        assert_eq!(rb.get(), vec![2, 3, 4]);
        assert_eq!(rb.last(), Some(&4));
    }

    #[test]
    fn test_exactly_full() {
        let mut rb = RingBuffer::new(3).unwrap();
        for x in [7, 8, 9] {
            rb.append(x);
        }
        assert!(rb.is_full());
        assert_eq!(rb.get(), vec![7, 8, 9]);
        assert_eq!(rb.last(), Some(&9));
    }

    #[test]
    fn test_resize_discards() {
        let mut rb = RingBuffer::new(2).unwrap();
        rb.append(1u32);
        rb.append(2);
        rb.append(3);
        rb.resize(4).unwrap();
        assert!(rb.is_empty());
        assert_eq!(rb.capacity(), 4);
        rb.append(10);
        assert_eq!(rb.get(), vec![10]);
        assert!(rb.resize(0).is_err());
    }

    #[test]
    fn test_huge_capacity_grows_on_demand() {
        let mut rb = RingBuffer::<u64>::new(usize::MAX / 4).unwrap();
        assert_eq!(rb.capacity(), usize::MAX / 4);
        assert!(rb.is_empty());
        rb.append(3);
        rb.append(4);
        assert_eq!(rb.get(), vec![3, 4]);
        assert_eq!(rb.last(), Some(&4));
        rb.resize(usize::MAX / 2).unwrap();
        assert!(rb.is_empty());
    }

    #[test]
    fn test_latest() {
        let mut rb = RingBuffer::new(4).unwrap();
        for x in 0..6u32 {
            rb.append(x);
        }
        assert_eq!(rb.latest(2), vec![4, 5]);
        assert_eq!(rb.latest(10), vec![2, 3, 4, 5]);
    }

    proptest! {
        #[test]
        fn test_get_returns_most_recent_in_order(
            capacity in 1usize..64,
            values in prop::collection::vec(any::<u32>(), 0..300)
        ) {
            let mut rb = RingBuffer::new(capacity).unwrap();
            for v in &values {
                rb.append(*v);
            }
            let expected_len = values.len().min(capacity);
            let got = rb.get();
            prop_assert_eq!(got.len(), expected_len);
            prop_assert_eq!(&got[..], &values[values.len() - expected_len..]);
        }
    }
}
