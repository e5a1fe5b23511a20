//! Fixed-capacity FIFO used for the two per-channel sample buffers (spec
//! §4.2). Grounded on the delay-line idiom in `fundsp::ring`, specialized
//! here to the scheduler's snapshot/advance access pattern rather than a
//! rotating read/write cursor.

use std::collections::VecDeque;

/// A bounded FIFO of `f64` samples. Pushing past capacity evicts the oldest
/// element. The scheduler owns one per channel exclusively; nothing else
/// mutates it.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: VecDeque<f64>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push one sample, evicting the oldest if at capacity.
    pub fn push(&mut self, value: f64) {
        if self.data.len() == self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(value);
    }

    /// Return the most recent `n` samples, oldest first, without consuming
    /// them. Returns `None` if fewer than `n` samples are buffered.
    pub fn snapshot_last(&self, n: usize) -> Option<Vec<f64>> {
        if self.data.len() < n {
            return None;
        }
        let skip = self.data.len() - n;
        Some(self.data.iter().skip(skip).copied().collect())
    }

    /// Drop the oldest `h` samples (a hop advance). Clamped to available
    /// length; dropping more than is present just empties the buffer.
    pub fn advance(&mut self, h: usize) {
        let drop = h.min(self.data.len());
        self.data.drain(..drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut rb = RingBuffer::new(3);
        rb.push(1.0);
        rb.push(2.0);
        rb.push(3.0);
        rb.push(4.0);
        assert_eq!(rb.snapshot_last(3).unwrap(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn snapshot_none_when_not_enough_samples() {
        let mut rb = RingBuffer::new(10);
        rb.push(1.0);
        assert!(rb.snapshot_last(2).is_none());
    }

    #[test]
    fn advance_drops_oldest_and_preserves_order() {
        let mut rb = RingBuffer::new(10);
        for v in 0..6 {
            rb.push(v as f64);
        }
        rb.advance(2);
        assert_eq!(rb.snapshot_last(4).unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn advance_past_len_empties_buffer() {
        let mut rb = RingBuffer::new(10);
        rb.push(1.0);
        rb.push(2.0);
        rb.advance(100);
        assert_eq!(rb.len(), 0);
    }
}
