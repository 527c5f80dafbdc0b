use std::collections::VecDeque;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("pending queue full ({capacity} entries)")]
    Full { capacity: usize },
}

/// Bounded FIFO of correlation ids awaiting flush.
#[derive(Debug)]
pub struct PendingQueue {
    items: VecDeque<u32>,
    capacity: usize,
}

impl PendingQueue {
    /// Allocate a queue that holds at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `key`, failing when the queue is full.
    pub fn push(&mut self, key: u32) -> Result<(), QueueError> {
        if self.items.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        self.items.push_back(key);
        Ok(())
    }

    /// Oldest queued id.
    pub fn pop(&mut self) -> Option<u32> {
        self.items.pop_front()
    }

    /// Number of queued ids.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no ids are queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of queued ids.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = PendingQueue::new(8);
        for k in [3, 1, 2] {
            q.push(k).unwrap();
        }
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_push_fails_when_full() {
        let mut q = PendingQueue::new(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(QueueError::Full { capacity: 2 }));
        assert_eq!(q.len(), 2);

        q.pop();
        q.push(3).unwrap();
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert!(q.is_empty());
    }
}
