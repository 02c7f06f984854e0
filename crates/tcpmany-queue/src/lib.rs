//! A simple mutex+condvar MPMC queue, plus a bounded variant that blocks
//! pushers once the queue is full. Used to hand packets between the
//! receive, send, and timer threads without any lock-free cleverness —
//! these queues are never on a hot enough path to need it.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// An unbounded FIFO queue shared between producer and consumer threads.
/// `pop` blocks until an item is available; `try_pop` never blocks.
pub struct BlockingQueue<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(item);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available, then returns it.
    pub fn pop(&self) -> T {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }
            queue = self.not_empty.wait(queue).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A `BlockingQueue` with a capacity: `push` blocks while the queue is at
/// capacity instead of growing without bound. Used for the send queue,
/// where an unbounded backlog would just mean buffering more data than
/// the peer can ever receive.
pub struct BoundedBlockingQueue<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedBlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Blocks while the queue is full.
    pub fn push(&self, item: T) {
        let mut queue = self.queue.lock().unwrap();
        while queue.len() >= self.capacity {
            queue = self.not_full.wait(queue).unwrap();
        }
        queue.push_back(item);
        self.not_empty.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                self.not_full.notify_one();
                return item;
            }
            queue = self.not_empty.wait(queue).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut queue = self.queue.lock().unwrap();
        let item = queue.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn is_full(&self) -> bool {
        self.queue.lock().unwrap().len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_then_pop_preserves_fifo_order() {
        let q: BlockingQueue<i32> = BlockingQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
    }

    #[test]
    fn try_pop_on_empty_returns_none() {
        let q: BlockingQueue<i32> = BlockingQueue::new();
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn pop_blocks_until_pushed() {
        let q = Arc::new(BlockingQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.push(42);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn bounded_push_blocks_at_capacity_until_popped() {
        let q = Arc::new(BoundedBlockingQueue::new(1));
        q.push(1);
        assert!(q.is_full());

        let q2 = q.clone();
        let handle = thread::spawn(move || {
            q2.push(2);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.pop(), 1);
        handle.join().unwrap();
        assert_eq!(q.pop(), 2);
    }

    #[test]
    fn bounded_try_pop_unblocks_a_waiting_pusher() {
        let q: BoundedBlockingQueue<i32> = BoundedBlockingQueue::new(2);
        q.push(10);
        q.push(20);
        assert!(q.is_full());
        assert_eq!(q.try_pop(), Some(10));
        assert!(!q.is_full());
    }
}
