//! Blocking FIFO shared between the pump threads.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Mutex-guarded FIFO with a condition variable for waiting consumers.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicking holder cannot leave the deque half-modified
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an item and wake one waiter.
    pub fn push(&self, item: T) {
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Pop the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |items| items.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        guard.pop_front()
    }

    /// Wake every waiter without adding an item.
    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                queue.push("tile");
            })
        };

        assert_eq!(queue.pop_timeout(Duration::from_secs(5)), Some("tile"));
        producer.join().unwrap();
    }
}
