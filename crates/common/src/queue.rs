//! Unbounded, stoppable FIFO used for the player's decode queues.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct State<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// Same stop/start semantics as [`RingBuffer`](crate::ring::RingBuffer)
/// without a capacity limit.
pub struct SafeQueue<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Default for SafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SafeQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append an item. Fails (handing it back) while stopped.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.cond.notify_one();
        Ok(())
    }

    /// Blocking pop; `None` once stopped.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        while !state.stopped && state.items.is_empty() {
            self.cond.wait(&mut state);
        }
        if state.stopped {
            return None;
        }
        state.items.pop_front()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.stopped && state.items.is_empty() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.stopped {
            return None;
        }
        state.items.pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        state.items.pop_front()
    }

    /// Remove and return everything, regardless of the stopped flag.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    pub fn clear(&self) {
        self.state.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.cond.notify_all();
    }

    pub fn start(&self) {
        self.state.lock().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_order() {
        let q = SafeQueue::new();
        for i in 0..100 {
            q.push(i).unwrap();
        }
        assert_eq!(q.len(), 100);
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.try_pop(), Some(1));
    }

    #[test]
    fn stopped_queue_rejects_and_unblocks() {
        let q = Arc::new(SafeQueue::<u8>::new());
        let q2 = Arc::clone(&q);
        let waiter = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        q.stop();
        assert_eq!(waiter.join().unwrap(), None);
        assert_eq!(q.push(1), Err(1));
        q.start();
        assert_eq!(q.push(1), Ok(()));
    }

    #[test]
    fn drain_ignores_stop() {
        let q = SafeQueue::new();
        q.push('a').unwrap();
        q.push('b').unwrap();
        q.stop();
        assert_eq!(q.try_pop(), None);
        assert_eq!(q.drain(), vec!['a', 'b']);
        assert!(q.is_empty());
    }
}
