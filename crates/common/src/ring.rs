//! Bounded ring buffer used at every stage boundary.
//!
//! Capacity is fixed at construction. A producer blocks in [`RingBuffer::push`]
//! while the buffer is full and a consumer blocks in [`RingBuffer::pop`]
//! while it is empty. [`RingBuffer::stop`] wakes every waiter at once and
//! makes all further pushes fail until [`RingBuffer::start`] is called, which
//! is what keeps seek and shutdown from deadlocking on a full or empty slot.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a non-blocking push failed. The item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    Full(T),
    Stopped(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Stopped(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

struct Slots<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// Fixed-capacity FIFO with blocking and non-blocking access.
pub struct RingBuffer<T> {
    slots: Mutex<Slots<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a ring holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            slots: Mutex::new(Slots {
                items: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Push, waiting for a free slot. Returns the item if the ring is
    /// (or becomes) stopped.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut slots = self.slots.lock();
        while !slots.stopped && slots.items.len() >= self.capacity {
            self.not_full.wait(&mut slots);
        }
        if slots.stopped {
            return Err(item);
        }
        slots.items.push_back(item);
        drop(slots);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push without waiting.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut slots = self.slots.lock();
        if slots.stopped {
            return Err(PushError::Stopped(item));
        }
        if slots.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        slots.items.push_back(item);
        drop(slots);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop, waiting for an item. Returns `None` once the ring is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut slots = self.slots.lock();
        while !slots.stopped && slots.items.is_empty() {
            self.not_empty.wait(&mut slots);
        }
        if slots.stopped {
            return None;
        }
        self.take(slots)
    }

    /// Pop, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        while !slots.stopped && slots.items.is_empty() {
            if self.not_empty.wait_until(&mut slots, deadline).timed_out() {
                break;
            }
        }
        if slots.stopped {
            return None;
        }
        self.take(slots)
    }

    /// Pop without waiting. Items left in a stopped ring stay unreachable
    /// until it is restarted or cleared.
    pub fn try_pop(&self) -> Option<T> {
        let slots = self.slots.lock();
        if slots.stopped {
            return None;
        }
        self.take(slots)
    }

    fn take(&self, mut slots: parking_lot::MutexGuard<'_, Slots<T>>) -> Option<T> {
        let item = slots.items.pop_front();
        drop(slots);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.slots.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.lock().items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every buffered item.
    pub fn clear(&self) {
        self.slots.lock().items.clear();
        self.not_full.notify_all();
    }

    /// Wake all waiters and reject pushes until [`start`](Self::start).
    pub fn stop(&self) {
        self.slots.lock().stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn start(&self) {
        self.slots.lock().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.slots.lock().stopped
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("RingBuffer")
            .field("len", &slots.items.len())
            .field("capacity", &self.capacity)
            .field("stopped", &slots.stopped)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
