use std::array;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use quanta::Instant;

use crate::utils::sync::{CondvarExt, LockExt};

/// Ring of free items.
struct Ring<T, const N: usize> {
    slots: [Option<T>; N],
    head: usize,
    len: usize,
}

impl<T, const N: usize> Ring<T, N> {
    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        item
    }

    fn push(&mut self, item: T) -> Result<(), T> {
        if self.len == N {
            return Err(item);
        }
        self.slots[(self.head + self.len) % N] = Some(item);
        self.len += 1;
        Ok(())
    }
}

/// Fixed-capacity pool of reusable slots.
///
/// A pool holds at most `N` items. [`acquire`](Self::acquire) takes one out,
/// blocking while the pool is empty, and [`release`](Self::release) gives it
/// back from any thread. The number of items borrowed at the same time thus
/// never exceeds `N`, which makes the pool a backpressure point: callers
/// beyond the bound wait for an earlier borrower to finish.
///
/// Items are handed out in FIFO order of release.
pub struct SlotPool<T, const N: usize> {
    ring: Mutex<Ring<T, N>>,
    cond: Condvar,
}

impl<T, const N: usize> SlotPool<T, N> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: array::from_fn(|_| None),
                head: 0,
                len: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Create a pool filled with `items`.
    ///
    /// # Panics
    ///
    /// Panic if `items` yields more than `N` items.
    pub fn from_items<I: IntoIterator<Item = T>>(items: I) -> Self {
        let pool = Self::new();
        for item in items {
            pool.release(item);
        }
        pool
    }

    /// Get the capacity of the pool.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Get the number of items currently in the pool.
    pub fn available(&self) -> usize {
        self.ring.locked().len
    }

    /// Take an item out of the pool, blocking until one is available.
    pub fn acquire(&self) -> T {
        let mut ring = self.ring.locked();
        loop {
            if let Some(item) = ring.pop() {
                return item;
            }
            ring = self.cond.wait_locked(ring);
        }
    }

    /// Take an item out of the pool if one is available.
    pub fn try_acquire(&self) -> Option<T> {
        self.ring.locked().pop()
    }

    /// Take an item out of the pool, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.locked();
        loop {
            if let Some(item) = ring.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            ring = self.cond.wait_timeout_locked(ring, deadline - now).0;
        }
    }

    /// Return an item to the pool and wake one waiter.
    ///
    /// # Panics
    ///
    /// Panic if the pool is already full, i.e., more items are released than
    /// were acquired.
    pub fn release(&self, item: T) {
        let mut ring = self.ring.locked();
        if ring.push(item).is_err() {
            drop(ring);
            panic!("released into a full slot pool (capacity {})", N);
        }
        self.cond.notify_one();
    }
}

impl<T, const N: usize> Default for SlotPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
