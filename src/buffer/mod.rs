//! Thread-safe bounded ring buffer
//!
//! `BoundedQueue` is the hand-off point between the byte producers, the
//! framing worker and the packet consumers. It is used twice by the
//! extractor: once over raw `u8` (ingress) and once over `FoundPacket`
//! (egress).
//!
//! Every operation takes a [`Wait`] policy instead of coming in blocking,
//! try and try-for flavours. The old names are kept as thin wrappers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Error kinds for queue operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is empty")]
    Empty,

    #[error("timed out waiting on queue")]
    Timeout,

    #[error("queue is closed")]
    Closed,

    #[error("run of {requested} items exceeds queue capacity {capacity}")]
    ExceedsCapacity { requested: usize, capacity: usize },

    #[error("queue capacity must be non-zero")]
    ZeroCapacity,
}

/// How long an operation may wait for space or items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail with `Full`/`Empty` instead of waiting.
    Immediate,
    /// Wait until the operation can complete or the queue is closed.
    Block,
    /// Wait at most this long, then fail with `Timeout`.
    Timeout(Duration),
}

struct Ring<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity FIFO guarded by one mutex and two condition variables.
pub struct BoundedQueue<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            ring: Mutex::new(Ring {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block on `cond` until `ready` holds, the queue closes, or `wait` runs out.
    ///
    /// Returns the guard on success; the caller still has to re-check `closed`.
    fn wait_until<'a>(
        &self,
        mut ring: MutexGuard<'a, Ring<T>>,
        cond: &Condvar,
        wait: Wait,
        busy: QueueError,
        ready: impl Fn(&Ring<T>) -> bool,
    ) -> Result<MutexGuard<'a, Ring<T>>, QueueError> {
        match wait {
            Wait::Immediate => {
                if ready(&ring) || ring.closed {
                    Ok(ring)
                } else {
                    Err(busy)
                }
            }
            Wait::Block => {
                while !ready(&ring) && !ring.closed {
                    ring = cond.wait(ring).unwrap_or_else(PoisonError::into_inner);
                }
                Ok(ring)
            }
            Wait::Timeout(timeout) => {
                // a deadline past the end of the clock means no deadline
                let Some(deadline) = Instant::now().checked_add(timeout) else {
                    return self.wait_until(ring, cond, Wait::Block, busy, ready);
                };
                while !ready(&ring) && !ring.closed {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout);
                    }
                    ring = cond
                        .wait_timeout(ring, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                Ok(ring)
            }
        }
    }

    /// Insert one item at the tail.
    ///
    /// On failure the item is dropped.
    pub fn push(&self, item: T, wait: Wait) -> Result<(), QueueError> {
        let cap = self.capacity;
        let ring = self.lock();
        let mut ring = self.wait_until(ring, &self.not_full, wait, QueueError::Full, |r| {
            r.items.len() < cap
        })?;
        if ring.closed {
            return Err(QueueError::Closed);
        }
        ring.items.push_back(item);
        drop(ring);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Insert a whole run of items in one critical section.
    ///
    /// Waits until there is room for all of them; a run longer than the
    /// capacity can never fit and is rejected up front.
    pub fn push_all<I>(&self, items: I, wait: Wait) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = T>,
    {
        let run: Vec<T> = items.into_iter().collect();
        if run.is_empty() {
            return Ok(());
        }
        if run.len() > self.capacity {
            return Err(QueueError::ExceedsCapacity {
                requested: run.len(),
                capacity: self.capacity,
            });
        }
        let need = run.len();
        let cap = self.capacity;
        let ring = self.lock();
        let mut ring = self.wait_until(ring, &self.not_full, wait, QueueError::Full, |r| {
            cap - r.items.len() >= need
        })?;
        if ring.closed {
            return Err(QueueError::Closed);
        }
        ring.items.extend(run);
        drop(ring);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Remove and return the head item.
    ///
    /// A closed queue keeps handing out buffered items and fails with
    /// `Closed` once it is drained.
    pub fn pop(&self, wait: Wait) -> Result<T, QueueError> {
        let ring = self.lock();
        let mut ring = self.wait_until(ring, &self.not_empty, wait, QueueError::Empty, |r| {
            !r.items.is_empty()
        })?;
        let item = ring.items.pop_front().ok_or(QueueError::Closed)?;
        drop(ring);
        self.not_full.notify_all();
        Ok(item)
    }

    /// Remove exactly `count` items from the head in one critical section.
    pub fn pop_many(&self, count: usize, wait: Wait) -> Result<Vec<T>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.capacity {
            return Err(QueueError::ExceedsCapacity {
                requested: count,
                capacity: self.capacity,
            });
        }
        let ring = self.lock();
        let mut ring = self.wait_until(ring, &self.not_empty, wait, QueueError::Empty, |r| {
            r.items.len() >= count
        })?;
        if ring.items.len() < count {
            // only reachable once closed
            return Err(QueueError::Closed);
        }
        let run: Vec<T> = ring.items.drain(..count).collect();
        drop(ring);
        self.not_full.notify_all();
        Ok(run)
    }

    /// Remove between one and `max` items from the head.
    ///
    /// Waits only for the first item, so a consumer reading a long field
    /// never holds out for more than producers can fit alongside it.
    pub fn pop_up_to(&self, max: usize, wait: Wait) -> Result<Vec<T>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let ring = self.lock();
        let mut ring = self.wait_until(ring, &self.not_empty, wait, QueueError::Empty, |r| {
            !r.items.is_empty()
        })?;
        if ring.items.is_empty() {
            return Err(QueueError::Closed);
        }
        let take = max.min(ring.items.len());
        let run: Vec<T> = ring.items.drain(..take).collect();
        drop(ring);
        self.not_full.notify_all();
        Ok(run)
    }

    pub fn push_blocking(&self, item: T) -> Result<(), QueueError> {
        self.push(item, Wait::Block)
    }

    pub fn push_try(&self, item: T) -> Result<(), QueueError> {
        self.push(item, Wait::Immediate)
    }

    pub fn push_try_for(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        self.push(item, Wait::Timeout(timeout))
    }

    pub fn pop_blocking(&self) -> Result<T, QueueError> {
        self.pop(Wait::Block)
    }

    pub fn pop_try(&self) -> Result<T, QueueError> {
        self.pop(Wait::Immediate)
    }

    pub fn pop_try_for(&self, timeout: Duration) -> Result<T, QueueError> {
        self.pop(Wait::Timeout(timeout))
    }

    /// Number of buffered items.
    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().items.len() == self.capacity
    }

    /// Free slots left before a push would wait.
    pub fn remaining(&self) -> usize {
        self.capacity - self.lock().items.len()
    }

    /// Drop every buffered item and wake blocked producers.
    pub fn clear(&self) {
        self.lock().items.clear();
        self.not_full.notify_all();
    }

    /// Close the queue and wake every waiter.
    ///
    /// Pushes fail from now on; pops drain what is left, then fail.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<T: Clone> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        let ring = self.lock();
        let mut items = VecDeque::with_capacity(self.capacity);
        items.extend(ring.items.iter().cloned());
        Self {
            capacity: self.capacity,
            ring: Mutex::new(Ring {
                items,
                closed: ring.closed,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("size", &ring.items.len())
            .field("closed", &ring.closed)
            .finish()
    }
}
