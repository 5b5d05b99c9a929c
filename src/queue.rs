// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Bounded FIFO handing transfers between submitting threads and the
//! per-channel worker threads.
//!
//! Enqueue never blocks indefinitely: a full queue reports [`DmaError::Busy`]
//! (after an optional bounded wait) and the submitter retries, which keeps
//! backpressure on the producer without it parking while holding unrelated
//! locks. Dequeue blocks until an item arrives or the queue is closed;
//! a closed, drained queue reports [`DmaError::NoAccess`], the cooperative
//! shutdown token for worker threads.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DmaError, DmaResult};
use crate::regs::DMA_MAX_INFLIGHT;

struct QueueInner<T> {
    ring: VecDeque<T>,
    closed: bool,
}

/// Bounded blocking FIFO with a close signal.
pub struct TransferQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> TransferQueue<T> {
    /// Create a queue with the default in-flight capacity.
    pub fn new() -> Self {
        Self::with_capacity(DMA_MAX_INFLIGHT)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(QueueInner {
                ring: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.ring.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an item at the tail, failing with `Busy` when full. Queue
    /// state is untouched on failure; the caller retries.
    pub fn try_enqueue(&self, item: T) -> DmaResult<()> {
        let mut q = self
            .inner
            .lock()
            .map_err(|_| DmaError::Exception("queue lock poisoned"))?;
        if q.closed {
            return Err(DmaError::NoAccess);
        }
        if q.ring.len() == self.capacity {
            return Err(DmaError::Busy("transfer queue full"));
        }
        q.ring.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Like [`try_enqueue`](Self::try_enqueue), but waits up to `timeout`
    /// for space before reporting `Busy`.
    pub fn enqueue_timeout(&self, item: T, timeout: Duration) -> DmaResult<()> {
        let mut q = self
            .inner
            .lock()
            .map_err(|_| DmaError::Exception("queue lock poisoned"))?;
        let deadline = Instant::now() + timeout;
        while q.ring.len() == self.capacity && !q.closed {
            let now = Instant::now();
            if now >= deadline {
                return Err(DmaError::Busy("transfer queue full"));
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(q, deadline - now)
                .map_err(|_| DmaError::Exception("queue wait poisoned"))?;
            q = guard;
        }
        if q.closed {
            return Err(DmaError::NoAccess);
        }
        q.ring.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the head item, blocking while the queue is empty.
    /// Once the queue is closed and drained, returns `NoAccess`.
    pub fn dequeue(&self) -> DmaResult<T> {
        let mut q = self
            .inner
            .lock()
            .map_err(|_| DmaError::Exception("queue lock poisoned"))?;
        loop {
            if let Some(item) = q.ring.pop_front() {
                self.not_full.notify_one();
                return Ok(item);
            }
            if q.closed {
                return Err(DmaError::NoAccess);
            }
            q = self
                .not_empty
                .wait(q)
                .map_err(|_| DmaError::Exception("queue wait poisoned"))?;
        }
    }

    /// Close the queue: enqueues fail, and dequeuers drain the remaining
    /// items before seeing `NoAccess`.
    pub fn close(&self) {
        if let Ok(mut q) = self.inner.lock() {
            q.closed = true;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Close the queue and, unless `force`, wait for pending items to be
    /// drained by consumers.
    pub fn destroy(&self, force: bool) -> DmaResult<()> {
        self.close();
        if force {
            return Ok(());
        }
        let mut q = self
            .inner
            .lock()
            .map_err(|_| DmaError::Exception("queue lock poisoned"))?;
        while !q.ring.is_empty() {
            let (guard, _) = self
                .not_full
                .wait_timeout(q, Duration::from_millis(10))
                .map_err(|_| DmaError::Exception("queue wait poisoned"))?;
            q = guard;
        }
        Ok(())
    }
}

impl<T> Default for TransferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
