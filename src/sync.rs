// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Counting semaphore used for transfer in-flight tracking and worker
//! thread startup handshakes.
//!
//! A transfer's semaphore is binary in practice: value 1 means "not in
//! progress", 0 means "claimed". `wait` claims, `post` releases.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{DmaError, DmaResult};

/// Counting semaphore built on a mutex/condvar pair.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial value.
    pub fn new(value: u32) -> Self {
        Self {
            count: Mutex::new(value),
            cv: Condvar::new(),
        }
    }

    /// Block until the count is non-zero, then decrement it.
    pub fn wait(&self) -> DmaResult<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| DmaError::Exception("semaphore lock poisoned"))?;
        while *count == 0 {
            count = self
                .cv
                .wait(count)
                .map_err(|_| DmaError::Exception("semaphore wait poisoned"))?;
        }
        *count -= 1;
        Ok(())
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    /// Returns `Ok(true)` if the semaphore was claimed.
    pub fn wait_timeout(&self, timeout: Duration) -> DmaResult<bool> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| DmaError::Exception("semaphore lock poisoned"))?;
        let deadline = std::time::Instant::now() + timeout;
        while *count == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, res) = self
                .cv
                .wait_timeout(count, deadline - now)
                .map_err(|_| DmaError::Exception("semaphore wait poisoned"))?;
            count = guard;
            if res.timed_out() && *count == 0 {
                return Ok(false);
            }
        }
        *count -= 1;
        Ok(true)
    }

    /// Decrement the count if it is non-zero, without blocking.
    pub fn try_wait(&self) -> DmaResult<bool> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| DmaError::Exception("semaphore lock poisoned"))?;
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) -> DmaResult<()> {
        let mut count = self
            .count
            .lock()
            .map_err(|_| DmaError::Exception("semaphore lock poisoned"))?;
        *count += 1;
        self.cv.notify_one();
        Ok(())
    }

    /// Current count. Racy by nature; useful for assertions only.
    pub fn value(&self) -> u32 {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reset the count, discarding any accumulated posts. Used when a
    /// pooled semaphore is recycled for a new owner.
    pub fn reinit(&self, value: u32) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_post() {
        let sem = Semaphore::new(1);
        sem.wait().unwrap();
        assert_eq!(sem.value(), 0);
        assert!(!sem.try_wait().unwrap());
        sem.post().unwrap();
        assert!(sem.try_wait().unwrap());
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let th = thread::spawn(move || {
            sem2.wait().unwrap();
        });
        // The waiter cannot finish before the post arrives.
        thread::sleep(Duration::from_millis(20));
        assert!(!th.is_finished());
        sem.post().unwrap();
        th.join().unwrap();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sem = Semaphore::new(0);
        let claimed = sem.wait_timeout(Duration::from_millis(10)).unwrap();
        assert!(!claimed);
    }

    #[test]
    fn test_reinit_discards_posts() {
        let sem = Semaphore::new(0);
        sem.post().unwrap();
        sem.post().unwrap();
        sem.reinit(1);
        assert_eq!(sem.value(), 1);
    }
}
