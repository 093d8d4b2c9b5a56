// crates/heidi-kernel-bridge/src/semaphore.rs
// ============================================================================
// Module: Call Semaphore
// Description: Blocking counting semaphore with RAII permits.
// Purpose: Bound the number of kernel calls in flight.
// Dependencies: std
// ============================================================================

//! ## Overview
//! A [`Semaphore`] hands out at most `capacity` [`SemaphorePermit`]s.
//! Acquiring blocks until a permit is returned; dropping a permit returns it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;

use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Semaphore failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    /// The permit counter lock was poisoned.
    #[error("call semaphore poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Semaphore
// ============================================================================

/// Counting semaphore.
///
/// # Invariants
/// - `0 <= available <= capacity`.
#[derive(Debug)]
pub struct Semaphore {
    /// Free permits.
    available: Mutex<usize>,
    /// Signalled when a permit is returned.
    returned: Condvar,
    /// Total permits.
    capacity: usize,
}

impl Semaphore {
    /// Creates a semaphore with `capacity` permits.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            returned: Condvar::new(),
            capacity,
        }
    }

    /// Blocks until a permit is free and takes it.
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::Poisoned`] when the counter lock is poisoned.
    pub fn acquire(&self) -> Result<SemaphorePermit<'_>, SemaphoreError> {
        let guard = self.available.lock().map_err(|_| SemaphoreError::Poisoned)?;
        let mut guard = self
            .returned
            .wait_while(guard, |available| *available == 0)
            .map_err(|_| SemaphoreError::Poisoned)?;
        *guard -= 1;
        Ok(SemaphorePermit {
            semaphore: self,
        })
    }

    /// Returns the number of free permits.
    #[must_use]
    pub fn available(&self) -> usize {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the total number of permits.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns one permit and wakes a waiter.
    fn release(&self) {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        *available = (*available + 1).min(self.capacity);
        drop(available);
        self.returned.notify_one();
    }
}

/// Permit returned to its [`Semaphore`] on drop.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    /// Owning semaphore.
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        reason = "Test assertions use expect/unwrap for clarity."
    )]

    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use super::*;

    /// Tests that permits return on drop.
    #[test]
    fn permits_are_returned_on_drop() {
        let semaphore = Semaphore::new(2);
        let first = semaphore.acquire().expect("first");
        let second = semaphore.acquire().expect("second");
        assert_eq!(semaphore.available(), 0);
        drop(first);
        assert_eq!(semaphore.available(), 1);
        drop(second);
        assert_eq!(semaphore.available(), 2);
    }

    /// Tests that acquire blocks while no permit is free.
    #[test]
    fn acquire_blocks_until_release() {
        let semaphore = Arc::new(Semaphore::new(1));
        let acquired = Arc::new(AtomicBool::new(false));
        let held = semaphore.acquire().expect("held");
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _permit = semaphore.acquire().expect("waiter");
                acquired.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(held);
        waiter.join().expect("join");
        assert!(acquired.load(Ordering::SeqCst));
    }
}
