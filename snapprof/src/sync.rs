//! Instrumented synchronization primitives
//!
//! These feed the block and mutex profiles. Use [`Mutex`] in place of
//! `std::sync::Mutex` where contention matters, and wrap other waits
//! (channel receives, joins, condition variables) in [`measure_blocking`].
//!
//! Recording is cheap while the corresponding profile is disabled: a lock
//! that is acquired without waiting never reads the clock.

use std::fmt;
use std::sync::{LockResult, MutexGuard, TryLockError, TryLockResult};
use std::time::{Duration, Instant};

use crate::instrumentation::contention::{block_profile, mutex_profile};

/// Record a wait that has already been measured
pub fn record_blocking(waited: Duration) {
    block_profile().record(waited);
}

/// Run `f`, recording the time it takes as a blocking event
pub fn measure_blocking<T>(f: impl FnOnce() -> T) -> T {
    if !block_profile().is_enabled() {
        return f();
    }
    let start = Instant::now();
    let value = f();
    record_blocking(start.elapsed());
    value
}

/// A mutual exclusion primitive that records contended acquisitions
///
/// Behaves like `std::sync::Mutex`. When `lock` has to wait, the wait is
/// offered to both the mutex profile and the block profile.
pub struct Mutex<T: ?Sized> {
    inner: std::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: std::sync::Mutex::new(value) }
    }

    /// Consume the mutex, returning the protected data
    ///
    /// # Errors
    /// Returns an error if the mutex is poisoned
    pub fn into_inner(self) -> LockResult<T> {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the mutex, blocking the current thread until it is available
    ///
    /// # Errors
    /// Returns an error if another holder panicked while holding the lock
    pub fn lock(&self) -> LockResult<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Err(poisoned),
            Err(TryLockError::WouldBlock) => {}
        }

        let start = Instant::now();
        let result = self.inner.lock();
        let waited = start.elapsed();
        mutex_profile().record(waited);
        block_profile().record(waited);
        result
    }

    /// Attempt to acquire the mutex without blocking
    ///
    /// # Errors
    /// Returns an error if the lock is held or poisoned
    pub fn try_lock(&self) -> TryLockResult<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Mutable access without locking, the borrow guarantees exclusivity
    ///
    /// # Errors
    /// Returns an error if the mutex is poisoned
    pub fn get_mut(&mut self) -> LockResult<&mut T> {
        self.inner.get_mut()
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.inner.is_poisoned()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("inner", &&self.inner).finish()
    }
}
