//! Bounded-retry spinlocks and per-core partitioning.
//!
//! Nothing here blocks: every acquisition gives up after a fixed number of
//! compare-and-swap attempts and hands the failure back to the caller, which
//! must have a cheaper fallback path ready.

mod percpu;

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

pub use self::percpu::{current_cpu, online_cpus, parse_cpu_online_text, PerCpu, MAX_CPUS};

/// Default number of acquisition attempts before a lock reports contention.
pub const DEFAULT_LOCK_RETRIES: u32 = 1000;

/// Errors returned by lock acquisition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("lock still held after {retries} attempts")]
    Contended { retries: u32 },
}

/// A test-and-set lock flag backed by a single counter cell.
///
/// `0` means free and `1` means held. There is no owner tracking, so
/// `release` from any context frees the cell.
#[derive(Debug, Default)]
pub struct LockCell {
    state: AtomicU64,
}

impl LockCell {
    /// Create an unlocked cell.
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Attempt the 0 -> 1 transition up to `retries` times.
    pub fn acquire(&self, retries: u32) -> Result<(), LockError> {
        for _ in 0..retries {
            if self
                .state
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        Err(LockError::Contended { retries })
    }

    /// Perform the 1 -> 0 transition. A cell that is already free stays free.
    pub fn release(&self) {
        let _ = self
            .state
            .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed);
    }

    /// Whether the cell is currently held.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

/// A value guarded by a [`LockCell`].
///
/// Used for per-core working sets: each core's slot has its own lock, so
/// contention only happens when two contexts claim the same core index.
pub struct SpinLock<T> {
    cell: LockCell,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is only handed out through `SpinGuard`, which
// exists only while `cell` is held.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wrap `value` behind an unlocked cell.
    pub fn new(value: T) -> Self {
        Self {
            cell: LockCell::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Try to lock within `retries` attempts.
    pub fn lock(&self, retries: u32) -> Result<SpinGuard<'_, T>, LockError> {
        self.cell.acquire(retries)?;
        Ok(SpinGuard { lock: self })
    }

    /// Whether a guard currently exists.
    pub fn is_locked(&self) -> bool {
        self.cell.is_locked()
    }

    /// Consume the lock and return the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard; releases the cell on drop.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the cell, so no other reference exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the cell, so no other reference exists.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.cell.release();
    }
}
