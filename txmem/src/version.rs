// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The version lock is a special type word sized spin lock, that
//! contains a single bit to indicate a lock, while using the rest
//! of the bits for versioning.

use crate::TxError;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Every successful write commit moves the global clock by this amount, which keeps all
/// published versions even and leaves the lowest bit free for the lock.
pub const CLOCK_STEP: usize = 2;

const LOCK_BIT: usize = 1;

/// A [`VersionLock`] is a combination of a simple bounded spin-locking mechanism, needing
/// 1-bit of a word-sized value to lock a certain region. The rest of the value holds the
/// version at which the current value of the region has been published. Use a
/// [`VersionClock`] to hand out versions.
#[derive(Debug, Default)]
pub struct VersionLock {
    atomic: AtomicUsize,
}

impl VersionLock {
    /// Creates a new unlocked [`VersionLock`] with the desired version
    pub const fn new(version: usize) -> Self {
        Self {
            atomic: AtomicUsize::new(version & !LOCK_BIT),
        }
    }

    /// Returns the raw word, lock bit included.
    #[inline]
    pub fn load(&self) -> usize {
        self.atomic.load(Ordering::Acquire)
    }

    /// Returns `true`, if the given raw word carries the lock bit
    #[inline]
    pub fn is_locked(word: usize) -> bool {
        word & LOCK_BIT != 0
    }

    /// Returns the version stored inside a raw word
    #[inline]
    pub fn version_of(word: usize) -> usize {
        word & !LOCK_BIT
    }

    /// Returns the stored version
    pub fn version(&self) -> usize {
        Self::version_of(self.load())
    }

    /// Tries to acquire the lock with a single compare-and-swap and returns the version that
    /// was published before locking.
    ///
    /// # Example
    /// ```
    /// use stronghold_txmem::VersionLock;
    /// let lock = VersionLock::new(4);
    /// assert_eq!(lock.try_lock(), Ok(4));
    /// assert!(VersionLock::is_locked(lock.load()));
    /// assert!(lock.try_lock().is_err());
    /// ```
    pub fn try_lock(&self) -> Result<usize, TxError> {
        let current = self.atomic.load(Ordering::Relaxed);
        if Self::is_locked(current) {
            return Err(TxError::Retry);
        }

        self.atomic
            .compare_exchange(current, current | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| current)
            .map_err(|_| TxError::Retry)
    }

    /// Releases the lock without changing the version
    #[inline]
    pub fn unlock(&self) {
        self.atomic.fetch_and(!LOCK_BIT, Ordering::Release);
    }

    /// Releases the lock and sets the new version in one release store. Everything written
    /// before this call becomes visible together with the new version.
    #[inline]
    pub fn unlock_publish(&self, version: usize) {
        debug_assert!(Self::is_locked(self.atomic.load(Ordering::Relaxed)));
        debug_assert!(!Self::is_locked(version));
        self.atomic.store(version, Ordering::Release);
    }
}

/// An atomic `VersionClock` with a simpler interface. This type should be
/// used for keeping track of a global version counter
#[derive(Debug, Default)]
pub struct VersionClock {
    atomic: AtomicUsize,
}

impl VersionClock {
    pub const fn new(version: usize) -> Self {
        Self {
            atomic: AtomicUsize::new(version & !LOCK_BIT),
        }
    }

    /// Returns the current version
    #[inline]
    pub fn version(&self) -> usize {
        self.atomic.load(Ordering::Acquire)
    }

    /// Atomically advances the clock by [`CLOCK_STEP`] and returns the new version
    #[inline]
    pub fn advance(&self) -> usize {
        self.atomic.fetch_add(CLOCK_STEP, Ordering::AcqRel) + CLOCK_STEP
    }
}
