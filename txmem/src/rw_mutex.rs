// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A word sized reader-writer spin lock favoring many readers and rare writers.
//!
//! The most significant bit marks a writer, the remaining bits count readers. Writers first
//! claim the writer bit, which stops new readers from entering, and then wait for the readers
//! already inside to drain. Waiting is done with a [`BusyBreaker`] capped at the shift given to
//! [`FastRwMutex::with_max_backoff_shift`], no kernel primitive is involved.

use crate::{breaker::DEFAULT_MAX_SHIFT, BusyBreaker};
use std::sync::atomic::{fence, AtomicUsize, Ordering};

const WRITE_BIT: usize = 1 << (usize::BITS - 1);

#[derive(Debug)]
pub struct FastRwMutex {
    state: AtomicUsize,
    max_backoff_shift: usize,
}

impl Default for FastRwMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl FastRwMutex {
    pub const fn new() -> Self {
        Self::with_max_backoff_shift(DEFAULT_MAX_SHIFT)
    }

    /// Creates a mutex whose waiters back off up to `2^shift` spin hints
    pub const fn with_max_backoff_shift(shift: usize) -> Self {
        Self {
            state: AtomicUsize::new(0),
            max_backoff_shift: shift,
        }
    }

    fn breaker(&self) -> BusyBreaker {
        BusyBreaker::new(self.max_backoff_shift)
    }

    /// Enters as a reader.
    pub fn lock_shared(&self) {
        let state = self.state.fetch_add(1, Ordering::Acquire);
        if state & WRITE_BIT == 0 {
            return;
        }

        // a writer is present or pending: undo and wait for it to leave
        self.state.fetch_sub(1, Ordering::Relaxed);
        let mut breaker = self.breaker();
        loop {
            breaker.spin();

            let mut current = self.state.load(Ordering::Relaxed);
            while current & WRITE_BIT == 0 {
                match self
                    .state
                    .compare_exchange_weak(current, current + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        fence(Ordering::Acquire);
                        return;
                    }
                    Err(actual) => current = actual,
                }
            }
        }
    }

    pub fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    /// Enters as the single writer.
    pub fn lock(&self) {
        let mut breaker = self.breaker();

        let mut previous = self.state.fetch_or(WRITE_BIT, Ordering::Relaxed);
        while previous & WRITE_BIT != 0 {
            breaker.spin();
            previous = self.state.fetch_or(WRITE_BIT, Ordering::Relaxed);
        }

        breaker.reset();

        // readers that got in before the writer bit was set
        while previous & !WRITE_BIT != 0 {
            breaker.spin();
            previous = self.state.load(Ordering::Relaxed);
        }

        fence(Ordering::Acquire);
    }

    /// Tries to enter as the writer without waiting.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, WRITE_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Leaves the writer side. Readers backing off may still have their increment in the
    /// count, so only the writer bit is cleared.
    pub fn unlock(&self) {
        self.state.fetch_and(!WRITE_BIT, Ordering::Release);
    }

    /// Returns `true`, if a writer holds or waits for the lock
    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITE_BIT != 0
    }

    pub fn read(&self) -> SharedGuard<'_> {
        self.lock_shared();
        SharedGuard { mutex: self }
    }

    pub fn write(&self) -> ExclusiveGuard<'_> {
        self.lock();
        ExclusiveGuard { mutex: self }
    }
}

/// Releases the shared side on drop.
pub struct SharedGuard<'a> {
    mutex: &'a FastRwMutex,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_shared();
    }
}

/// Releases the exclusive side on drop.
pub struct ExclusiveGuard<'a> {
    mutex: &'a FastRwMutex,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::FastRwMutex;
    use std::{
        cell::UnsafeCell,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use threadpool::ThreadPool;

    struct Shared {
        mutex: FastRwMutex,
        // two halves that writers always keep equal
        pair: UnsafeCell<(usize, usize)>,
        writers_inside: AtomicUsize,
    }

    unsafe impl Sync for Shared {}

    #[test]
    fn test_try_lock() {
        let mutex = FastRwMutex::new();

        assert!(mutex.try_lock());
        assert!(mutex.is_locked_exclusive());
        assert!(!mutex.try_lock());
        mutex.unlock();

        let guard = mutex.read();
        assert!(!mutex.try_lock());
        drop(guard);

        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn test_backoff_follows_shift() {
        assert!(FastRwMutex::with_max_backoff_shift(0).breaker().is_capped());
        assert!(!FastRwMutex::new().breaker().is_capped());

        let mutex = FastRwMutex::with_max_backoff_shift(0);
        let guard = mutex.read();
        assert!(!mutex.try_lock());
        drop(guard);
        let _w = mutex.write();
        assert!(mutex.is_locked_exclusive());
    }

    #[test]
    fn test_readers_share() {
        let mutex = FastRwMutex::new();

        let a = mutex.read();
        let b = mutex.read();
        assert!(!mutex.is_locked_exclusive());
        drop(a);
        drop(b);

        let _w = mutex.write();
        assert!(mutex.is_locked_exclusive());
    }

    #[test]
    fn test_rw_mutex_threaded() {
        let shared = Arc::new(Shared {
            mutex: FastRwMutex::new(),
            pair: UnsafeCell::new((0, 0)),
            writers_inside: AtomicUsize::new(0),
        });
        let pool = ThreadPool::new(8);
        let runs = 2000;

        for i in 0..64 {
            let shared = shared.clone();
            pool.execute(move || {
                for _ in 0..runs {
                    if i % 8 == 0 {
                        let _guard = shared.mutex.write();
                        assert_eq!(shared.writers_inside.fetch_add(1, Ordering::SeqCst), 0);
                        let pair = unsafe { &mut *shared.pair.get() };
                        pair.0 += 1;
                        pair.1 += 1;
                        shared.writers_inside.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let _guard = shared.mutex.read();
                        assert_eq!(shared.writers_inside.load(Ordering::SeqCst), 0);
                        let pair = unsafe { &*shared.pair.get() };
                        assert_eq!(pair.0, pair.1);
                    }
                }
            });
        }

        pool.join();
        assert_eq!(pool.panic_count(), 0);

        let pair = unsafe { &*shared.pair.get() };
        assert_eq!(pair.0, 8 * runs);
    }
}
