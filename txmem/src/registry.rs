// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Thread Registry
//!
//! Every thread taking part in transactions owns a [`ThreadRecord`] that is linked into the
//! registry of its [`crate::Context`]. The registry is used to detect grace periods: a
//! synchronizing thread claims a bit of the grace period word, and waits twice for every other
//! record to leave the critical section it was in when the bit flipped. Only after that,
//! memory unlinked before the synchronization started can be released.
//!
//! Linking and unlinking records is rare. Both take the registry lock exclusively and lock
//! every record, so that no synchronizing thread can walk over a half linked record. Walking
//! the list while waiting is lock free.

use crate::{BusyBreaker, FastRwMutex, GpCallback};
use crossbeam_utils::CachePadded;
use log::*;
use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering},
    thread::{self, ThreadId},
};

/// Commit and retry counters of a single thread
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    /// successfully finished atomic blocks
    pub commits: usize,

    /// attempts that have been run again
    pub retries: usize,
}

/// State only the owning thread touches.
#[derive(Debug, Default)]
pub(crate) struct LocalState {
    pub(crate) deferred: Vec<GpCallback>,
    pub(crate) stats: TxStats,

    /// live handles sharing the record
    pub(crate) handles: usize,
}

pub(crate) struct ThreadRecord {
    /// zero outside of a critical section, the grace period word seen at entry otherwise
    active: CachePadded<AtomicUsize>,
    lock: FastRwMutex,
    next: AtomicPtr<ThreadRecord>,
    owner: ThreadId,
    local: UnsafeCell<LocalState>,
}

// `local` is only accessed by the owning thread through its handle
unsafe impl Sync for ThreadRecord {}
unsafe impl Send for ThreadRecord {}

impl ThreadRecord {
    fn new(max_backoff_shift: usize) -> Self {
        Self {
            active: CachePadded::new(AtomicUsize::new(0)),
            lock: FastRwMutex::with_max_backoff_shift(max_backoff_shift),
            next: AtomicPtr::new(ptr::null_mut()),
            owner: thread::current().id(),
            local: UnsafeCell::new(LocalState::default()),
        }
    }

    /// Returns the owner's local state.
    ///
    /// # Safety
    /// Must only be called by the owning thread, and the reference must not overlap with
    /// another one returned by this function.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn local(&self) -> &mut LocalState {
        &mut *self.local.get()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed) != 0
    }
}

pub(crate) struct Registry {
    head: CachePadded<AtomicPtr<ThreadRecord>>,
    mutex: FastRwMutex,

    /// bit 0 is always set, so that an active marker can never be zero
    grace_period: CachePadded<AtomicUsize>,
    max_backoff_shift: usize,
}

impl Registry {
    pub(crate) fn new(max_backoff_shift: usize) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            mutex: FastRwMutex::with_max_backoff_shift(max_backoff_shift),
            grace_period: CachePadded::new(AtomicUsize::new(1)),
            max_backoff_shift,
        }
    }

    fn breaker(&self) -> BusyBreaker {
        BusyBreaker::new(self.max_backoff_shift)
    }

    /// Locks every linked record. The registry lock must be held exclusively.
    fn lock_all(&self) {
        let mut current = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { current.as_ref() } {
            record.lock.lock();
            current = record.next.load(Ordering::Acquire);
        }
    }

    fn unlock_all(&self) {
        let mut current = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { current.as_ref() } {
            record.lock.unlock();
            current = record.next.load(Ordering::Acquire);
        }
    }

    /// Links a new record at the head of the list and returns it.
    pub(crate) fn insert(&self) -> *mut ThreadRecord {
        let record = Box::new(ThreadRecord::new(self.max_backoff_shift));

        // released by the unlock pass below together with all others
        record.lock.lock();
        let record = Box::into_raw(record);

        let _guard = self.mutex.write();
        self.lock_all();

        unsafe { (*record).next.store(self.head.load(Ordering::Relaxed), Ordering::Relaxed) };
        self.head.store(record, Ordering::Release);

        self.unlock_all();

        debug!("REGISTRY: INSERT RECORD ({:?}) FOR {:?}", record, std::thread::current().id());
        record
    }

    /// Unlinks and frees a record previously returned by [`Registry::insert`].
    ///
    /// # Safety
    /// The record must belong to this registry, must not be active, and must not be used
    /// after this call.
    pub(crate) unsafe fn remove(&self, record: *mut ThreadRecord) {
        {
            let _guard = self.mutex.write();
            self.lock_all();

            let mut link: &AtomicPtr<ThreadRecord> = &self.head;
            loop {
                let current = link.load(Ordering::Relaxed);
                if current.is_null() {
                    break;
                }
                if current == record {
                    link.store((*record).next.load(Ordering::Relaxed), Ordering::Release);
                    break;
                }
                link = &(*current).next;
            }

            // the unlinked record stays locked and is freed below
            self.unlock_all();
        }

        debug!("REGISTRY: REMOVE RECORD ({:?}) FOR {:?}", record, std::thread::current().id());
        drop(Box::from_raw(record));
    }

    /// Returns the record created by the calling thread, if there is one.
    pub(crate) fn find_current(&self) -> Option<*mut ThreadRecord> {
        let _guard = self.mutex.read();
        let me = thread::current().id();

        let mut current = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { current.as_ref() } {
            if record.owner == me {
                return Some(current);
            }
            current = record.next.load(Ordering::Acquire);
        }
        None
    }

    /// Counts the linked records
    pub(crate) fn thread_count(&self) -> usize {
        let _guard = self.mutex.read();

        let mut count = 0;
        let mut current = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { current.as_ref() } {
            count += 1;
            current = record.next.load(Ordering::Acquire);
        }
        count
    }

    /// Marks the entry of `record` into a critical section.
    #[inline]
    pub(crate) fn access_lock(&self, record: &ThreadRecord) {
        record
            .active
            .store(self.grace_period.load(Ordering::Relaxed), Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Marks the exit of `record` from a critical section.
    #[inline]
    pub(crate) fn access_unlock(&self, record: &ThreadRecord) {
        record.active.store(0, Ordering::Release);
    }

    /// Claims the lowest free bit of the grace period word.
    fn acquire_gp_bit(&self) -> usize {
        let mut breaker = self.breaker();
        let mut gp = self.grace_period.load(Ordering::Relaxed);

        loop {
            let free = !gp & (!gp).wrapping_neg();
            if free == 0 {
                // every bit is taken by another synchronizing thread
                breaker.spin();
                gp = self.grace_period.load(Ordering::Relaxed);
                continue;
            }

            match self
                .grace_period
                .compare_exchange_weak(gp, gp | free, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return free,
                Err(actual) => gp = actual,
            }
        }
    }

    /// Waits for every record that is active with the bit `gp` equal to `desired`.
    fn wait(&self, gp: usize, desired: bool) {
        let mut breaker = self.breaker();

        let mut current = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { current.as_ref() } {
            loop {
                let active = record.active.load(Ordering::Acquire);
                if active == 0 || ((active & gp) != 0) != desired {
                    break;
                }
                breaker.spin();
            }

            breaker.reset();
            current = record.next.load(Ordering::Acquire);
        }
    }

    /// Blocks until every thread that was inside a critical section when this call started
    /// has left it. `record` is the caller's own record, which must not be active.
    pub(crate) fn synchronize(&self, record: &ThreadRecord) {
        debug_assert!(!record.is_active());

        // keeps the list stable while walking it
        record.lock.lock();

        let gp = self.acquire_gp_bit();
        fence(Ordering::SeqCst);
        self.wait(gp, false);

        // flipping the bit back also releases it for other synchronizers
        self.grace_period.fetch_xor(gp, Ordering::AcqRel);
        fence(Ordering::SeqCst);
        self.wait(gp, true);

        record.lock.unlock();

        trace!("GRACE PERIOD ({:#x}) COMPLETE FOR {:?}", gp, std::thread::current().id());
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let record = unsafe { Box::from_raw(current) };
            current = record.next.load(Ordering::Relaxed);
        }
    }
}
