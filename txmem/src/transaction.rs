// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactions
//!
//! This module implements a variation of the TL2 algorithm described by Shavit et al. Every
//! [`Var`] carries a [`VersionLock`]. A transaction samples the global [`VersionClock`] when it
//! starts and accepts only values published at or before this snapshot.
//!
//! Read-write transactions keep a read set and a write set. Written values stay private until
//! commit. Commit locks the write set in address order, advances the clock, validates the read
//! set and publishes every pending value together with its new version.
//!
//! Read-only transactions keep no sets at all. Every load is validated against the snapshot on
//! the spot.

use crate::{
    var::VarBase, GpCallback, Storage, StorageKind, Transactable, TxError, Var, VersionClock, VersionLock,
    CLOCK_STEP,
};
use log::*;
use std::{alloc::GlobalAlloc, marker::PhantomData, sync::atomic::Ordering};

/// Loads the value of `base` and checks it against the snapshot `version`.
///
/// # Safety
/// `T` must be the value type of the var owning `base`, and the calling thread must be inside
/// a critical section.
unsafe fn load_validated<T: Transactable>(base: &VarBase, version: usize) -> Result<T, TxError> {
    let before = base.lock.load();
    if VersionLock::is_locked(before) || VersionLock::version_of(before) > version {
        return Err(TxError::Retry);
    }

    let word = base.storage.load(Ordering::Acquire);
    let value = <T::Storage as Storage<T>>::load(word);

    if base.lock.load() != before {
        return Err(TxError::Retry);
    }

    Ok(value)
}

/// A pending value for a variable.
struct WriteEntry {
    base: *const VarBase,
    word: usize,
}

impl WriteEntry {
    fn base(&self) -> &VarBase {
        unsafe { &*self.base }
    }
}

/// A read-write transaction.
///
/// All variables used inside a transaction are borrowed for the lifetime `'env`, which
/// outlives the atomic block. Variables created inside the block can not be used with it.
pub struct Transaction<'env> {
    /// Id of the context running this transaction
    context: usize,

    /// A snapshot of the global version counter
    version: usize,

    /// Variables read so far, each at most once
    reads: Vec<*const VarBase>,

    /// Variables and their private pending values, each variable at most once
    writes: Vec<WriteEntry>,

    /// Destruction of replaced values, run after the next grace period
    retired: Vec<GpCallback>,

    _env: PhantomData<*mut &'env ()>,
}

impl<'env> Transaction<'env> {
    pub(crate) fn new(context: usize) -> Self {
        Self {
            context,
            version: 0,
            reads: Vec::new(),
            writes: Vec::new(),
            retired: Vec::new(),
            _env: PhantomData,
        }
    }

    pub(crate) fn begin(&mut self, version: usize) {
        debug_assert!(self.reads.is_empty() && self.writes.is_empty());
        self.version = version;
    }

    /// Returns the snapshot version this transaction runs against
    pub fn version(&self) -> usize {
        self.version
    }

    /// Reads the value of `var`. A value written earlier in this transaction is returned as is.
    pub fn load<T, A>(&mut self, var: &'env Var<T, A>) -> Result<T, TxError>
    where
        T: Transactable,
        A: GlobalAlloc,
    {
        var.base().bind(self.context)?;
        let base = var.base() as *const VarBase;

        if let Some(entry) = self.writes.iter().find(|entry| entry.base == base) {
            // SAFETY: the pending word is private and belongs to a var of type T
            return Ok(unsafe { <T::Storage as Storage<T>>::load(entry.word) });
        }

        // SAFETY: the dispatcher runs every attempt inside a critical section
        let value = unsafe { load_validated::<T>(var.base(), self.version)? };
        if !self.reads.contains(&base) {
            self.reads.push(base);
        }

        Ok(value)
    }

    /// Stages `value` for `var`. Nothing is visible to other threads before commit.
    pub fn store<T, A>(&mut self, var: &'env Var<T, A>, value: T) -> Result<(), TxError>
    where
        T: Transactable,
        A: GlobalAlloc,
    {
        var.base().bind(self.context)?;
        let base = var.base() as *const VarBase;

        match self.writes.iter_mut().find(|entry| entry.base == base) {
            // SAFETY: the pending word is private and belongs to a var of type T
            Some(entry) => unsafe { <T::Storage as Storage<T>>::store(&mut entry.word, value) },
            None => {
                let word = <T::Storage as Storage<T>>::allocate_construct(var.allocator(), value)?;
                self.writes.push(WriteEntry { base, word });
            }
        }

        Ok(())
    }

    /// Runs a nested read-write block inside this transaction.
    pub fn read_write<R, F>(&mut self, f: F) -> Result<R, TxError>
    where
        F: FnOnce(&mut Transaction<'env>) -> Result<R, TxError>,
    {
        f(self)
    }

    /// Runs a nested read-only block inside this transaction. The block sees all values
    /// written so far by this transaction.
    pub fn read_only<R, F>(&mut self, f: F) -> Result<R, TxError>
    where
        F: FnOnce(&mut ReadTransaction<'_, 'env>) -> Result<R, TxError>,
    {
        f(&mut ReadTransaction {
            mode: ReadMode::Nested(self),
        })
    }

    /// Releases the write locks of the first `count` entries of the sorted write set.
    fn unlock_writes(&self, count: usize) {
        for entry in &self.writes[..count] {
            entry.base().note_unlocked();
            entry.base().lock.unlock();
        }
    }

    /// Locks the write set in address order. Variables also found in the read set are removed
    /// from it, once their pre-lock version is known to match the snapshot.
    fn lock_write_set(&mut self) -> Result<(), TxError> {
        self.writes.sort_unstable_by_key(|entry| entry.base as usize);

        for index in 0..self.writes.len() {
            let base = self.writes[index].base;

            let previous = match self.writes[index].base().lock.try_lock() {
                Ok(previous) => {
                    self.writes[index].base().note_locked();
                    previous
                }
                Err(e) => {
                    trace!("TRANSACTION({:?}): LOCK WRITE SET FAILED", std::thread::current().id());
                    self.unlock_writes(index);
                    return Err(e);
                }
            };

            if let Some(position) = self.reads.iter().position(|read| *read == base) {
                if previous > self.version {
                    trace!("TRANSACTION({:?}): STALE READ OF LOCKED VAR", std::thread::current().id());
                    self.unlock_writes(index + 1);
                    return Err(TxError::Retry);
                }
                self.reads.swap_remove(position);
            }
        }

        Ok(())
    }

    /// Checks that no variable of the read set changed after the snapshot.
    fn validate(&self, wv: usize) -> Result<(), TxError> {
        // nobody committed between the snapshot and this commit
        if self.version + CLOCK_STEP == wv {
            return Ok(());
        }

        for read in &self.reads {
            let word = unsafe { &**read }.lock.load();
            if VersionLock::is_locked(word) || VersionLock::version_of(word) > self.version {
                trace!("TRANSACTION({:?}): VALIDATION FAILED", std::thread::current().id());
                return Err(TxError::Retry);
            }
        }

        Ok(())
    }

    /// Publishes every pending value with the new version. Replaced boxed values are queued
    /// for destruction after the next grace period.
    fn publish(&mut self, wv: usize) {
        for entry in self.writes.drain(..) {
            let base = unsafe { &*entry.base };
            let previous = base.storage.swap(entry.word, Ordering::Release);
            base.note_unlocked();
            base.lock.unlock_publish(wv);

            if base.kind == StorageKind::Boxed {
                let base = entry.base;
                self.retired.push(GpCallback::new(move || unsafe { (*base).destroy(previous) }));
            }
        }
    }

    /// Commits the transaction. An empty write set commits without touching shared state.
    pub(crate) fn commit(&mut self, clock: &VersionClock) -> Result<(), TxError> {
        if self.writes.is_empty() {
            self.reads.clear();
            return Ok(());
        }

        self.lock_write_set()?;

        let wv = clock.advance();

        if let Err(e) = self.validate(wv) {
            self.unlock_writes(self.writes.len());
            return Err(e);
        }

        self.publish(wv);
        self.reads.clear();

        trace!(
            "TRANSACTION({:?}): COMMIT WITH VERSION ({:04})",
            std::thread::current().id(),
            wv
        );

        Ok(())
    }

    /// Destroys all pending values and clears both sets for the next attempt.
    pub(crate) fn abort(&mut self) {
        for entry in self.writes.drain(..) {
            // SAFETY: pending words were never published
            unsafe { (*entry.base).destroy(entry.word) };
        }
        self.reads.clear();
    }

    /// Takes the destruction work queued by the last commit.
    pub(crate) fn take_retired(&mut self) -> Vec<GpCallback> {
        std::mem::take(&mut self.retired)
    }

    pub(crate) fn has_retired(&self) -> bool {
        !self.retired.is_empty()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

enum ReadMode<'a, 'env> {
    Snapshot {
        context: usize,
        version: usize,
        _env: PhantomData<*mut &'env ()>,
    },
    Nested(&'a mut Transaction<'env>),
}

/// A read-only transaction.
///
/// Outside of any other transaction it validates every load against its snapshot. Opened from
/// a [`Transaction`] it reads through that transaction instead.
pub struct ReadTransaction<'a, 'env> {
    mode: ReadMode<'a, 'env>,
}

impl<'a, 'env> ReadTransaction<'a, 'env> {
    pub(crate) fn snapshot(context: usize, version: usize) -> Self {
        Self {
            mode: ReadMode::Snapshot {
                context,
                version,
                _env: PhantomData,
            },
        }
    }

    /// Returns the snapshot version this transaction runs against
    pub fn version(&self) -> usize {
        match &self.mode {
            ReadMode::Snapshot { version, .. } => *version,
            ReadMode::Nested(tx) => tx.version(),
        }
    }

    /// Reads the value of `var`
    pub fn load<T, A>(&mut self, var: &'env Var<T, A>) -> Result<T, TxError>
    where
        T: Transactable,
        A: GlobalAlloc,
    {
        match &mut self.mode {
            ReadMode::Snapshot { context, version, .. } => {
                var.base().bind(*context)?;
                // SAFETY: the dispatcher runs every attempt inside a critical section
                unsafe { load_validated::<T>(var.base(), *version) }
            }
            ReadMode::Nested(tx) => tx.load(var),
        }
    }

    /// Runs a nested read-only block inside this transaction.
    pub fn read_only<R, F>(&mut self, f: F) -> Result<R, TxError>
    where
        F: FnOnce(&mut ReadTransaction<'a, 'env>) -> Result<R, TxError>,
    {
        f(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use rand::Rng;
    use std::{alloc::System, sync::Arc};
    use threadpool::ThreadPool;

    const CONTEXT: usize = 1;

    #[ctor::ctor]
    fn init_logger() {
        #[cfg(feature = "verbose")]
        let level = log::LevelFilter::Trace;

        #[cfg(not(feature = "verbose"))]
        let level = log::LevelFilter::Debug;

        let _ = env_logger::builder().is_test(true).filter_level(level).try_init();
    }

    #[test]
    fn test_single_thread_commit() {
        let clock = VersionClock::default();
        let a = Var::new(1usize);
        let b = Var::new(String::from("one"));

        let mut tx = Transaction::new(CONTEXT);
        tx.begin(clock.version());

        let value = tx.load(&a).expect("load failed");
        tx.store(&a, value + 1).expect("store failed");
        tx.store(&b, String::from("two")).expect("store failed");
        tx.store(&b, String::from("three")).expect("store failed");

        // own writes are visible
        assert_eq!(tx.load(&a), Ok(2));
        assert_eq!(tx.load(&b), Ok(String::from("three")));

        tx.commit(&clock).expect("commit failed");
        assert_eq!(clock.version(), CLOCK_STEP);
        assert_eq!(a.version(), CLOCK_STEP);
        assert_eq!(b.version(), CLOCK_STEP);

        // the replaced string waits for a grace period
        assert!(tx.has_retired());
        for callback in tx.take_retired() {
            callback.call();
        }

        drop(tx);
        assert_eq!(a.into_inner(), 2);
        assert_eq!(b.into_inner(), "three");
    }

    #[test]
    fn test_empty_commit_keeps_clock() {
        let clock = VersionClock::default();
        let a = Var::new(1usize);

        let mut tx = Transaction::new(CONTEXT);
        tx.begin(clock.version());
        tx.load(&a).expect("load failed");
        tx.commit(&clock).expect("commit failed");

        assert_eq!(clock.version(), 0);
        assert!(!tx.has_retired());
    }

    #[test]
    fn test_locked_var_forces_retry() {
        let clock = VersionClock::default();
        let a = Var::new(1usize);

        a.base().lock.try_lock().expect("lock is free");

        let mut tx = Transaction::new(CONTEXT);
        tx.begin(clock.version());
        assert_eq!(tx.load(&a), Err(TxError::Retry));

        tx.store(&a, 3).expect("store failed");
        assert_eq!(tx.commit(&clock), Err(TxError::Retry));
        drop(tx);

        a.base().lock.unlock();
        assert_eq!(a.version(), 0);
        assert_eq!(a.into_inner(), 1);
    }

    #[test]
    fn test_stale_read_fails_validation() {
        let clock = VersionClock::default();
        let a = Var::new(1usize);
        let b = Var::new(1usize);

        let mut tx = Transaction::new(CONTEXT);
        tx.begin(clock.version());
        let value = tx.load(&a).expect("load failed");

        // another commit changes `a` after the snapshot
        let mut other = Transaction::new(CONTEXT);
        other.begin(clock.version());
        other.store(&a, 10).expect("store failed");
        other.commit(&clock).expect("commit failed");

        tx.store(&b, value).expect("store failed");
        assert_eq!(tx.commit(&clock), Err(TxError::Retry));
        tx.abort();

        // the failed commit released its locks
        assert!(!VersionLock::is_locked(b.base().lock.load()));
        assert_eq!(b.version(), 0);
    }

    #[test]
    fn test_stale_read_of_written_var() {
        let clock = VersionClock::default();
        let a = Var::new(1usize);

        let mut tx = Transaction::new(CONTEXT);
        tx.begin(clock.version());
        let value = tx.load(&a).expect("load failed");

        let mut other = Transaction::new(CONTEXT);
        other.begin(clock.version());
        other.store(&a, 10).expect("store failed");
        other.commit(&clock).expect("commit failed");

        tx.store(&a, value + 1).expect("store failed");
        assert_eq!(tx.commit(&clock), Err(TxError::Retry));
        drop(tx);
        drop(other);

        assert!(!VersionLock::is_locked(a.base().lock.load()));
        assert_eq!(a.into_inner(), 10);
    }

    #[test]
    fn test_snapshot_rejects_newer_versions() {
        let clock = VersionClock::default();
        let a = Var::new_in(5u32, System);

        let mut read = ReadTransaction::snapshot(CONTEXT, clock.version());
        assert_eq!(read.load(&a), Ok(5));

        let mut tx = Transaction::new(CONTEXT);
        tx.begin(clock.version());
        tx.store(&a, 6).expect("store failed");
        tx.commit(&clock).expect("commit failed");

        assert_eq!(read.load(&a), Err(TxError::Retry));

        let mut read = ReadTransaction::snapshot(CONTEXT, clock.version());
        assert_eq!(read.load(&a), Ok(6));
    }

    #[test]
    fn test_nested_read_sees_pending_writes() {
        let clock = VersionClock::default();
        let a = Var::new(vec![1u8]);

        let mut tx = Transaction::new(CONTEXT);
        tx.begin(clock.version());
        tx.store(&a, vec![1, 2]).expect("store failed");

        let seen = tx
            .read_only(|read| read.read_only(|inner| inner.load(&a)))
            .expect("nested read failed");
        assert_eq!(seen, vec![1, 2]);

        tx.read_write(|inner| inner.store(&a, vec![3])).expect("nested write failed");
        assert_eq!(tx.load(&a), Ok(vec![3]));
    }

    #[test]
    fn test_foreign_var_is_rejected() {
        let clock = VersionClock::default();
        let owned = Var::new(String::from("owned"));

        let mut read = ReadTransaction::snapshot(CONTEXT, clock.version());
        assert_eq!(read.load(&owned), Ok(String::from("owned")));

        let mut tx = Transaction::new(CONTEXT + 1);
        tx.begin(clock.version());
        assert_eq!(tx.load(&owned), Err(TxError::ForeignVar));
        assert_eq!(tx.store(&owned, String::from("stolen")), Err(TxError::ForeignVar));
        assert_eq!(tx.commit(&clock), Ok(()));
        drop(tx);

        assert_eq!(clock.version(), 0);
        assert_eq!(owned.into_inner(), "owned");
    }

    #[test]
    fn test_commits_never_share_a_lock() {
        let ctx = Arc::new(Context::new());
        let vars: Arc<Vec<Var<String>>> = Arc::new((0..4).map(|_| ctx.create(String::new())).collect());
        let pool = ThreadPool::new(8);

        for _ in 0..8 {
            let (ctx, vars) = (ctx.clone(), vars.clone());
            pool.execute(move || {
                let mut handle = ctx.register();
                let mut rng = rand::thread_rng();

                for _ in 0..500 {
                    let (a, b) = (rng.gen_range(0..vars.len()), rng.gen_range(0..vars.len()));
                    handle
                        .read_write(|tx| {
                            let mut value = tx.load(&vars[a])?;
                            value.push('x');
                            tx.store(&vars[a], value)?;
                            tx.store(&vars[b], String::from("y"))
                        })
                        .expect("transaction failed");
                }
            });
        }

        pool.join();
        assert_eq!(pool.panic_count(), 0);

        for var in vars.iter() {
            assert_eq!(var.base().holders.load(Ordering::SeqCst), 0);
            assert_eq!(var.base().max_holders.load(Ordering::SeqCst), 1);
        }
    }
}
