// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    registry::{LocalState, ThreadRecord, TxStats},
    BusyBreaker, Context, GpCallback, ReadTransaction, Strategy, Transaction, TxError,
};
use log::*;
use std::{marker::PhantomData, ptr::NonNull};

/// A thread's membership in a [`Context`].
///
/// Atomic blocks are run through a handle. The handle is bound to the thread that created it.
/// Handles registered by one thread with the same context share a single thread record. Only
/// one atomic block runs on a thread at a time: opening a block, or synchronizing, through any
/// handle while a block is running fails with [`TxError::NestedBlock`].
///
/// Dropping the last handle of a thread waits for a final grace period, runs the remaining
/// deferred callbacks and leaves the registry.
pub struct ThreadHandle<'c> {
    ctx: &'c Context,
    record: NonNull<ThreadRecord>,
    _not_send: PhantomData<*const ()>,
}

impl<'c> ThreadHandle<'c> {
    pub(crate) fn new(ctx: &'c Context) -> Self {
        let record = match ctx.registry.find_current() {
            Some(record) => record,
            None => ctx.registry.insert(),
        };

        let mut handle = Self {
            ctx,
            // Box::into_raw never returns null
            record: unsafe { NonNull::new_unchecked(record) },
            _not_send: PhantomData,
        };
        handle.local().handles += 1;
        handle
    }

    /// Fails if the shared record is inside an atomic block.
    fn ensure_idle(&self) -> Result<(), TxError> {
        if self.record().is_active() {
            warn!("ATOMIC BLOCK OPENED INSIDE ANOTHER ON {:?}", std::thread::current().id());
            return Err(TxError::NestedBlock);
        }
        Ok(())
    }

    fn record(&self) -> &'c ThreadRecord {
        // SAFETY: the record lives until this handle is dropped
        unsafe { &*self.record.as_ptr() }
    }

    fn local(&mut self) -> &mut LocalState {
        // SAFETY: only handles of the owning thread access the local state, and none of them
        // keeps the reference across a call
        unsafe { self.record().local() }
    }

    pub fn context(&self) -> &'c Context {
        self.ctx
    }

    /// Returns commit and retry counters of this thread
    pub fn stats(&self) -> TxStats {
        // SAFETY: see `local`, the copy is taken immediately
        unsafe { self.record().local().stats }
    }

    /// Queues `f` to run after the next grace period of this thread.
    pub fn defer<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.local().deferred.push(GpCallback::new(f));
    }

    /// Waits for a grace period and runs all deferred callbacks.
    pub fn synchronize(&mut self) -> Result<(), TxError> {
        self.ensure_idle()?;
        self.ctx.registry.synchronize(self.record());
        self.run_deferred();
        Ok(())
    }

    fn run_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.local().deferred);
        for callback in deferred {
            callback.call();
        }
    }

    /// Decides whether a failed attempt runs again. Returns the error if not.
    fn on_failure(&mut self, error: TxError, breaker: &mut BusyBreaker) -> Result<(), TxError> {
        let retry = match error {
            TxError::Retry => true,
            TxError::ForeignVar => {
                error!("VARIABLE OF ANOTHER CONTEXT USED IN ATOMIC BLOCK");
                false
            }
            ref error => self.ctx.on_unhandled(error) == Strategy::Retry,
        };

        if !retry {
            return Err(error);
        }

        self.local().stats.retries += 1;
        breaker.spin();
        Ok(())
    }

    /// Runs `f` as a read-write atomic block. The block is retried until its commit succeeds,
    /// or an error other than [`TxError::Retry`] is not turned into a retry by the unhandled
    /// error hook.
    ///
    /// All variables used by the block must outlive the call. Values replaced by the commit
    /// are destroyed after a grace period, before this function returns.
    ///
    /// ```compile_fail
    /// use stronghold_txmem::Context;
    ///
    /// let ctx = Context::new();
    /// let mut handle = ctx.register();
    ///
    /// // a variable must exist before the block starts
    /// handle.read_write(|tx| {
    ///     let local = ctx.create(1usize);
    ///     tx.load(&local)
    /// });
    /// ```
    pub fn read_write<'env, R, F>(&mut self, mut f: F) -> Result<R, TxError>
    where
        F: FnMut(&mut Transaction<'env>) -> Result<R, TxError>,
    {
        self.ensure_idle()?;

        let ctx = self.ctx;
        let record = self.record();
        let mut breaker = BusyBreaker::new(ctx.config().max_backoff_shift);
        let mut tx = Transaction::new(ctx.id());

        loop {
            ctx.registry.access_lock(record);
            let active = scopeguard::guard((), |_| ctx.registry.access_unlock(record));

            tx.begin(ctx.version());
            trace!(
                "TRANSACTION({:?}): START. GLOBAL VERSION ({:04})",
                std::thread::current().id(),
                tx.version()
            );

            let result = f(&mut tx).and_then(|value| tx.commit(ctx.clock()).map(|_| value));
            drop(active);

            match result {
                Ok(value) => {
                    self.local().stats.commits += 1;

                    if tx.has_retired() {
                        ctx.registry.synchronize(record);
                        for callback in tx.take_retired() {
                            callback.call();
                        }
                        self.run_deferred();
                    }

                    return Ok(value);
                }
                Err(error) => {
                    tx.abort();
                    self.on_failure(error, &mut breaker)?;
                }
            }
        }
    }

    /// Runs `f` as a read-only atomic block against a single snapshot. The block is retried
    /// until all of its loads observed a consistent state.
    pub fn read_only<'env, R, F>(&mut self, mut f: F) -> Result<R, TxError>
    where
        F: FnMut(&mut ReadTransaction<'_, 'env>) -> Result<R, TxError>,
    {
        self.ensure_idle()?;

        let ctx = self.ctx;
        let record = self.record();
        let mut breaker = BusyBreaker::new(ctx.config().max_backoff_shift);

        loop {
            ctx.registry.access_lock(record);
            let active = scopeguard::guard((), |_| ctx.registry.access_unlock(record));

            let mut tx = ReadTransaction::snapshot(ctx.id(), ctx.version());
            let result = f(&mut tx);
            drop(active);

            match result {
                Ok(value) => {
                    self.local().stats.commits += 1;
                    return Ok(value);
                }
                Err(error) => self.on_failure(error, &mut breaker)?,
            }
        }
    }
}

impl Drop for ThreadHandle<'_> {
    fn drop(&mut self) {
        let local = self.local();
        local.handles -= 1;
        if local.handles > 0 {
            return;
        }

        // the last handle can not be dropped from inside a block of another one
        if !self.local().deferred.is_empty() {
            self.ctx.registry.synchronize(self.record());
            self.run_deferred();
        }

        // SAFETY: the record is inactive and never used again
        unsafe { self.ctx.registry.remove(self.record.as_ptr()) };
    }
}

impl std::fmt::Debug for ThreadHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("thread", &std::thread::current().id())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{retry, Context, TxError, TxStats};
    use std::cell::Cell;

    #[test]
    fn test_stats_count_commits_and_retries() {
        let ctx = Context::new();
        let mut handle = ctx.register();
        let var = ctx.create(0usize);

        let mut attempts = 0;
        handle
            .read_write(|tx| {
                attempts += 1;
                if attempts < 3 {
                    return retry();
                }
                tx.store(&var, attempts)
            })
            .expect("transaction failed");

        assert_eq!(var.get(), 3);
        assert_eq!(handle.stats(), TxStats { commits: 1, retries: 2 });
    }

    #[test]
    fn test_deferred_callbacks_run_on_synchronize() {
        thread_local! {
            static RUNS: Cell<usize> = Cell::new(0);
        }

        let ctx = Context::new();
        let mut handle = ctx.register();

        handle.defer(|| RUNS.with(|runs| runs.set(runs.get() + 1)));
        handle.defer(|| RUNS.with(|runs| runs.set(runs.get() + 1)));
        assert_eq!(RUNS.with(|runs| runs.get()), 0);

        handle.synchronize().expect("synchronize failed");
        assert_eq!(RUNS.with(|runs| runs.get()), 2);

        handle.defer(|| RUNS.with(|runs| runs.set(runs.get() + 10)));
        drop(handle);
        assert_eq!(RUNS.with(|runs| runs.get()), 12);
    }

    #[test]
    fn test_panic_leaves_record_inactive() {
        let ctx = Context::new();
        let mut handle = ctx.register();
        let var = ctx.create(String::from("kept"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle.read_write(|tx| -> Result<(), TxError> {
                tx.store(&var, String::from("lost"))?;
                panic!("user code failed");
            })
        }));
        assert!(result.is_err());

        // a leaked active marker would block this forever
        handle.synchronize().expect("synchronize failed");

        let value = handle.read_only(|tx| tx.load(&var)).expect("read failed");
        assert_eq!(value, "kept");
    }

    #[test]
    fn test_handles_of_one_thread_share_a_record() {
        let ctx = Context::new();
        let mut first = ctx.register();
        let mut second = ctx.register();
        let var = ctx.create(String::from("x"));

        assert_eq!(ctx.thread_count(), 1);

        let inner = first.read_only(|tx| {
            let seen = tx.load(&var)?;
            let nested = second.read_write(|tx| tx.store(&var, String::from("y")));
            let sync = second.synchronize();
            Ok((seen, nested, sync))
        });
        assert_eq!(
            inner,
            Ok((String::from("x"), Err(TxError::NestedBlock), Err(TxError::NestedBlock)))
        );

        // outside of the first block the second handle works again
        second
            .read_write(|tx| tx.store(&var, String::from("y")))
            .expect("transaction failed");
        assert_eq!(first.read_only(|tx| tx.load(&var)), Ok(String::from("y")));

        first.defer(|| {});
        drop(first);
        assert_eq!(ctx.thread_count(), 1);
        assert_eq!(second.stats().commits, 3);

        drop(second);
        assert_eq!(ctx.thread_count(), 0);
    }
}
