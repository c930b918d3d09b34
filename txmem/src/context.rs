// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    breaker::DEFAULT_MAX_SHIFT, registry::Registry, ThreadHandle, Transactable, TxError, Var, VersionClock,
};
use crossbeam_utils::CachePadded;
use log::*;
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Source of context ids. Zero marks an unbound variable.
static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// A Strategy to handle transaction failures. Two options are possible:
/// - Retry: This will run the atomic block again
/// - Abort: This will abort the atomic block and return the error to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// This will retry the transaction until it succeeds
    Retry,

    /// This will abort the transaction, if it fails
    Abort,
}

/// Decides what happens with an error, other than a retry, escaping an atomic block.
pub type UnhandledErrorHook = Arc<dyn Fn(&TxError) -> Strategy + Send + Sync>;

fn log_and_abort(error: &TxError) -> Strategy {
    error!("UNHANDLED ERROR IN ATOMIC BLOCK: {}", error);
    Strategy::Abort
}

/// Settings of a [`Context`]
#[derive(Clone)]
pub struct Config {
    /// Cap of the exponential backoff, as a power of two spin hints
    pub max_backoff_shift: usize,

    /// Called for errors escaping an atomic block. Errors are logged and returned to the
    /// caller if no hook is set.
    pub unhandled_error_hook: Option<UnhandledErrorHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_backoff_shift: DEFAULT_MAX_SHIFT,
            unhandled_error_hook: None,
        }
    }
}

impl Config {
    /// Sets the cap of every backoff used by the context
    pub fn with_max_backoff_shift(mut self, shift: usize) -> Self {
        self.max_backoff_shift = shift;
        self
    }

    /// Sets the hook deciding over errors escaping an atomic block
    pub fn with_unhandled_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TxError) -> Strategy + Send + Sync + 'static,
    {
        self.unhandled_error_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_backoff_shift", &self.max_backoff_shift)
            .field("unhandled_error_hook", &self.unhandled_error_hook.is_some())
            .finish()
    }
}

/// An isolated transactional memory engine.
///
/// The context owns the global version clock and the registry of participating threads.
/// Threads join by calling [`Context::register`] and run atomic blocks through the returned
/// [`ThreadHandle`]. Variables are bound to the first context using them.
///
/// # Example
/// ```
/// use stronghold_txmem::Context;
///
/// let ctx = Context::new();
/// let counter = ctx.create(0usize);
///
/// std::thread::scope(|scope| {
///     for _ in 0..4 {
///         scope.spawn(|| {
///             let mut handle = ctx.register();
///             for _ in 0..100 {
///                 handle
///                     .read_write(|tx| {
///                         let value = tx.load(&counter)?;
///                         tx.store(&counter, value + 1)
///                     })
///                     .expect("transaction failed");
///             }
///         });
///     }
/// });
///
/// assert_eq!(counter.get(), 400);
/// ```
pub struct Context {
    id: usize,
    clock: CachePadded<VersionClock>,
    pub(crate) registry: Registry,
    config: Config,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context with the default configuration
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a context with the given configuration
    pub fn with_config(config: Config) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            clock: CachePadded::new(VersionClock::default()),
            registry: Registry::new(config.max_backoff_shift),
            config,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Returns the configuration this context was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a new variable bound to this context.
    pub fn create<T: Transactable>(&self, value: T) -> Var<T> {
        Var::new(value).bound_to(self.id)
    }

    /// Registers the calling thread with this context. All handles of one thread share a single
    /// thread record.
    pub fn register(&self) -> ThreadHandle<'_> {
        ThreadHandle::new(self)
    }

    /// Returns the global version clock
    pub fn clock(&self) -> &VersionClock {
        &self.clock
    }

    /// Returns the current global version
    pub fn version(&self) -> usize {
        self.clock.version()
    }

    /// Returns the number of registered threads
    pub fn thread_count(&self) -> usize {
        self.registry.thread_count()
    }

    /// Hands an error escaping an atomic block to the configured hook.
    pub(crate) fn on_unhandled(&self, error: &TxError) -> Strategy {
        match &self.config.unhandled_error_hook {
            Some(hook) => hook(error),
            None => log_and_abort(error),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("version", &self.version())
            .field("config", &self.config)
            .finish()
    }
}
