// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Transactional Memory
//!
//! A word based software transactional memory. Shared state is kept in [`Var`]s, which are
//! read and written inside atomic blocks. Conflicting attempts are detected at commit time
//! and run again, so callers never lock anything themselves.
//!
//! Every thread registers with a [`Context`] and runs atomic blocks through its
//! [`ThreadHandle`]:
//! - [`ThreadHandle::read_write`] runs a [`Transaction`], that may load and store variables
//! - [`ThreadHandle::read_only`] runs a [`ReadTransaction`] against a single snapshot
//!
//! Values replaced by a commit are released only after every thread that could still read
//! them left its atomic block (a grace period).
//!
//! ```
//! use stronghold_txmem::{retry, Context};
//!
//! let ctx = Context::new();
//! let mut handle = ctx.register();
//!
//! let stock = ctx.create(3usize);
//! let orders = ctx.create(Vec::<String>::new());
//!
//! handle
//!     .read_write(|tx| {
//!         let available = tx.load(&stock)?;
//!         if available == 0 {
//!             return retry();
//!         }
//!
//!         let mut list = tx.load(&orders)?;
//!         list.push("book".into());
//!
//!         tx.store(&stock, available - 1)?;
//!         tx.store(&orders, list)
//!     })
//!     .expect("transaction failed");
//!
//! let (left, ordered) = handle
//!     .read_only(|tx| Ok((tx.load(&stock)?, tx.load(&orders)?.len())))
//!     .expect("read failed");
//! assert_eq!((left, ordered), (2, 1));
//! ```

pub mod breaker;
pub mod callback;
pub mod context;
pub mod errors;
pub mod handle;
mod registry;
pub mod rw_mutex;
pub mod storage;
pub mod transaction;
pub mod var;
pub mod version;

pub use breaker::BusyBreaker;
pub use callback::GpCallback;
pub use context::{Config, Context, Strategy, UnhandledErrorHook};
pub use errors::{retry, StorageError, TxError};
pub use handle::ThreadHandle;
pub use registry::TxStats;
pub use rw_mutex::FastRwMutex;
pub use storage::{HeapBox, Inline, InlineWord, Storage, StorageKind, Transactable};
pub use transaction::{ReadTransaction, Transaction};
pub use var::Var;
pub use version::{VersionClock, VersionLock, CLOCK_STEP};

lazy_static::lazy_static! {
    static ref DEFAULT_CONTEXT: Context = Context::new();
}

/// Returns a process wide context with the default configuration.
pub fn default_context() -> &'static Context {
    &DEFAULT_CONTEXT
}
