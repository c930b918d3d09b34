// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Errors raised while running an atomic block.
///
/// [`TxError::Retry`] is the only variant the retry loop recovers from on its own. Every other
/// variant escaping a user function is handed to the unhandled error hook of the
/// [`crate::Context`].
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    /// A conflicting commit was observed, or the user asked to run the block again.
    #[error("transaction must be retried")]
    Retry,

    /// The storage policy could not obtain memory for a value.
    #[error("allocation failed ({0})")]
    Alloc(#[from] StorageError),

    /// Any error raised by user code.
    #[error("inner error occured ({0})")]
    Inner(String),

    /// The variable is bound to another [`crate::Context`].
    #[error("variable belongs to another context")]
    ForeignVar,

    /// An atomic block is already running on this thread. Nested blocks are opened through the
    /// running transaction.
    #[error("atomic block already running on this thread")]
    NestedBlock,
}

impl TxError {
    /// Wraps any displayable error as [`TxError::Inner`].
    pub fn inner<E: std::fmt::Display>(error: E) -> Self {
        Self::Inner(error.to_string())
    }

    /// Returns `true` for the retry signal.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

#[derive(Debug, DeriveError, PartialEq, Eq, Clone, Copy)]
pub enum StorageError {
    #[error("out of memory: size {size}, align {align}")]
    OutOfMemory { size: usize, align: usize },
}

/// Aborts the current attempt of an atomic block and runs it again.
///
/// ```
/// use stronghold_txmem::{retry, Context, TxError};
///
/// let ctx = Context::new();
/// let mut handle = ctx.register();
/// let flag = ctx.create(true);
///
/// let value = handle.read_only(|tx| match tx.load(&flag)? {
///     true => Ok(1),
///     false => retry(),
/// });
/// assert_eq!(value, Ok(1));
/// ```
pub fn retry<T>() -> Result<T, TxError> {
    Err(TxError::Retry)
}
