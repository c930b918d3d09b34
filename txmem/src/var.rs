// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    storage::{InlineWord, Storage, StorageKind, Transactable},
    Inline, StorageError, TxError, VersionLock,
};
use std::{
    alloc::{handle_alloc_error, GlobalAlloc, Layout, System},
    fmt::{self, Debug},
    marker::PhantomData,
    mem::ManuallyDrop,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Type erased head of every [`Var`]. Transactions only ever see this part.
#[repr(C)]
pub(crate) struct VarBase {
    pub(crate) lock: VersionLock,
    pub(crate) storage: AtomicUsize,
    pub(crate) kind: StorageKind,

    /// id of the context this var is bound to, zero while unbound
    context: AtomicUsize,

    /// drops and releases a word produced by the storage policy of the owning var
    pub(crate) destroy: unsafe fn(*const VarBase, usize),

    /// committers currently holding the version lock, and the most ever seen at once
    #[cfg(test)]
    pub(crate) holders: AtomicUsize,
    #[cfg(test)]
    pub(crate) max_holders: AtomicUsize,
}

impl VarBase {
    /// Destroys a word that belongs to this variable.
    ///
    /// # Safety
    /// The owning [`Var`] must still be alive and the word must not be published.
    #[inline]
    pub(crate) unsafe fn destroy(&self, word: usize) {
        (self.destroy)(self, word)
    }

    /// Binds this variable to `context` on first use. Fails if another context owns it.
    #[inline]
    pub(crate) fn bind(&self, context: usize) -> Result<(), TxError> {
        if self.context.load(Ordering::Relaxed) == context {
            return Ok(());
        }

        match self
            .context
            .compare_exchange(0, context, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => Ok(()),
            Err(owner) if owner == context => Ok(()),
            Err(_) => Err(TxError::ForeignVar),
        }
    }

    /// Records a committer taking the version lock. Only tracked in unit tests.
    #[inline]
    pub(crate) fn note_locked(&self) {
        #[cfg(test)]
        self.max_holders
            .fetch_max(self.holders.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn note_unlocked(&self) {
        #[cfg(test)]
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A shared transactional variable.
///
/// The value is held according to the [`Storage`] policy of `T`, either directly inside the
/// storage word or in a heap block obtained from the allocator `A`. A variable is only ever
/// accessed through the [`crate::Transaction`] and [`crate::ReadTransaction`] types, with the
/// exception of the non transactional inline accessors [`Var::get`] and [`Var::set_unsync`].
///
/// A variable is bound to the [`crate::Context`] that first uses it, or that created it with
/// [`crate::Context::create`]. Using it from a transaction of another context fails with
/// [`TxError::ForeignVar`].
#[repr(C)]
pub struct Var<T, A = System>
where
    T: Transactable,
    A: GlobalAlloc,
{
    base: VarBase,
    alloc: A,
    _marker: PhantomData<T>,
}

unsafe fn destroy_in<T, A>(base: *const VarBase, word: usize)
where
    T: Transactable,
    A: GlobalAlloc,
{
    // the base is the first field of a repr(C) Var<T, A>
    let var = &*(base as *const Var<T, A>);
    <T::Storage as Storage<T>>::destroy_deallocate(&var.alloc, word)
}

impl<T> Var<T, System>
where
    T: Transactable,
{
    /// Creates a new variable using the system allocator. Aborts the process like any other
    /// failed std allocation, if the value could not be stored.
    pub fn new(value: T) -> Self {
        Self::new_in(value, System)
    }
}

impl<T, A> Var<T, A>
where
    T: Transactable,
    A: GlobalAlloc,
{
    /// Creates a new variable that allocates from `alloc`.
    pub fn new_in(value: T, alloc: A) -> Self {
        match Self::try_new_in(value, alloc) {
            Ok(var) => var,
            Err(_) => handle_alloc_error(Layout::new::<T>()),
        }
    }

    /// Creates a new variable that allocates from `alloc`, returning an error if the value
    /// could not be stored.
    pub fn try_new_in(value: T, alloc: A) -> Result<Self, StorageError> {
        let word = <T::Storage as Storage<T>>::allocate_construct(&alloc, value)?;

        Ok(Self {
            base: VarBase {
                lock: VersionLock::new(0),
                storage: AtomicUsize::new(word),
                kind: <T::Storage as Storage<T>>::KIND,
                context: AtomicUsize::new(0),
                destroy: destroy_in::<T, A>,
                #[cfg(test)]
                holders: AtomicUsize::new(0),
                #[cfg(test)]
                max_holders: AtomicUsize::new(0),
            },
            alloc,
            _marker: PhantomData,
        })
    }

    /// Returns whether the value is kept inline or boxed
    pub fn storage_kind(&self) -> StorageKind {
        self.base.kind
    }

    /// Returns the version at which the current value has been published
    pub fn version(&self) -> usize {
        self.base.lock.version()
    }

    /// Returns the allocator boxed values are taken from
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Consumes the variable and returns the last published value.
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);
        let word = this.base.storage.load(Ordering::Acquire);

        // SAFETY: the var is never used again and the allocator is moved out exactly once
        unsafe {
            let alloc = ptr::read(&this.alloc);
            <T::Storage as Storage<T>>::take(&alloc, word)
        }
    }

    /// Binds an unused variable to `context`.
    pub(crate) fn bound_to(self, context: usize) -> Self {
        self.base.context.store(context, Ordering::Relaxed);
        self
    }

    pub(crate) fn base(&self) -> &VarBase {
        &self.base
    }
}

impl<T, A> Var<T, A>
where
    T: Transactable<Storage = InlineWord> + Inline,
    A: GlobalAlloc,
{
    /// Reads the current value outside of any transaction.
    pub fn get(&self) -> T {
        // SAFETY: inline words always hold a valid T
        unsafe { InlineWord::decode(self.base.storage.load(Ordering::Acquire)) }
    }

    /// Overwrites the value outside of any transaction, keeping the version.
    ///
    /// Concurrent transactions will not detect this write. Use it only for values the caller
    /// owns exclusively at this moment, like releasing a flag acquired by a transaction.
    pub fn set_unsync(&self, value: T) {
        self.base.storage.store(InlineWord::encode(value), Ordering::Release);
    }
}

impl<T, A> Drop for Var<T, A>
where
    T: Transactable,
    A: GlobalAlloc,
{
    fn drop(&mut self) {
        let word = *self.base.storage.get_mut();
        // SAFETY: the word is the published value, which is exclusively owned now
        unsafe { <T::Storage as Storage<T>>::destroy_deallocate(&self.alloc, word) }
    }
}

impl<T, A> Debug for Var<T, A>
where
    T: Transactable,
    A: GlobalAlloc,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.base.lock.load();
        f.debug_struct("Var")
            .field("kind", &self.base.kind)
            .field("version", &VersionLock::version_of(word))
            .field("locked", &VersionLock::is_locked(word))
            .finish()
    }
}
