// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Storage Policies
//!
//! Every transactable value lives behind a single machine word. Small plain values are kept
//! inside the word itself ([`InlineWord`]), everything else is moved into a heap block and the
//! word holds the owning pointer ([`HeapBox`]). The policy is fixed per type through
//! [`Transactable::Storage`], so a variable never changes its representation.
//!
//! Use [`inline_transactable!`](crate::inline_transactable) and
//! [`boxed_transactable!`](crate::boxed_transactable) to make own types usable inside
//! transactions.

use crate::StorageError;
use std::{
    alloc::{GlobalAlloc, Layout},
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    hash::BuildHasher,
    marker::PhantomData,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
    sync::Arc,
};

/// The representation a storage policy uses for its word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Inline,
    Boxed,
}

/// Marker for values whose bytes can be copied into a machine word and back.
///
/// # Safety
/// Implementors must be [`Copy`], must not contain padding bytes, and must not be larger or
/// more aligned than a `usize`. Size and alignment are checked at compile time when the
/// type is used, the absence of padding cannot be checked and is the implementor's promise.
pub unsafe trait Inline: Copy + Send + Sync + 'static {}

/// A type that can be held by a [`crate::Var`].
pub trait Transactable: Clone + Send + Sync + 'static {
    type Storage: Storage<Self>;
}

/// Converts values of `T` from and into a storage word.
///
/// # Safety
/// `load`, `store`, `destroy_deallocate` and `take` must only be called with words returned by
/// `allocate_construct` of the same policy, and with the allocator that produced them. A word
/// must not be used after it has been passed to `destroy_deallocate` or `take`.
pub unsafe trait Storage<T>: 'static {
    const KIND: StorageKind;

    /// Moves `value` into a fresh storage word.
    fn allocate_construct<A: GlobalAlloc>(alloc: &A, value: T) -> Result<usize, StorageError>;

    /// Returns a copy of the value behind `word`.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn load(word: usize) -> T;

    /// Overwrites the value behind a word that is not visible to other threads.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn store(word: &mut usize, value: T);

    /// Drops the value behind `word` and releases its memory.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn destroy_deallocate<A: GlobalAlloc>(alloc: &A, word: usize);

    /// Moves the value out of `word` and releases its memory.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn take<A: GlobalAlloc>(alloc: &A, word: usize) -> T;
}

struct FitsWord<T>(PhantomData<T>);

impl<T> FitsWord<T> {
    const OK: () = assert!(
        size_of::<T>() <= size_of::<usize>() && align_of::<T>() <= align_of::<usize>(),
        "inline values must fit into a machine word"
    );
}

/// Keeps the bytes of the value inside the storage word. Never allocates.
#[derive(Debug)]
pub struct InlineWord;

impl InlineWord {
    /// Copies the bytes of `value` into a zeroed word.
    #[inline]
    pub fn encode<T: Inline>(value: T) -> usize {
        #[allow(clippy::let_unit_value)]
        let () = FitsWord::<T>::OK;

        let mut word = 0usize;
        // SAFETY: T fits into a usize and is no more aligned
        unsafe { ptr::write(&mut word as *mut usize as *mut T, value) };
        word
    }

    /// Reads a value back from a word produced by [`InlineWord::encode`].
    ///
    /// # Safety
    /// `word` must have been produced by `encode::<T>`.
    #[inline]
    pub unsafe fn decode<T: Inline>(word: usize) -> T {
        #[allow(clippy::let_unit_value)]
        let () = FitsWord::<T>::OK;

        ptr::read(&word as *const usize as *const T)
    }
}

unsafe impl<T: Inline> Storage<T> for InlineWord {
    const KIND: StorageKind = StorageKind::Inline;

    fn allocate_construct<A: GlobalAlloc>(_: &A, value: T) -> Result<usize, StorageError> {
        Ok(Self::encode(value))
    }

    unsafe fn load(word: usize) -> T {
        Self::decode(word)
    }

    unsafe fn store(word: &mut usize, value: T) {
        *word = Self::encode(value);
    }

    unsafe fn destroy_deallocate<A: GlobalAlloc>(_: &A, _: usize) {}

    unsafe fn take<A: GlobalAlloc>(_: &A, word: usize) -> T {
        Self::decode(word)
    }
}

/// Moves the value into a heap block obtained from the variable's allocator. The word holds
/// the owning pointer. Zero sized values never allocate.
#[derive(Debug)]
pub struct HeapBox;

impl HeapBox {
    #[inline]
    fn as_ptr<T>(word: usize) -> *mut T {
        word as *mut T
    }
}

unsafe impl<T> Storage<T> for HeapBox
where
    T: Clone + Send + Sync + 'static,
{
    const KIND: StorageKind = StorageKind::Boxed;

    fn allocate_construct<A: GlobalAlloc>(alloc: &A, value: T) -> Result<usize, StorageError> {
        let layout = Layout::new::<T>();

        let ptr = if layout.size() == 0 {
            NonNull::<T>::dangling().as_ptr()
        } else {
            // SAFETY: layout has a non zero size
            let raw = unsafe { alloc.alloc(layout) } as *mut T;
            if raw.is_null() {
                return Err(StorageError::OutOfMemory {
                    size: layout.size(),
                    align: layout.align(),
                });
            }
            raw
        };

        // SAFETY: ptr is valid for writes of T
        unsafe { ptr::write(ptr, value) };
        Ok(ptr as usize)
    }

    unsafe fn load(word: usize) -> T {
        (*Self::as_ptr::<T>(word)).clone()
    }

    unsafe fn store(word: &mut usize, value: T) {
        *Self::as_ptr::<T>(*word) = value;
    }

    unsafe fn destroy_deallocate<A: GlobalAlloc>(alloc: &A, word: usize) {
        let ptr = Self::as_ptr::<T>(word);
        ptr::drop_in_place(ptr);

        let layout = Layout::new::<T>();
        if layout.size() != 0 {
            alloc.dealloc(ptr as *mut u8, layout);
        }
    }

    unsafe fn take<A: GlobalAlloc>(alloc: &A, word: usize) -> T {
        let ptr = Self::as_ptr::<T>(word);
        let value = ptr::read(ptr);

        let layout = Layout::new::<T>();
        if layout.size() != 0 {
            alloc.dealloc(ptr as *mut u8, layout);
        }
        value
    }
}

/// Stores a type inline. The type must implement [`Inline`].
///
/// ```
/// use stronghold_txmem::{inline_transactable, Inline, StorageKind, Var};
///
/// #[derive(Clone, Copy)]
/// #[repr(transparent)]
/// struct Ticket(u32);
///
/// unsafe impl Inline for Ticket {}
/// inline_transactable!(Ticket);
///
/// let var = Var::new(Ticket(7));
/// assert_eq!(var.storage_kind(), StorageKind::Inline);
/// assert_eq!(var.get().0, 7);
/// ```
#[macro_export]
macro_rules! inline_transactable {
    ($($t:ty),+ $(,)?) => {
        $(
            const _: () = assert!(
                ::core::mem::size_of::<$t>() <= ::core::mem::size_of::<usize>()
                    && ::core::mem::align_of::<$t>() <= ::core::mem::align_of::<usize>(),
                "inline values must fit into a machine word"
            );

            impl $crate::Transactable for $t {
                type Storage = $crate::InlineWord;
            }
        )+
    };
}

/// Stores a type in a heap block.
///
/// ```
/// use stronghold_txmem::{boxed_transactable, StorageKind, Var};
///
/// #[derive(Clone)]
/// struct Account {
///     owner: String,
///     balance: u64,
/// }
///
/// boxed_transactable!(Account);
///
/// let var = Var::new(Account { owner: "alice".into(), balance: 10 });
/// assert_eq!(var.storage_kind(), StorageKind::Boxed);
/// assert_eq!(var.into_inner().balance, 10);
/// ```
#[macro_export]
macro_rules! boxed_transactable {
    ($($t:ty),+ $(,)?) => {
        $(
            impl $crate::Transactable for $t {
                type Storage = $crate::HeapBox;
            }
        )+
    };
}

macro_rules! impl_inline {
    ($($t:ty),+ $(,)?) => {
        $(
            unsafe impl Inline for $t {}
        )+
        inline_transactable!($($t),+);
    };
}

impl_inline!(bool, char, (), u8, i8, u16, i16, u32, i32, f32, usize, isize);

#[cfg(target_pointer_width = "64")]
impl_inline!(u64, i64, f64);

boxed_transactable!(String);

#[cfg(not(target_pointer_width = "64"))]
boxed_transactable!(u64, i64, f64);

boxed_transactable!(u128, i128);

impl<T: Clone + Send + Sync + 'static> Transactable for Vec<T> {
    type Storage = HeapBox;
}

impl<T: Clone + Send + Sync + 'static> Transactable for VecDeque<T> {
    type Storage = HeapBox;
}

impl<T: Clone + Send + Sync + 'static> Transactable for Box<T> {
    type Storage = HeapBox;
}

impl<T: ?Sized + Send + Sync + 'static> Transactable for Arc<T> {
    type Storage = HeapBox;
}

impl<T: Clone + Send + Sync + 'static> Transactable for Option<T> {
    type Storage = HeapBox;
}

impl<K, V, S> Transactable for HashMap<K, V, S>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    type Storage = HeapBox;
}

impl<T, S> Transactable for HashSet<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    type Storage = HeapBox;
}

impl<K, V> Transactable for BTreeMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Storage = HeapBox;
}

impl<T: Clone + Send + Sync + 'static> Transactable for BTreeSet<T> {
    type Storage = HeapBox;
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Transactable),+> Transactable for ($($name,)+) {
            type Storage = HeapBox;
        }
    };
}

impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
