// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    marker::PhantomData,
    mem::{align_of, needs_drop, size_of, MaybeUninit},
    ptr,
};

/// Number of machine words a [`GpCallback`] can carry.
pub const CALLBACK_WORDS: usize = 3;

type Slots = [MaybeUninit<usize>; CALLBACK_WORDS];

struct Fits<F>(PhantomData<F>);

impl<F> Fits<F> {
    const OK: () = assert!(
        size_of::<F>() <= size_of::<Slots>() && align_of::<F>() <= align_of::<Slots>() && !needs_drop::<F>(),
        "callback must fit into three words and must not need drop"
    );
}

/// A unit of deferred work, stored inline without allocation.
///
/// The closure is moved into [`CALLBACK_WORDS`] words of storage. Closures that are larger,
/// more aligned, or own values that need to be dropped are rejected when the program is
/// compiled. A callback that is never called is simply forgotten.
///
/// ```
/// use stronghold_txmem::GpCallback;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// static CALLS: AtomicUsize = AtomicUsize::new(0);
///
/// let amount = 3usize;
/// let callback = GpCallback::new(move || {
///     CALLS.fetch_add(amount, Ordering::SeqCst);
/// });
/// callback.call();
/// assert_eq!(CALLS.load(Ordering::SeqCst), 3);
/// ```
pub struct GpCallback {
    invoke: unsafe fn(*mut Slots),
    slots: Slots,

    // captured state may hold raw pointers to thread local data
    _not_send: PhantomData<*const ()>,
}

impl GpCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        #[allow(clippy::let_unit_value)]
        let () = Fits::<F>::OK;

        let mut slots: Slots = [MaybeUninit::uninit(); CALLBACK_WORDS];
        // SAFETY: size and alignment have been checked above
        unsafe { ptr::write(slots.as_mut_ptr() as *mut F, f) };

        Self {
            invoke: invoke::<F>,
            slots,
            _not_send: PhantomData,
        }
    }

    /// Runs the callback, consuming it
    pub fn call(mut self) {
        // SAFETY: the slots hold an F written by `new`, and self is consumed
        unsafe { (self.invoke)(&mut self.slots) }
    }
}

impl std::fmt::Debug for GpCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpCallback")
            .field("invoke", &(self.invoke as usize as *const ()))
            .finish()
    }
}

unsafe fn invoke<F: FnOnce()>(slots: *mut Slots) {
    let f = ptr::read(slots as *mut F);
    f()
}
