// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

/// Default number of doublings before the breaker holds at its cap.
pub const DEFAULT_MAX_SHIFT: usize = 7;

/// # BusyBreaker
/// [`BusyBreaker`] keeps the CPU busy for short, exponentially growing delays inside spin loops.
///
/// Every call to [`BusyBreaker::spin`] doubles the number of spin hints until the configured
/// maximum shift is reached. From then on the delay is held at the cap and the thread gives up
/// its time slice once per call, so that a preempted lock holder gets a chance to run.
///
/// # Example
/// ```
/// use stronghold_txmem::BusyBreaker;
///
/// let mut breaker = BusyBreaker::new(3);
/// for _ in 0..5 {
///     breaker.spin();
/// }
/// assert!(breaker.is_capped());
/// breaker.reset();
/// assert!(!breaker.is_capped());
/// ```
#[derive(Debug, Clone)]
pub struct BusyBreaker {
    max: usize,
    unit: usize,
}

impl Default for BusyBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SHIFT)
    }
}

impl BusyBreaker {
    /// Creates a new [`BusyBreaker`] growing up to `2^max_shift` spin hints per call.
    pub fn new(max_shift: usize) -> Self {
        // more than half a word of doublings would never return in practice
        let max = max_shift.min(usize::BITS as usize / 2);
        Self { max, unit: 0 }
    }

    /// Keeps the CPU busy but hints the CPU that this is a spin loop.
    pub fn spin(&mut self) {
        for _ in 0..(1usize << self.unit) {
            core::hint::spin_loop();
        }

        if self.unit < self.max {
            self.unit += 1;
        } else {
            std::thread::yield_now();
        }
    }

    /// Returns `true`, if the delay stopped growing.
    pub fn is_capped(&self) -> bool {
        self.unit >= self.max
    }

    /// Resets the breaker to the smallest delay
    pub fn reset(&mut self) {
        self.unit = 0;
    }
}
