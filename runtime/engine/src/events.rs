//! Atomic event words
//!
//! An `EventMask` is a 32-bit word of pending events. Raising is a single
//! `fetch_or`, so producers never contend with the consumer's dispatch pass.
//! Bits stay pending until a consumer takes them; bits outside a `take` mask
//! are untouched, which lets a state machine leave events it does not care
//! about in the current state for a later state to consume.

use core::sync::atomic::{AtomicU32, Ordering};

/// Pending-event word with lock-free raise/take/peek operations.
pub struct EventMask {
    bits: AtomicU32,
}

impl EventMask {
    /// Create an empty event mask
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Raise events, returning the word as it was before the raise.
    ///
    /// A zero return with a non-zero `bits` argument tells the caller it was
    /// first to make the word non-empty (useful for wakeup decisions).
    pub fn raise(&self, bits: u32) -> u32 {
        self.bits.fetch_or(bits, Ordering::AcqRel)
    }

    /// Atomically clear and return the pending bits selected by `mask`.
    pub fn take(&self, mask: u32) -> u32 {
        self.bits.fetch_and(!mask, Ordering::AcqRel) & mask
    }

    /// Peek at the pending bits selected by `mask` without clearing them
    pub fn pending(&self, mask: u32) -> u32 {
        self.bits.load(Ordering::Acquire) & mask
    }

    /// Check whether no events are pending at all
    pub fn is_empty(&self) -> bool {
        self.bits.load(Ordering::Acquire) == 0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EventMask({:#x})", self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EV_A: u32 = 1 << 0;
    const EV_B: u32 = 1 << 1;
    const EV_C: u32 = 1 << 2;

    #[test]
    fn raise_returns_prior_word() {
        let ev = EventMask::new();
        assert_eq!(ev.raise(EV_A), 0);
        assert_eq!(ev.raise(EV_B), EV_A);
        assert_eq!(ev.raise(EV_A), EV_A | EV_B);
    }

    #[test]
    fn take_clears_only_selected_bits() {
        let ev = EventMask::new();
        ev.raise(EV_A | EV_B | EV_C);

        assert_eq!(ev.take(EV_B), EV_B);
        assert_eq!(ev.pending(EV_A | EV_B | EV_C), EV_A | EV_C);

        // Taking again is empty; the other bits survive
        assert_eq!(ev.take(EV_B), 0);
        assert_eq!(ev.take(EV_A | EV_C), EV_A | EV_C);
        assert!(ev.is_empty());
    }

    #[test]
    fn pending_is_non_destructive() {
        let ev = EventMask::new();
        ev.raise(EV_A);
        assert_eq!(ev.pending(EV_A), EV_A);
        assert_eq!(ev.pending(EV_A), EV_A);
        assert_eq!(ev.pending(EV_B), 0);
    }
}
