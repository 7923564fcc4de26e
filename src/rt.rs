//! Small helpers shared by the real-time entry points.
//!
//! The tick and receive paths must never allocate in steady state, block on
//! a contended lock, or let a panic unwind into the driver that called them.
//! Faults and overflows land in saturating counters that the control thread
//! can poll.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};

/// Saturating diagnostic counter.
///
/// Sticks at `u32::MAX` instead of wrapping, so a fault burst in a
/// long-running session cannot masquerade as a small count.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU32);

impl Counter {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub(crate) fn bump(&self) {
        // fetch_add returns the previous value; undo the wrap at the ceiling.
        if self.0.fetch_add(1, Ordering::Relaxed) == u32::MAX {
            self.0.store(u32::MAX, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs `f` behind a panic shield.
///
/// A panic inside a tick or receive callback is recorded in `faults` and
/// swallowed; the state touched by the faulting call may be stale but the
/// process and the driver thread keep running.
#[inline]
pub(crate) fn shield<F: FnOnce()>(faults: &Counter, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        faults.bump();
    }
}
