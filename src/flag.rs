//! The per-worker work flag, plus the blocking latch used for startup and
//! shutdown handshakes.
//!
//! The flag is the only synchronization primitive between the dispatcher
//! and a single worker. Over the life of one dispatch it cycles
//!
//! ```text
//!     IDLE -> AVAILABLE -> DONE -> IDLE      (normal assignment)
//!     IDLE -> DONE -> IDLE                   (empty assignment, "skip")
//! ```
//!
//! Every transition is an atomic exchange that checks the value it
//! replaced, so a protocol violation shows up at the transition that
//! caused it rather than as a hang.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

/// No assignment pending; the slot's fields are owned by the dispatcher.
pub(super) const IDLE: u32 = 0;

/// An assignment has been published and the worker may start on it.
pub(super) const AVAILABLE: u32 = 1;

/// The assignment (possibly empty) is complete; side effects are visible
/// to whoever observes this value with acquire ordering.
pub(super) const DONE: u32 = 2;

pub(super) struct WorkFlag {
    state: AtomicU32,
}

impl WorkFlag {
    pub(super) fn new() -> WorkFlag {
        WorkFlag {
            state: AtomicU32::new(IDLE),
        }
    }

    /// Reads the current value without synchronizing. Spin loops use this
    /// together with an acquire fence once they see the value they want.
    #[inline]
    pub(super) fn probe(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    /// Reads the current value, synchronizing with the exchange that wrote
    /// it.
    #[inline]
    pub(super) fn probe_acquire(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Dispatcher: publish a pending assignment. The release half of the
    /// exchange is what makes the slot's range and job visible to the
    /// worker's acquire.
    #[inline]
    pub(super) fn make_available(&self) {
        let prev = self.state.swap(AVAILABLE, Ordering::AcqRel);
        debug_assert_eq!(prev, IDLE, "published work over a non-idle flag ({})", prev);
    }

    /// Dispatcher: mark a worker done without involving it at all. Used
    /// when the partition left this worker with no items.
    #[inline]
    pub(super) fn skip(&self) {
        let prev = self.state.swap(DONE, Ordering::AcqRel);
        debug_assert_eq!(prev, IDLE, "skipped a non-idle flag ({})", prev);
    }

    /// Worker: report the published assignment complete. The worker only
    /// reaches this after observing AVAILABLE, so that is the only legal
    /// prior value.
    #[inline]
    pub(super) fn complete(&self) {
        let prev = self.state.swap(DONE, Ordering::AcqRel);
        debug_assert_eq!(prev, AVAILABLE, "completed a flag that was not running ({})", prev);
    }

    /// Dispatcher: retire a finished worker for the next dispatch.
    #[inline]
    pub(super) fn reset(&self) {
        let prev = self.state.swap(IDLE, Ordering::AcqRel);
        debug_assert_eq!(prev, DONE, "reset a flag that was not done ({})", prev);
    }
}

/// A latch one thread blocks on until another sets it. Only used for the
/// startup (`primed`) and shutdown (`stopped`) handshakes, never on the
/// dispatch path.
pub(super) struct LockLatch {
    m: Mutex<bool>,
    v: Condvar,
}

impl LockLatch {
    pub(super) fn new() -> LockLatch {
        LockLatch {
            m: Mutex::new(false),
            v: Condvar::new(),
        }
    }

    pub(super) fn set(&self) {
        let mut guard = self.m.lock().unwrap();
        *guard = true;
        self.v.notify_all();
    }

    /// Blocks until `set` has been called.
    pub(super) fn wait(&self) {
        let mut guard = self.m.lock().unwrap();
        while !*guard {
            guard = self.v.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn normal_cycle() {
        let flag = WorkFlag::new();
        assert_eq!(flag.probe(), IDLE);
        flag.make_available();
        assert_eq!(flag.probe(), AVAILABLE);
        flag.complete();
        assert_eq!(flag.probe_acquire(), DONE);
        flag.reset();
        assert_eq!(flag.probe(), IDLE);
    }

    #[test]
    fn skip_cycle() {
        let flag = WorkFlag::new();
        flag.skip();
        assert_eq!(flag.probe_acquire(), DONE);
        flag.reset();
        assert_eq!(flag.probe(), IDLE);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "non-idle")]
    fn double_publish_is_caught() {
        let flag = WorkFlag::new();
        flag.make_available();
        flag.make_available();
    }

    #[test]
    fn lock_latch_wakes_waiter() {
        let latch = Arc::new(LockLatch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        latch.set();
        waiter.join().unwrap();
    }
}
