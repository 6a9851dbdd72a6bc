//! The park/wake machinery: decides when a worker may go to sleep and how
//! the dispatcher gets every sleeper back with one call.

use crate::log::Event::*;
use crate::log::Logger;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// How many cycles a worker spins on its flag before yielding and
/// considering the park gate. Back-to-back dispatches that land inside
/// this window (~13us at 5GHz) never pay a context switch.
pub(super) const SPIN_CYCLES: u64 = 65_536;

/// The single park gate shared by every worker in a pool.
///
/// `hint` counts how many callers currently want dispatch latency kept
/// low; while it is nonzero, workers spin instead of parking. All parking
/// goes through one mutex/condvar pair keyed on this one counter, so a
/// single `raise_hint` reaches every parked worker at once. The counter
/// never affects whether a worker *observes* its flag, only whether it is
/// allowed to park between observations.
pub(super) struct Sleep {
    /// Nonzero while at least one wake scope is open. Never negative.
    hint: AtomicI32,

    /// Total number of times any worker has parked, for the logger's
    /// benefit and for latency diagnostics.
    parks: AtomicUsize,

    gate: Mutex<()>,
    unparker: Condvar,
}

impl Sleep {
    pub(super) fn new() -> Sleep {
        Sleep {
            hint: AtomicI32::new(0),
            parks: AtomicUsize::new(0),
            gate: Mutex::new(()),
            unparker: Condvar::new(),
        }
    }

    #[inline]
    pub(super) fn hint(&self) -> i32 {
        self.hint.load(Ordering::SeqCst)
    }

    pub(super) fn total_parks(&self) -> usize {
        self.parks.load(Ordering::Relaxed)
    }

    /// Raises the wake hint and wakes every parked worker so it re-examines
    /// its flag.
    pub(super) fn raise_hint(&self) {
        let prev = self.hint.fetch_add(1, Ordering::SeqCst);
        assert!(prev >= 0, "wake hint was negative ({})", prev);

        // Taking the gate orders this increment against any worker that is
        // deciding to park, so the notification cannot be lost.
        let _gate = self.gate.lock().unwrap();
        self.unparker.notify_all();
    }

    /// Lowers the wake hint. Calls must pair with `raise_hint`.
    pub(super) fn lower_hint(&self) {
        let prev = self.hint.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            // Put the counter back so pool teardown still works from the
            // panic handler of whoever made the unbalanced call.
            self.hint.fetch_add(1, Ordering::SeqCst);
            panic!("unbalanced send_threads_to_sleep: wake hint would drop below zero");
        }
    }

    /// Parks the calling worker until the hint changes. Returns without
    /// blocking if the hint is already nonzero. May also return spuriously;
    /// the caller's outer loop re-reads its flag either way, which is what
    /// makes a spurious return indistinguishable from a real wake.
    pub(super) fn park(&self, logger: &Logger, worker: usize) {
        let gate = self.gate.lock().unwrap();
        if self.hint.load(Ordering::SeqCst) != 0 {
            return;
        }
        logger.log(|| ThreadParked { worker });
        self.parks.fetch_add(1, Ordering::Relaxed);
        let _gate = self.unparker.wait(gate).unwrap();
        logger.log(|| ThreadUnparked { worker });
    }
}
