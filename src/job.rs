//! Type-erased work descriptions handed to worker slots.
//!
//! A dispatch lends each executor the same user closure by reference; the
//! `JobRef` erases the closure type so a worker slot has one fixed layout
//! regardless of what the user captured. The closure and its wrapper live
//! on the dispatching thread's stack, which is sound because `dispatch`
//! does not return until every executor has reported done.

use crate::registry::DispatchIndexBinding;
use crate::unwind;
use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// A work description that can execute an inclusive index range.
///
/// # Safety
///
/// The implementor must guarantee that `this` points at a live value of
/// the implementing type for the duration of every `execute` call.
pub(super) unsafe trait RangeJob {
    unsafe fn execute(this: *const (), first: usize, last: usize);
}

/// Effectively a `&dyn RangeJob` without a lifetime. The range is passed
/// at call time so a single `JobRef` can be shared by every slot.
#[derive(Copy, Clone)]
pub(super) struct JobRef {
    pointer: *const (),
    execute_fn: unsafe fn(*const (), usize, usize),
}

impl JobRef {
    /// Erases `data` into a `JobRef`. The caller keeps `data` alive until
    /// the last `execute` has returned.
    pub(super) unsafe fn new<T>(data: *const T) -> JobRef
    where
        T: RangeJob,
    {
        JobRef {
            pointer: data as *const (),
            execute_fn: <T as RangeJob>::execute,
        }
    }

    /// Placeholder stored in slots between dispatches. Never executed.
    pub(super) fn noop() -> JobRef {
        unsafe fn noop_execute(_: *const (), _: usize, _: usize) {}
        JobRef {
            pointer: std::ptr::null(),
            execute_fn: noop_execute,
        }
    }

    #[inline]
    pub(super) unsafe fn execute(self, first: usize, last: usize) {
        (self.execute_fn)(self.pointer, first, last)
    }
}

/// First-panic-wins parking spot for payloads unwinding out of user work.
/// Executors record here and still report done; the dispatcher re-throws
/// after the whole dispatch has completed.
pub(super) struct PanicSink {
    slot: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PanicSink {
    pub(super) fn new() -> PanicSink {
        PanicSink {
            slot: Mutex::new(None),
        }
    }

    pub(super) fn capture(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    pub(super) fn take(&self) -> Option<Box<dyn Any + Send>> {
        self.slot.lock().unwrap().take()
    }
}

/// Runs the user function once per index of a contiguous range, in
/// ascending order. Used by both the contiguous and the per-thread
/// strategies; they differ only in which range each executor receives.
pub(super) struct StackRangeJob<'a, F>
where
    F: Fn(usize) + Sync,
{
    work: &'a F,
    sink: &'a PanicSink,
}

impl<'a, F> StackRangeJob<'a, F>
where
    F: Fn(usize) + Sync,
{
    pub(super) fn new(work: &'a F, sink: &'a PanicSink) -> StackRangeJob<'a, F> {
        StackRangeJob { work, sink }
    }

    pub(super) unsafe fn as_job_ref(&self) -> JobRef {
        JobRef::new(self)
    }
}

unsafe impl<'a, F> RangeJob for StackRangeJob<'a, F>
where
    F: Fn(usize) + Sync,
{
    unsafe fn execute(this: *const (), first: usize, last: usize) {
        let this = &*(this as *const Self);
        let result = unwind::halt_unwinding(|| {
            let binding = DispatchIndexBinding::new();
            for index in first..=last {
                binding.set(index);
                (this.work)(index);
            }
        });
        if let Err(payload) = result {
            this.sink.capture(payload);
        }
    }
}

/// The load-balancing trampoline. Every executor receives this as a
/// single-iteration assignment; the shared counter does the actual
/// distribution. Each executor performs exactly one claim past the bound
/// before it stops.
pub(super) struct ClaimJob<'a, F>
where
    F: Fn(usize) + Sync,
{
    work: &'a F,
    counter: &'a AtomicI64,
    bound: &'a AtomicI64,
    sink: &'a PanicSink,
}

impl<'a, F> ClaimJob<'a, F>
where
    F: Fn(usize) + Sync,
{
    pub(super) fn new(
        work: &'a F,
        counter: &'a AtomicI64,
        bound: &'a AtomicI64,
        sink: &'a PanicSink,
    ) -> ClaimJob<'a, F> {
        ClaimJob {
            work,
            counter,
            bound,
            sink,
        }
    }

    pub(super) unsafe fn as_job_ref(&self) -> JobRef {
        JobRef::new(self)
    }
}

unsafe impl<'a, F> RangeJob for ClaimJob<'a, F>
where
    F: Fn(usize) + Sync,
{
    unsafe fn execute(this: *const (), _first: usize, _last: usize) {
        let this = &*(this as *const Self);
        let result = unwind::halt_unwinding(|| {
            let binding = DispatchIndexBinding::new();
            loop {
                let claimed = this.counter.fetch_add(1, Ordering::SeqCst);
                if claimed >= this.bound.load(Ordering::SeqCst) {
                    break;
                }
                let index = claimed as usize;
                binding.set(index);
                (this.work)(index);
            }
        });
        if let Err(payload) = result {
            this.sink.capture(payload);
        }
    }
}
