use crate::cycles;
use crate::flag::{self, LockLatch, WorkFlag};
use crate::job::{ClaimJob, JobRef, PanicSink, StackRangeJob};
use crate::log::Event::*;
use crate::log::Logger;
use crate::sleep::{Sleep, SPIN_CYCLES};
use crate::unwind;
use crate::{DispatchMode, DispatchPoolBuildError, DispatchPoolBuilder, ErrorKind};
use crossbeam_utils::CachePadded;
use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::hint;
use std::io;
use std::mem;
use std::sync::atomic::{fence, AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Soft limit on the worker count, mostly to keep a typo'd builder from
/// spawning thousands of threads.
const MAX_WORKERS: usize = 256;

/// Hands one worker its identity before the OS thread starts running the
/// main loop.
struct ThreadBuilder {
    name: Option<String>,
    stack_size: Option<usize>,
    registry: Arc<Registry>,
    index: usize,
}

impl ThreadBuilder {
    fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        let ThreadBuilder {
            name,
            stack_size,
            registry,
            index,
        } = self;
        let mut b = thread::Builder::new();
        if let Some(name) = name {
            b = b.name(name);
        }
        if let Some(stack_size) = stack_size {
            b = b.stack_size(stack_size);
        }
        b.spawn(move || unsafe { main_loop(registry, index) })
    }
}

impl fmt::Debug for ThreadBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBuilder")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// One worker's handoff record. The dispatcher writes the range and the
/// job, then flips `flag` to AVAILABLE; that exchange is the
/// happens-before edge that publishes the fields to the worker, and the
/// worker's DONE exchange publishes the work's side effects back.
///
/// `CachePadded` keeps adjacent slots on separate cache lines so one
/// worker's flag traffic does not false-share with its neighbor's.
pub(super) struct WorkerSlot {
    flag: WorkFlag,
    should_stop: AtomicBool,
    first: UnsafeCell<usize>,
    last: UnsafeCell<usize>,
    job: UnsafeCell<JobRef>,
}

// The cells are written by the dispatcher only while the flag is IDLE and
// read by the worker only after it observes AVAILABLE; the flag exchanges
// carry the ordering.
unsafe impl Send for WorkerSlot {}
unsafe impl Sync for WorkerSlot {}

impl WorkerSlot {
    fn new() -> WorkerSlot {
        WorkerSlot {
            flag: WorkFlag::new(),
            should_stop: AtomicBool::new(false),
            first: UnsafeCell::new(0),
            last: UnsafeCell::new(0),
            job: UnsafeCell::new(JobRef::noop()),
        }
    }

    unsafe fn publish(&self, first: usize, last: usize, job: JobRef) {
        *self.first.get() = first;
        *self.last.get() = last;
        *self.job.get() = job;
        self.flag.make_available();
    }

    unsafe fn assignment(&self) -> (usize, usize, JobRef) {
        (*self.first.get(), *self.last.get(), *self.job.get())
    }
}

pub(super) struct Registry {
    logger: Logger,
    slots: Box<[CachePadded<WorkerSlot>]>,
    sleep: Sleep,

    /// Next index to claim during a load-balancing dispatch; zero outside
    /// one. Padded away from `lb_bound`: the counter is written by every
    /// executor while the bound is only read.
    lb_counter: CachePadded<AtomicI64>,

    /// Exclusive upper limit on claims; zero outside a dispatch.
    lb_bound: CachePadded<AtomicI64>,

    /// Ambient value each worker binds before anything else runs on it.
    context: Option<Arc<dyn Any + Send + Sync>>,

    /// Capacity reserved in each worker's scratch arena at startup.
    scratch_capacity: usize,

    start_handler: Option<Box<crate::StartHandler>>,
    exit_handler: Option<Box<crate::ExitHandler>>,

    /// The thread that built the pool; the only thread allowed to
    /// dispatch on it.
    owner: ThreadId,

    /// Join handles, taken at termination.
    handles: Mutex<Vec<thread::JoinHandle<()>>>,

    /// One latch per worker, set as the worker enters its wait loop.
    primed: Vec<LockLatch>,
}

impl Registry {
    pub(super) fn new(
        mut builder: DispatchPoolBuilder,
    ) -> Result<Arc<Registry>, DispatchPoolBuildError> {
        // Soft-limit how many workers we can actually support.
        let workers = Ord::min(builder.worker_count(), MAX_WORKERS);

        let registry = Arc::new(Registry {
            logger: Logger::new(),
            slots: (0..workers)
                .map(|_| CachePadded::new(WorkerSlot::new()))
                .collect(),
            sleep: Sleep::new(),
            lb_counter: CachePadded::new(AtomicI64::new(0)),
            lb_bound: CachePadded::new(AtomicI64::new(0)),
            context: builder.take_context(),
            scratch_capacity: builder.get_scratch_capacity(),
            start_handler: builder.take_start_handler(),
            exit_handler: builder.take_exit_handler(),
            owner: thread::current().id(),
            handles: Mutex::new(Vec::with_capacity(workers)),
            primed: (0..workers).map(|_| LockLatch::new()).collect(),
        });

        for index in 0..workers {
            let thread = ThreadBuilder {
                name: builder.get_thread_name(index),
                stack_size: builder.get_stack_size(),
                registry: Arc::clone(&registry),
                index,
            };
            match thread.spawn() {
                Ok(handle) => registry.handles.lock().unwrap().push(handle),
                Err(err) => {
                    // Stop whatever did spawn before reporting the failure.
                    registry.terminate();
                    return Err(DispatchPoolBuildError::new(ErrorKind::IOError(err)));
                }
            }
        }

        Ok(registry)
    }

    pub(super) fn num_workers(&self) -> usize {
        self.slots.len()
    }

    /// Blocks until every worker thread is up and inside its wait loop.
    /// Useful before latency-sensitive bursts so the first dispatch does
    /// not pay for thread startup.
    pub(super) fn wait_until_primed(&self) {
        for latch in &self.primed {
            latch.wait();
        }
    }

    /// Stops every worker and joins it. The pool must be idle; there is no
    /// way to cancel an in-flight dispatch.
    pub(super) fn terminate(&self) {
        // The raised hint gets any parked worker moving again; each one
        // then observes its flag and the stop bit.
        self.sleep.raise_hint();
        for slot in self.slots.iter() {
            slot.should_stop.store(true, Ordering::Release);
            slot.flag.make_available();
        }

        let handles = mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }

        self.sleep.lower_hint();
        self.logger.log(|| PoolTerminate {
            parks: self.sleep.total_parks(),
        });
        self.logger.log(|| Flush);
    }

    pub(super) fn wake_threads_up(&self) {
        self.sleep.raise_hint();
        self.logger.log(|| HintRaised {
            hint: self.sleep.hint(),
        });
    }

    pub(super) fn send_threads_to_sleep(&self) {
        self.sleep.lower_hint();
        self.logger.log(|| HintLowered {
            hint: self.sleep.hint(),
        });
    }

    #[cfg(test)]
    pub(super) fn wake_hint(&self) -> i32 {
        self.sleep.hint()
    }

    #[cfg(test)]
    pub(super) fn total_parks(&self) -> usize {
        self.sleep.total_parks()
    }

    /// Executes `work` across the pool and the calling thread, returning
    /// once every index has completed and every flag is IDLE again. If the
    /// work panicked on any executor, the first payload is re-thrown here
    /// after the dispatch has fully settled.
    pub(super) fn dispatch<F>(&self, count: usize, mode: DispatchMode, work: F)
    where
        F: Fn(usize) + Sync,
    {
        self.assert_dispatch_allowed();
        self.logger.log(|| DispatchBegin {
            count,
            mode: mode.label(),
        });

        let sink = PanicSink::new();
        {
            let _hot = WakeScope::new(self);
            if count == 0 {
                self.dispatch_empty();
            } else {
                match mode {
                    DispatchMode::Contiguous => self.dispatch_contiguous(count, &work, &sink),
                    DispatchMode::LoadBalancing => {
                        self.dispatch_load_balancing(count, &work, &sink)
                    }
                    DispatchMode::PerThread => self.dispatch_per_thread(count, &work, &sink),
                }
            }
        }

        self.logger.log(|| DispatchEnd { count });

        if let Some(payload) = sink.take() {
            unwind::resume_unwinding(payload);
        }
    }

    fn assert_dispatch_allowed(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "dispatch called from a thread that does not own the pool"
        );
        assert!(
            current_thread_index().is_none(),
            "dispatch called from inside a running dispatch"
        );
    }

    /// A zero-item dispatch still walks the whole protocol so the flag
    /// discipline stays uniform: every slot is skipped and retired.
    fn dispatch_empty(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            self.logger.log(|| FlagSkipped { worker: index });
            slot.flag.skip();
        }
        self.wait_for_all_done();
    }

    fn dispatch_contiguous<F>(&self, count: usize, work: &F, sink: &PanicSink)
    where
        F: Fn(usize) + Sync,
    {
        let executors = self.num_workers() + 1;
        let base = count / executors;
        let rem = count % executors;

        let job = StackRangeJob::new(work, sink);
        let job_ref = unsafe { job.as_job_ref() };

        // Workers take the leading shares in slot order; the caller runs
        // the trailing share inline. `rem < executors`, so the one-extra
        // items all land on workers and the caller always holds `base`.
        let mut next = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let share = base + (index < rem) as usize;
            if share == 0 {
                self.logger.log(|| FlagSkipped { worker: index });
                slot.flag.skip();
            } else {
                let first = next;
                let last = next + share - 1;
                next = last + 1;
                self.logger.log(|| FlagAvailable {
                    worker: index,
                    first,
                    last,
                });
                unsafe { slot.publish(first, last, job_ref) };
            }
        }

        if base > 0 {
            debug_assert_eq!(next + base, count);
            self.run_caller_share(job_ref, next, count - 1);
        }

        self.wait_for_all_done();
    }

    fn dispatch_per_thread<F>(&self, count: usize, work: &F, sink: &PanicSink)
    where
        F: Fn(usize) + Sync,
    {
        let job = StackRangeJob::new(work, sink);
        let job_ref = unsafe { job.as_job_ref() };

        for (index, slot) in self.slots.iter().enumerate() {
            self.logger.log(|| FlagAvailable {
                worker: index,
                first: 0,
                last: count - 1,
            });
            unsafe { slot.publish(0, count - 1, job_ref) };
        }
        self.run_caller_share(job_ref, 0, count - 1);
        self.wait_for_all_done();
    }

    fn dispatch_load_balancing<F>(&self, count: usize, work: &F, sink: &PanicSink)
    where
        F: Fn(usize) + Sync,
    {
        self.lb_counter.store(0, Ordering::SeqCst);
        self.lb_bound.store(count as i64, Ordering::SeqCst);

        let job = ClaimJob::new(work, &self.lb_counter, &self.lb_bound, sink);
        let job_ref = unsafe { job.as_job_ref() };

        // Every executor receives the same single-iteration claim loop;
        // the shared counter does the real distribution.
        for (index, slot) in self.slots.iter().enumerate() {
            self.logger.log(|| FlagAvailable {
                worker: index,
                first: 0,
                last: 0,
            });
            unsafe { slot.publish(0, 0, job_ref) };
        }
        self.run_caller_share(job_ref, 0, 0);
        self.wait_for_all_done();

        self.lb_counter.store(0, Ordering::SeqCst);
        self.lb_bound.store(0, Ordering::SeqCst);
    }

    /// The caller is executor `num_workers` for the duration of its own
    /// share.
    fn run_caller_share(&self, job_ref: JobRef, first: usize, last: usize) {
        let _binding = CallerIndexBinding::new(self.num_workers());
        unsafe { job_ref.execute(first, last) };
    }

    /// Spins until every slot reads DONE, retiring each back to IDLE. The
    /// dispatcher never parks here: the owner thread has nothing better to
    /// do, and the next dispatch is usually right behind this one.
    fn wait_for_all_done(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            loop {
                let observed = slot.flag.probe_acquire();
                if observed == flag::DONE {
                    break;
                }
                debug_assert_eq!(
                    observed,
                    flag::AVAILABLE,
                    "worker {} flag left the dispatch protocol",
                    index
                );
                hint::spin_loop();
            }
            slot.flag.reset();
            self.logger.log(|| FlagReset { worker: index });
        }
    }

    /// Worker-side wait for the next assignment: spin, then yield, then
    /// park behind the wake gate, looping until the flag reads AVAILABLE.
    fn wait_for_work(&self, index: usize) {
        let slot = &self.slots[index];
        loop {
            // Spin phase: absorbs back-to-back dispatches without a
            // context switch.
            let spin_started = cycles::now();
            loop {
                if slot.flag.probe() == flag::AVAILABLE {
                    fence(Ordering::Acquire);
                    return;
                }
                hint::spin_loop();
                if cycles::now().wrapping_sub(spin_started) >= SPIN_CYCLES {
                    break;
                }
            }

            // Give the OS a chance to schedule something useful before we
            // decide whether to commit to a park.
            thread::yield_now();

            if self.sleep.hint() == 0 {
                self.sleep.park(&self.logger, index);
            }
        }
    }
}

/// Scoped wake-hint raise; lowered on every exit path, including the
/// unwind that re-throws a user panic.
struct WakeScope<'a> {
    registry: &'a Registry,
}

impl<'a> WakeScope<'a> {
    fn new(registry: &'a Registry) -> WakeScope<'a> {
        registry.wake_threads_up();
        WakeScope { registry }
    }
}

impl<'a> Drop for WakeScope<'a> {
    fn drop(&mut self) {
        self.registry.send_threads_to_sleep();
    }
}

/// The function each worker thread runs: bind identity and ambient state,
/// then park-execute-signal until told to stop.
unsafe fn main_loop(registry: Arc<Registry>, index: usize) {
    bind_worker_index(index);
    if let Some(context) = registry.context.clone() {
        CONTEXT.with(|cell| *cell.borrow_mut() = Some(context));
    }
    SCRATCH.with(|scratch| scratch.borrow_mut().reserve_exact(registry.scratch_capacity));

    // Let the pool know we are ready to take work.
    registry.primed[index].set();

    // Worker threads should not panic outside of user work; if one does,
    // the handoff protocol is corrupted and the only safe exit is abort.
    let abort_guard = unwind::AbortIfPanic;

    if let Some(handler) = &registry.start_handler {
        handler(index);
    }

    registry.logger.log(|| ThreadStart { worker: index });

    let slot = &registry.slots[index];
    loop {
        registry.wait_for_work(index);
        if slot.should_stop.load(Ordering::Acquire) {
            break;
        }
        let (first, last, job) = slot.assignment();
        job.execute(first, last);
        // Logged before the exchange so per-worker log order matches the
        // flag order.
        registry.logger.log(|| FlagDone { worker: index });
        slot.flag.complete();
    }

    mem::forget(abort_guard);

    registry.logger.log(|| ThreadTerminate { worker: index });

    if let Some(handler) = &registry.exit_handler {
        let abort_guard = unwind::AbortIfPanic;
        handler(index);
        mem::forget(abort_guard);
    }
}

thread_local! {
    /// Executor index: workers bind theirs once at startup; the owner
    /// thread binds the pseudo-index `num_workers` around its inline
    /// share.
    static THREAD_INDEX: Cell<i64> = Cell::new(-1);

    /// Index of the item currently being executed; -1 outside user work.
    static DISPATCH_INDEX: Cell<i64> = Cell::new(-1);

    /// Ambient value seeded from the pool's starting context.
    static CONTEXT: RefCell<Option<Arc<dyn Any + Send + Sync>>> = RefCell::new(None);

    /// Per-thread scratch arena; workers reserve their capacity at
    /// startup, other threads start empty and grow on demand.
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

pub(super) fn current_thread_index() -> Option<usize> {
    let index = THREAD_INDEX.with(Cell::get);
    if index < 0 {
        None
    } else {
        Some(index as usize)
    }
}

pub(super) fn current_dispatch_index() -> Option<usize> {
    let index = DISPATCH_INDEX.with(Cell::get);
    if index < 0 {
        None
    } else {
        Some(index as usize)
    }
}

pub(super) fn current_context() -> Option<Arc<dyn Any + Send + Sync>> {
    CONTEXT.with(|cell| cell.borrow().clone())
}

pub(super) fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    SCRATCH.with(|scratch| f(&mut scratch.borrow_mut()))
}

fn bind_worker_index(index: usize) {
    THREAD_INDEX.with(|cell| {
        debug_assert_eq!(cell.get(), -1, "worker index bound twice");
        cell.set(index as i64);
    });
}

/// RAII binding of the dispatch index; restores the sentinel on drop so
/// the index never leaks outside user work, panics included.
pub(super) struct DispatchIndexBinding;

impl DispatchIndexBinding {
    pub(super) fn new() -> DispatchIndexBinding {
        DispatchIndexBinding
    }

    #[inline]
    pub(super) fn set(&self, index: usize) {
        DISPATCH_INDEX.with(|cell| cell.set(index as i64));
    }
}

impl Drop for DispatchIndexBinding {
    fn drop(&mut self) {
        DISPATCH_INDEX.with(|cell| cell.set(-1));
    }
}

/// RAII binding of the caller's pseudo thread index around its inline
/// share.
struct CallerIndexBinding;

impl CallerIndexBinding {
    fn new(index: usize) -> CallerIndexBinding {
        THREAD_INDEX.with(|cell| {
            debug_assert_eq!(cell.get(), -1, "caller already has an executor index");
            cell.set(index as i64);
        });
        CallerIndexBinding
    }
}

impl Drop for CallerIndexBinding {
    fn drop(&mut self) {
        THREAD_INDEX.with(|cell| cell.set(-1));
    }
}
