//! A persistent worker pool for parallel-for dispatch.
//!
//! The crate provides one primitive: [`dispatch`], which takes an item
//! count and a work function and runs the function once per item (or once
//! per item *per executor*, see [`DispatchMode`]) across a pool of worker
//! threads plus the calling thread, returning only when every item is
//! complete. It is meant to be called many times in a row from a single
//! driver thread, so that application code can stay single-threaded and be
//! parallelized one loop at a time, much like launching a compute shader
//! on a CPU.
//!
//! Workers are persistent. Between dispatches they spin briefly on their
//! flags before parking, so a burst of small dispatches never pays a
//! context switch; wrapping a hot phase in [`wake_threads_up`] /
//! [`send_threads_to_sleep`] keeps them spinning for the whole phase,
//! trading CPU burn for dispatch latency.
//!
//! Pools come in two flavors: a process-global one managed with [`init`]
//! and [`deinit`], and owned [`DispatchPool`] values built with
//! [`DispatchPoolBuilder`]. Only the thread that created a pool may
//! dispatch on it, and only one dispatch runs at a time.
//!
//! ```
//! use dispatch_core::{DispatchMode, DispatchPoolBuilder};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let pool = DispatchPoolBuilder::new()
//!     .fraction_of_cores(0.0)
//!     .min_workers(2)
//!     .build()
//!     .unwrap();
//!
//! let squares: Vec<AtomicUsize> = (0..16).map(|_| AtomicUsize::new(0)).collect();
//! pool.dispatch(16, DispatchMode::Contiguous, |i| {
//!     squares[i].store(i * i, Ordering::Relaxed);
//! });
//!
//! assert_eq!(squares[7].load(Ordering::Relaxed), 49);
//! ```

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(unreachable_pub)]

mod cycles;
mod flag;
mod job;
mod log;
mod registry;
mod sleep;
mod unwind;


use crate::registry::Registry;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

/// Default target worker count, as a fraction of the reported core count.
const DEFAULT_FRACTION_OF_CORES: f64 = 0.8;

/// Default lower bound on the worker count.
const DEFAULT_MIN_WORKERS: usize = 4;

/// Default capacity reserved in each worker's scratch arena.
const DEFAULT_SCRATCH_CAPACITY: usize = 128 * 1024;

type StartHandler = dyn Fn(usize) + Send + Sync;
type ExitHandler = dyn Fn(usize) + Send + Sync;

/// How a dispatch distributes its item indices over the executors (the
/// workers plus the calling thread).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Each executor statically owns one contiguous index range; ranges
    /// differ in length by at most one item. Lowest overhead, but a slow
    /// item delays everything behind it in the same range.
    Contiguous,

    /// Executors claim indices one at a time from a shared counter.
    /// Slightly more traffic per item, but skewed workloads spread
    /// themselves out.
    LoadBalancing,

    /// Every executor runs the full `0..count` sequence. Useful for
    /// per-thread side effects, like resetting a thread-local arena on
    /// every executor.
    PerThread,
}

impl DispatchMode {
    pub(crate) fn label(self) -> &'static str {
        match self {
            DispatchMode::Contiguous => "contiguous",
            DispatchMode::LoadBalancing => "load-balancing",
            DispatchMode::PerThread => "per-thread",
        }
    }
}

/// Builds a [`DispatchPool`], or installs it as the global pool.
///
/// The default configuration targets 80% of the reported cores, with a
/// floor of four workers.
pub struct DispatchPoolBuilder {
    fraction_of_cores: f64,
    min_workers: usize,
    scratch_capacity: usize,
    context: Option<Arc<dyn Any + Send + Sync>>,
    thread_name: Option<Box<dyn FnMut(usize) -> String>>,
    stack_size: Option<usize>,
    start_handler: Option<Box<StartHandler>>,
    exit_handler: Option<Box<ExitHandler>>,
}

impl DispatchPoolBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> DispatchPoolBuilder {
        DispatchPoolBuilder {
            fraction_of_cores: DEFAULT_FRACTION_OF_CORES,
            min_workers: DEFAULT_MIN_WORKERS,
            scratch_capacity: DEFAULT_SCRATCH_CAPACITY,
            context: None,
            thread_name: None,
            stack_size: None,
            start_handler: None,
            exit_handler: None,
        }
    }

    /// Sets the target worker count as a fraction of the core count
    /// reported by the OS. Values above `1.0` oversubscribe the machine.
    ///
    /// The final worker count is
    /// `max(min_workers, round(cores * fraction))`.
    pub fn fraction_of_cores(mut self, fraction: f64) -> DispatchPoolBuilder {
        assert!(
            fraction.is_finite() && fraction >= 0.0,
            "fraction_of_cores must be a non-negative number"
        );
        self.fraction_of_cores = fraction;
        self
    }

    /// Sets the lower bound on the worker count. A pool with zero workers
    /// is legal: every dispatch then runs entirely on the calling thread.
    pub fn min_workers(mut self, min_workers: usize) -> DispatchPoolBuilder {
        self.min_workers = min_workers;
        self
    }

    /// Sets how many bytes of scratch arena each worker reserves at
    /// startup. Work functions reach the arena through [`with_scratch`].
    pub fn scratch_capacity(mut self, bytes: usize) -> DispatchPoolBuilder {
        self.scratch_capacity = bytes;
        self
    }

    /// Seeds each worker's ambient environment with a shared value,
    /// retrievable inside work functions and handlers via [`context`].
    pub fn starting_context<T>(mut self, value: T) -> DispatchPoolBuilder
    where
        T: Any + Send + Sync,
    {
        self.context = Some(Arc::new(value));
        self
    }

    /// Sets a closure producing a name for each worker thread, handy when
    /// reading profiler output.
    pub fn thread_name<F>(mut self, closure: F) -> DispatchPoolBuilder
    where
        F: FnMut(usize) -> String + 'static,
    {
        self.thread_name = Some(Box::new(closure));
        self
    }

    /// Sets the stack size of the worker threads.
    pub fn stack_size(mut self, stack_size: usize) -> DispatchPoolBuilder {
        self.stack_size = Some(stack_size);
        self
    }

    /// Sets a hook run once on each worker thread, right after it starts
    /// and before it accepts any work. The hook must not panic.
    pub fn start_handler<H>(mut self, handler: H) -> DispatchPoolBuilder
    where
        H: Fn(usize) + Send + Sync + 'static,
    {
        self.start_handler = Some(Box::new(handler));
        self
    }

    /// Sets a hook run once on each worker thread as it exits. The hook
    /// must not panic.
    pub fn exit_handler<H>(mut self, handler: H) -> DispatchPoolBuilder
    where
        H: Fn(usize) + Send + Sync + 'static,
    {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    /// Creates a pool owned by the calling thread.
    pub fn build(self) -> Result<DispatchPool, DispatchPoolBuildError> {
        let registry = Registry::new(self)?;
        Ok(DispatchPool { registry })
    }

    /// Installs the pool as the process-global one used by the free
    /// functions in this crate. Fails if a global pool already exists.
    pub fn build_global(self) -> Result<(), DispatchPoolBuildError> {
        let mut global = THE_POOL.lock().unwrap();
        if global.is_some() {
            return Err(DispatchPoolBuildError::new(
                ErrorKind::GlobalPoolAlreadyInitialized,
            ));
        }
        let registry = Registry::new(self)?;
        *global = Some(DispatchPool { registry });
        Ok(())
    }

    fn worker_count(&self) -> usize {
        let cores = num_cpus::get();
        let target = (cores as f64 * self.fraction_of_cores).round() as usize;
        Ord::max(self.min_workers, target)
    }

    fn get_thread_name(&mut self, index: usize) -> Option<String> {
        let f = self.thread_name.as_mut()?;
        Some(f(index))
    }

    fn get_stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    fn get_scratch_capacity(&self) -> usize {
        self.scratch_capacity
    }

    fn take_context(&mut self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.context.take()
    }

    fn take_start_handler(&mut self) -> Option<Box<StartHandler>> {
        self.start_handler.take()
    }

    fn take_exit_handler(&mut self) -> Option<Box<ExitHandler>> {
        self.exit_handler.take()
    }
}

impl Default for DispatchPoolBuilder {
    fn default() -> DispatchPoolBuilder {
        DispatchPoolBuilder::new()
    }
}

impl fmt::Debug for DispatchPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPoolBuilder")
            .field("fraction_of_cores", &self.fraction_of_cores)
            .field("min_workers", &self.min_workers)
            .field("scratch_capacity", &self.scratch_capacity)
            .field("has_context", &self.context.is_some())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// A pool of persistent worker threads, owned by the thread that built it.
///
/// Dropping the pool completes the worker lifecycle: all workers are
/// woken, told to stop, and joined. The pool must be idle at that point,
/// which it always is for a correct caller since [`DispatchPool::dispatch`]
/// blocks.
pub struct DispatchPool {
    registry: Arc<Registry>,
}

impl DispatchPool {
    /// Runs `work` across the pool; see the crate-level docs and the free
    /// function [`dispatch`] for the full contract.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread other than the one that built the
    /// pool, or from inside a running dispatch. A panic from `work` itself
    /// is re-thrown here once the dispatch has fully settled.
    pub fn dispatch<F>(&self, count: usize, mode: DispatchMode, work: F)
    where
        F: Fn(usize) + Sync,
    {
        self.registry.dispatch(count, mode, work);
    }

    /// Number of worker threads; the pool executes on this many threads
    /// plus the caller.
    pub fn num_workers(&self) -> usize {
        self.registry.num_workers()
    }

    /// Raises the wake hint: until the matching
    /// [`send_threads_to_sleep`](DispatchPool::send_threads_to_sleep),
    /// workers spin instead of parking, which takes OS wake-up latency out
    /// of every dispatch in between.
    pub fn wake_threads_up(&self) {
        self.registry.wake_threads_up();
    }

    /// Lowers the wake hint raised by
    /// [`wake_threads_up`](DispatchPool::wake_threads_up).
    ///
    /// # Panics
    ///
    /// Panics if the hint would drop below zero; calls must be balanced.
    pub fn send_threads_to_sleep(&self) {
        self.registry.send_threads_to_sleep();
    }

    /// Blocks until every worker thread has started and entered its wait
    /// loop. Mostly useful for benchmarking, so measurements do not
    /// include thread startup.
    pub fn wait_until_primed(&self) {
        self.registry.wait_until_primed();
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.registry.terminate();
    }
}

impl fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPool")
            .field("num_workers", &self.num_workers())
            .finish()
    }
}

/// Error returned when building a pool, or when managing the global pool,
/// fails.
#[derive(Debug)]
pub struct DispatchPoolBuildError {
    kind: ErrorKind,
}

#[derive(Debug)]
enum ErrorKind {
    GlobalPoolAlreadyInitialized,
    GlobalPoolNotInitialized,
    IOError(io::Error),
}

impl DispatchPoolBuildError {
    fn new(kind: ErrorKind) -> DispatchPoolBuildError {
        DispatchPoolBuildError { kind }
    }
}

impl Error for DispatchPoolBuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            ErrorKind::IOError(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchPoolBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::GlobalPoolAlreadyInitialized => {
                f.write_str("the global dispatch pool has already been initialized")
            }
            ErrorKind::GlobalPoolNotInitialized => {
                f.write_str("the global dispatch pool has not been initialized")
            }
            ErrorKind::IOError(err) => write!(f, "failed to spawn a worker thread: {}", err),
        }
    }
}

static THE_POOL: Mutex<Option<DispatchPool>> = Mutex::new(None);

/// Creates the global pool with the default configuration. Use
/// [`DispatchPoolBuilder::build_global`] to configure it instead.
///
/// Fails if the global pool already exists. After a successful [`deinit`],
/// `init` may be called again.
pub fn init() -> Result<(), DispatchPoolBuildError> {
    DispatchPoolBuilder::new().build_global()
}

/// Tears down the global pool: wakes every worker, tells it to stop, and
/// joins it. Fails if there is no global pool to tear down.
///
/// Must be called from the thread that initialized the pool, with no
/// dispatch in flight.
pub fn deinit() -> Result<(), DispatchPoolBuildError> {
    let pool = THE_POOL.lock().unwrap().take();
    match pool {
        Some(pool) => {
            drop(pool);
            Ok(())
        }
        None => Err(DispatchPoolBuildError::new(
            ErrorKind::GlobalPoolNotInitialized,
        )),
    }
}

fn global_registry() -> Arc<Registry> {
    THE_POOL
        .lock()
        .unwrap()
        .as_ref()
        .expect("the global dispatch pool is not initialized; call init() first")
        .registry
        .clone()
}

/// Runs `work` `count` times across the global pool and the calling
/// thread, blocking until every item has completed.
///
/// Inside `work`, [`dispatch_index`] names the item being executed and
/// [`thread_index`] names the executor running it. How indices map to
/// executors is chosen by `mode`; `count == 0` is a valid no-op.
///
/// # Panics
///
/// Panics if the global pool does not exist, if called from a thread other
/// than the one that initialized it, or from inside a running dispatch. A
/// panic from `work` itself is re-thrown here once the dispatch has fully
/// settled.
pub fn dispatch<F>(count: usize, mode: DispatchMode, work: F)
where
    F: Fn(usize) + Sync,
{
    global_registry().dispatch(count, mode, work);
}

/// Raises the global pool's wake hint; see
/// [`DispatchPool::wake_threads_up`].
pub fn wake_threads_up() {
    global_registry().wake_threads_up();
}

/// Lowers the global pool's wake hint; see
/// [`DispatchPool::send_threads_to_sleep`].
pub fn send_threads_to_sleep() {
    global_registry().send_threads_to_sleep();
}

/// Index of the item the current thread is executing, or `None` outside a
/// work function.
pub fn dispatch_index() -> Option<usize> {
    registry::current_dispatch_index()
}

/// Index of the executor the current thread is acting as: workers are
/// `0..num_workers`, and the owner thread is executor `num_workers` while
/// it runs its inline share. `None` on threads that are not currently an
/// executor.
pub fn thread_index() -> Option<usize> {
    registry::current_thread_index()
}

/// The value this thread's pool was built with via
/// [`DispatchPoolBuilder::starting_context`], if any. Workers bind it
/// before their start handler runs; threads outside the pool see `None`.
pub fn context<T>() -> Option<Arc<T>>
where
    T: Any + Send + Sync,
{
    registry::current_context().and_then(|context| context.downcast::<T>().ok())
}

/// Hands `f` the current thread's scratch arena. On workers the arena has
/// the capacity configured at build time; on any other thread it starts
/// empty and grows on demand. Contents persist between work items on the
/// same thread, so treat it as uninitialized on entry.
pub fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    registry::with_scratch(f)
}
