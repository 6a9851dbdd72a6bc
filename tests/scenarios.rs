//! End-to-end scenarios exercising the dispatch modes the way an
//! application would.

use dispatch_core::{thread_index, DispatchMode, DispatchPool, DispatchPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

const WORKERS: usize = 4;

fn pool() -> DispatchPool {
    DispatchPoolBuilder::new()
        .fraction_of_cores(0.0)
        .min_workers(WORKERS)
        .build()
        .unwrap()
}

#[test]
fn squares() {
    let pool = pool();
    let results: Vec<AtomicUsize> = (0..20).map(|_| AtomicUsize::new(0)).collect();
    pool.dispatch(20, DispatchMode::Contiguous, |i| {
        results[i].store(i * i, Ordering::Relaxed);
    });

    let results: Vec<usize> = results.iter().map(|r| r.load(Ordering::Relaxed)).collect();
    let expected: Vec<usize> = (0..20).map(|i| i * i).collect();
    assert_eq!(results, expected);
}

#[test]
fn per_executor_side_effect_runs_once_on_each() {
    let pool = pool();
    let counters: Vec<AtomicUsize> = (0..=WORKERS).map(|_| AtomicUsize::new(0)).collect();
    pool.dispatch(1, DispatchMode::PerThread, |_| {
        counters[thread_index().unwrap()].fetch_add(1, Ordering::Relaxed);
    });

    for counter in &counters {
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
    let total: usize = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total, WORKERS + 1);
}

#[test]
fn zero_count_dispatch_is_a_no_op() {
    let pool = pool();
    let modes = [
        DispatchMode::Contiguous,
        DispatchMode::LoadBalancing,
        DispatchMode::PerThread,
    ];
    for &mode in &modes {
        let hits = AtomicUsize::new(0);
        pool.dispatch(0, mode, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 0, "mode {:?}", mode);
    }

    // The pool is fully usable afterwards.
    let hits = AtomicUsize::new(0);
    pool.dispatch(8, DispatchMode::Contiguous, |_| {
        hits.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(hits.load(Ordering::Relaxed), 8);
}

#[test]
fn burst_of_tiny_dispatches() {
    let pool = pool();
    pool.wait_until_primed();

    pool.wake_threads_up();
    let hits = AtomicUsize::new(0);
    for _ in 0..1000 {
        pool.dispatch(1, DispatchMode::Contiguous, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
    }
    pool.send_threads_to_sleep();

    assert_eq!(hits.load(Ordering::Relaxed), 1000);
}

#[test]
fn load_balancing_beats_contiguous_under_skew() {
    if num_cpus::get() < 6 {
        // The asserted ratio needs real parallel capacity.
        return;
    }

    let pool = pool();
    pool.wait_until_primed();

    // Items 0..10 are heavy, the rest are free. A contiguous split dumps
    // every heavy item into the first worker's range, so its share bounds
    // the whole dispatch; claiming from the shared counter spreads them.
    let work = |i: usize| {
        if i < 10 {
            let mut acc = 0u64;
            for k in 0..4_000_000u64 {
                acc = acc.wrapping_add(std::hint::black_box(k));
            }
            std::hint::black_box(acc);
        }
    };

    pool.wake_threads_up();
    pool.dispatch(100, DispatchMode::Contiguous, |_| {});

    let start = Instant::now();
    pool.dispatch(100, DispatchMode::Contiguous, work);
    let contiguous = start.elapsed();

    let start = Instant::now();
    pool.dispatch(100, DispatchMode::LoadBalancing, work);
    let balanced = start.elapsed();
    pool.send_threads_to_sleep();

    assert!(
        contiguous >= balanced * 3,
        "contiguous {:?} vs load-balancing {:?}",
        contiguous,
        balanced
    );
}
