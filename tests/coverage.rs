use dispatch_core::{thread_index, DispatchMode, DispatchPool, DispatchPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};

const WORKERS: usize = 4;

fn pool() -> DispatchPool {
    DispatchPoolBuilder::new()
        .fraction_of_cores(0.0)
        .min_workers(WORKERS)
        .build()
        .unwrap()
}

/// Counts around the worker-count boundaries, where partitions degenerate.
fn interesting_counts() -> Vec<usize> {
    vec![
        0,
        1,
        2,
        WORKERS - 1,
        WORKERS,
        WORKERS + 1,
        10 * WORKERS,
        10 * WORKERS + 3,
    ]
}

fn every_index_exactly_once(mode: DispatchMode) {
    let pool = pool();
    for n in interesting_counts() {
        let visited: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
        pool.dispatch(n, mode, |i| {
            visited[i].fetch_add(1, Ordering::Relaxed);
        });
        for (i, v) in visited.iter().enumerate() {
            assert_eq!(
                v.load(Ordering::Relaxed),
                1,
                "index {} mis-visited for {:?} with n = {}",
                i,
                mode,
                n
            );
        }
    }
}

#[test]
fn contiguous_visits_every_index() {
    every_index_exactly_once(DispatchMode::Contiguous);
}

#[test]
fn load_balancing_visits_every_index() {
    every_index_exactly_once(DispatchMode::LoadBalancing);
}

#[test]
fn per_thread_runs_the_full_sequence_on_every_executor() {
    let pool = pool();
    for n in interesting_counts() {
        let per_executor: Vec<AtomicUsize> = (0..=WORKERS).map(|_| AtomicUsize::new(0)).collect();
        let visited: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();

        pool.dispatch(n, DispatchMode::PerThread, |i| {
            visited[i].fetch_add(1, Ordering::Relaxed);
            per_executor[thread_index().unwrap()].fetch_add(1, Ordering::Relaxed);
        });

        for (executor, counter) in per_executor.iter().enumerate() {
            assert_eq!(
                counter.load(Ordering::Relaxed),
                n,
                "executor {} ran the wrong number of items for n = {}",
                executor,
                n
            );
        }
        for v in &visited {
            assert_eq!(v.load(Ordering::Relaxed), WORKERS + 1);
        }
    }
}
