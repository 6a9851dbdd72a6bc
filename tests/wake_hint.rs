use dispatch_core::{DispatchMode, DispatchPoolBuilder};
use std::thread;
use std::time::{Duration, Instant};

fn median(mut samples: Vec<Duration>) -> Duration {
    samples.sort();
    samples[samples.len() / 2]
}

// Sanity check, not an absolute bound: a dispatch issued while the
// workers are held hot must complete faster than one that has to pull
// them out of a park.
#[test]
fn hot_dispatches_are_faster_than_cold_ones() {
    if num_cpus::get() < 4 {
        return;
    }

    let pool = DispatchPoolBuilder::new()
        .fraction_of_cores(0.0)
        .min_workers(4)
        .build()
        .unwrap();
    pool.wait_until_primed();

    // Cold: sleeping between dispatches lets every worker run through its
    // spin phase and park.
    let mut cold = Vec::new();
    for _ in 0..60 {
        thread::sleep(Duration::from_millis(2));
        let start = Instant::now();
        pool.dispatch(4, DispatchMode::Contiguous, |_| {});
        cold.push(start.elapsed());
    }

    // Hot: the raised hint keeps the workers spinning between dispatches.
    pool.wake_threads_up();
    for _ in 0..10 {
        pool.dispatch(4, DispatchMode::Contiguous, |_| {});
    }
    let mut hot = Vec::new();
    for _ in 0..60 {
        let start = Instant::now();
        pool.dispatch(4, DispatchMode::Contiguous, |_| {});
        hot.push(start.elapsed());
    }
    pool.send_threads_to_sleep();

    let cold = median(cold);
    let hot = median(hot);
    assert!(
        hot < cold,
        "hot median {:?} should be below cold median {:?}",
        hot,
        cold
    );
}
