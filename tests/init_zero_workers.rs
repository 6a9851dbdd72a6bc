use dispatch_core::{thread_index, DispatchMode, DispatchPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};

// A pool without workers is the degenerate configuration where every
// dispatch runs entirely on the calling thread.
#[test]
fn zero_workers_run_everything_inline() {
    let pool = DispatchPoolBuilder::new()
        .fraction_of_cores(0.0)
        .min_workers(0)
        .build()
        .unwrap();
    assert_eq!(pool.num_workers(), 0);

    let modes = [
        DispatchMode::Contiguous,
        DispatchMode::LoadBalancing,
        DispatchMode::PerThread,
    ];
    for &mode in &modes {
        let hits = AtomicUsize::new(0);
        pool.dispatch(10, mode, |_| {
            // The caller is the one and only executor.
            assert_eq!(thread_index(), Some(0));
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 10, "mode {:?}", mode);
    }
}
