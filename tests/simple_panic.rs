use dispatch_core::{DispatchMode, DispatchPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn panic_in_work_reaches_the_caller() {
    let pool = DispatchPoolBuilder::new()
        .fraction_of_cores(0.0)
        .min_workers(4)
        .build()
        .unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pool.dispatch(20, DispatchMode::Contiguous, |i| {
            if i == 13 {
                panic!("unlucky");
            }
        });
    }));
    let payload = result.unwrap_err();
    assert_eq!(*payload.downcast::<&'static str>().unwrap(), "unlucky");

    // The dispatch settled before re-throwing: every flag is idle again
    // and the pool keeps working.
    let hits = AtomicUsize::new(0);
    pool.dispatch(32, DispatchMode::LoadBalancing, |_| {
        hits.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(hits.load(Ordering::Relaxed), 32);
}

#[test]
fn panic_on_the_caller_share_still_settles() {
    let pool = DispatchPoolBuilder::new()
        .fraction_of_cores(0.0)
        .min_workers(2)
        .build()
        .unwrap();

    // 3 items over 3 executors: the caller owns index 2.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pool.dispatch(3, DispatchMode::Contiguous, |i| {
            if i == 2 {
                panic!("caller item");
            }
        });
    }));
    assert!(result.is_err());

    pool.dispatch(3, DispatchMode::Contiguous, |_| {});
}
