use dispatch_core::{DispatchMode, DispatchPoolBuilder};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use std::sync::atomic::{AtomicU32, Ordering};

// Load balancing over-reads the shared counter by design (one claim past
// the bound per executor); what must never happen is an index executing
// zero or two times.
#[test]
fn load_balancing_claims_each_index_exactly_once() {
    let pool = DispatchPoolBuilder::new()
        .fraction_of_cores(0.0)
        .min_workers(4)
        .build()
        .unwrap();

    let mut rng = XorShiftRng::seed_from_u64(0xd15b_a7c4);
    for _ in 0..4 {
        let n = rng.gen_range(1..=1_000_000);
        let counts: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(0)).collect();

        pool.dispatch(n, DispatchMode::LoadBalancing, |i| {
            counts[i].fetch_add(1, Ordering::Relaxed);
        });

        if let Some(bad) = counts
            .iter()
            .position(|c| c.load(Ordering::Relaxed) != 1)
        {
            panic!(
                "index {} executed {} times with n = {}",
                bad,
                counts[bad].load(Ordering::Relaxed),
                n
            );
        }
    }
}
