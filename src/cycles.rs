//! Raw cycle counter used to time the worker spin phase.
//!
//! Precision does not matter here, only that the counter is cheap to read
//! and monotonic enough to bound a busy-wait. On architectures without a
//! usable counter register we fall back to the monotonic clock.

/// Reads the current cycle count.
#[cfg(target_arch = "x86_64")]
#[inline]
pub(super) fn now() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads the virtual counter register; on aarch64 this ticks at a fixed
/// frequency well below the core clock, which only makes the spin phase
/// more patient.
#[cfg(target_arch = "aarch64")]
#[inline]
pub(super) fn now() -> u64 {
    let count: u64;
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) count, options(nomem, nostack));
    }
    count
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
pub(super) fn now() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_advances() {
        let start = now();
        let mut acc = 0u64;
        for i in 0..10_000u64 {
            acc = acc.wrapping_add(std::hint::black_box(i));
        }
        std::hint::black_box(acc);
        assert!(now() >= start);
    }
}
