//! Raw clocks: the monotonic wall clock and the hardware timestamp
//! counter.
//!
//! These are deliberately unanchored — `grit-time` owns the sync point
//! and all conversions. On targets without a TSC both counter reads
//! fall back to the monotonic clock, which makes every TSC-based
//! conversion collapse to the identity the timer expects in degraded
//! mode.

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_USEC: u64 = 1_000;

/// Raw `CLOCK_MONOTONIC_RAW` reading in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    NSEC_PER_SEC * ts.tv_sec as u64 + ts.tv_nsec as u64
}

/// Resolution of the monotonic clock in nanoseconds per tick.
pub fn monotonic_resolution_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_getres(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    debug_assert!(ts.tv_sec == 0);
    ts.tv_nsec as u64
}

/// Plain TSC read. Unserialised; pair with [`rdtscp`] when instruction
/// ordering matters.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Serialising TSC read. Waits for prior instructions to retire and
/// also reports the IA32_TSC_AUX value (core id on Linux).
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtscp() -> (u64, u32) {
    let mut aux = 0u32;
    let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
    (tsc, aux)
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    monotonic_ns()
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtscp() -> (u64, u32) {
    (monotonic_ns(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_ns();
        assert!(b > a);
        assert!(b - a >= NSEC_PER_MSEC);
    }

    #[test]
    fn test_resolution_sane() {
        let res = monotonic_resolution_ns();
        assert!(res >= 1);
        assert!(res < NSEC_PER_MSEC);
    }

    #[test]
    fn test_tsc_monotone_on_core() {
        let a = rdtsc();
        let b = rdtsc();
        let c = rdtsc();
        // Not guaranteed strictly increasing across migrations, but two
        // immediate reads should never go backwards by a wide margin.
        assert!(b >= a || a - b < 1_000_000);
        assert!(c >= b || b - c < 1_000_000);
    }
}
