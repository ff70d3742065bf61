//! Precision timing: wall/TSC sync point, TSC frequency calibration,
//! and per-core skew estimation.
//!
//! [`time_api_init`] captures `(wall_ns, tsc)` under an instruction
//! fence, busy-waits a 100 ms wall window to estimate the TSC
//! frequency, then runs the ping-pong skew calibration. All conversions
//! are linear against the captured origin; two truth-source variants
//! take a caller anchor pair to bound rounding error over long runs.
//!
//! Without an invariant TSC (or when thread pinning is unavailable) the
//! timer serves monotonic nanoseconds only: the skew table stays zero
//! and TSC conversions return zero.

mod skew;

use spin::Once;

use grit_mem::arena::Arena;
use grit_platform::arch::{CpuFeatures, cpu_features, logical_core_count};
use grit_platform::clock::{self, NSEC_PER_MSEC, NSEC_PER_SEC, NSEC_PER_USEC};

struct Timer {
    ns_start: u64,
    tsc_start: u64,
    ns_resolution: u64,
    tsc_freq: u64,
    tsc_usable: bool,
    skew: skew::SkewTable,
}

static TIMER: Once<Timer> = Once::new();

/// Wall window used to estimate the TSC frequency.
const CALIBRATION_WINDOW_MS: u64 = 100;

/// Initialise the timer. The skew table and calibration scratch live on
/// `persistent`, which must outlive every timer query.
pub fn time_api_init(persistent: &mut Arena) {
    TIMER.call_once(|| {
        let ns_resolution = clock::monotonic_resolution_ns();

        // rdtscp orders against earlier instructions, giving a clean
        // (wall, tsc) pair for the origin.
        let (tsc_start, _) = clock::rdtscp();
        let ns_start = clock::monotonic_ns();

        let goal = ns_start + CALIBRATION_WINDOW_MS * NSEC_PER_MSEC;
        while clock::monotonic_ns() < goal {}
        let tsc_end = clock::rdtsc();

        let tsc_freq = (1000 / CALIBRATION_WINDOW_MS) * (tsc_end - tsc_start);
        let tsc_usable = tsc_freq > 0 && cpu_features().contains(CpuFeatures::INVARIANT_TSC);

        let core_count = logical_core_count();
        let skew = if tsc_usable {
            skew::estimate(persistent, core_count)
        } else {
            skew::SkewTable::zeroed(persistent, core_count)
        };

        Timer {
            ns_start,
            tsc_start,
            ns_resolution,
            tsc_freq,
            tsc_usable,
            skew,
        }
    });
}

#[inline]
fn timer() -> Option<&'static Timer> {
    TIMER.get()
}

/// Nanoseconds since [`time_api_init`]; 0 before init.
pub fn time_ns() -> u64 {
    match timer() {
        Some(t) => clock::monotonic_ns() - t.ns_start,
        None => 0,
    }
}

pub fn time_us() -> u64 {
    time_ns() / NSEC_PER_USEC
}

pub fn time_ms() -> u64 {
    time_ns() / NSEC_PER_MSEC
}

pub fn time_s() -> u64 {
    time_ns() / NSEC_PER_SEC
}

/// The monotonic reading captured at init.
pub fn time_ns_at_start() -> u64 {
    timer().map_or(0, |t| t.ns_start)
}

/// Nanoseconds per tick of the monotonic clock.
pub fn ns_resolution() -> u64 {
    timer().map_or(0, |t| t.ns_resolution)
}

/// Estimated TSC ticks per second; 0 when the TSC is unusable.
pub fn tsc_frequency() -> u64 {
    match timer() {
        Some(t) if t.tsc_usable => t.tsc_freq,
        _ => 0,
    }
}

/// Seconds represented by a TSC delta.
pub fn seconds_from_tsc(ticks: u64) -> f64 {
    match timer() {
        Some(t) if t.tsc_usable => ticks as f64 / t.tsc_freq as f64,
        _ => 0.0,
    }
}

/// Nanoseconds represented by a TSC delta.
pub fn ns_from_tsc(ticks: u64) -> u64 {
    (NSEC_PER_SEC as f64 * seconds_from_tsc(ticks)) as u64
}

/// TSC ticks representing a nanosecond delta.
pub fn tsc_from_ns(ns: u64) -> u64 {
    match timer() {
        Some(t) if t.tsc_usable => (ns as f64 * t.tsc_freq as f64 / NSEC_PER_SEC as f64) as u64,
        _ => 0,
    }
}

/// Time since init in ns, derived from an absolute TSC reading.
pub fn time_ns_from_tsc(tsc: u64) -> u64 {
    match timer() {
        Some(t) if t.tsc_usable => {
            debug_assert!(tsc >= t.tsc_start);
            ns_from_tsc(tsc - t.tsc_start)
        }
        _ => 0,
    }
}

/// Absolute TSC corresponding to a time-since-init in ns.
pub fn time_tsc_from_ns(ns: u64) -> u64 {
    match timer() {
        Some(t) if t.tsc_usable => t.tsc_start + tsc_from_ns(ns),
        _ => 0,
    }
}

/// As [`ns_from_tsc`] against a caller anchor `(ns_truth, tsc_truth)`
/// instead of the init origin, bounding drift over long runs.
pub fn ns_from_tsc_truth_source(tsc: u64, ns_truth: u64, tsc_truth: u64) -> u64 {
    if tsc >= tsc_truth {
        ns_truth + ns_from_tsc(tsc - tsc_truth)
    } else {
        ns_truth - ns_from_tsc(tsc_truth - tsc)
    }
}

/// As [`tsc_from_ns`] against a caller anchor.
pub fn tsc_from_ns_truth_source(ns: u64, ns_truth: u64, tsc_truth: u64) -> u64 {
    if ns >= ns_truth {
        tsc_truth + tsc_from_ns(ns - ns_truth)
    } else {
        tsc_truth - tsc_from_ns(ns_truth - ns)
    }
}

/// Signed TSC skew of `core` relative to core 0. Zero for core 0, for
/// unknown cores, and whenever calibration was skipped.
pub fn tsc_skew(core: u32) -> i64 {
    timer().map_or(0, |t| t.skew.get(core))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_timer() {
        // The skew table must outlive the process-wide timer, so the
        // backing arena is deliberately leaked.
        let mut persistent = Arena::alloc(8 * 1024 * 1024);
        time_api_init(&mut persistent);
        core::mem::forget(persistent);
    }

    #[test]
    fn test_monotonic_window() {
        init_timer();
        let before = time_ns();
        std::thread::sleep(std::time::Duration::from_millis(100));
        let after = time_ns();
        let delta = after - before;
        assert!(delta >= 95_000_000, "slept too little: {delta}");
        assert!(delta <= 300_000_000, "slept far too long: {delta}");
    }

    #[test]
    fn test_unit_accessors_consistent() {
        init_timer();
        let ns = time_ns();
        let ms = time_ms();
        assert!(ms <= ns / NSEC_PER_MSEC + 1);
        assert!(ns_resolution() >= 1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_tsc_roundtrip() {
        init_timer();
        if tsc_frequency() == 0 {
            // Degraded mode: conversions are inert by contract.
            assert_eq!(tsc_from_ns(50_000_000), 0);
            return;
        }

        let ns = 50_000_000u64;
        let roundtrip = ns_from_tsc(tsc_from_ns(ns));
        let error = roundtrip.abs_diff(ns);
        assert!(error <= 1, "roundtrip error {error} ns");

        // Frequency should land in a plausible range for real hardware.
        let freq = tsc_frequency();
        assert!(freq > 100_000_000, "tsc freq {freq}");
        assert!(freq < 10_000_000_000, "tsc freq {freq}");
    }

    #[test]
    fn test_truth_source_anchoring() {
        init_timer();
        if tsc_frequency() == 0 {
            return;
        }
        let anchor_ns = 1_000_000_000u64;
        let anchor_tsc = tsc_from_ns(anchor_ns);
        // At the anchor itself the conversion is exact.
        assert_eq!(
            ns_from_tsc_truth_source(anchor_tsc, anchor_ns, anchor_tsc),
            anchor_ns
        );
        let later = anchor_tsc + tsc_from_ns(500);
        let ns = ns_from_tsc_truth_source(later, anchor_ns, anchor_tsc);
        assert!(ns.abs_diff(anchor_ns + 500) <= 1);
    }

    #[test]
    fn test_skew_core_zero() {
        init_timer();
        assert_eq!(tsc_skew(0), 0);
        // Out-of-range cores read as zero.
        assert_eq!(tsc_skew(100_000), 0);
    }
}
