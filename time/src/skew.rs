//! Ping-pong estimation of per-core TSC skew.
//!
//! Two threads hand a release/acquire token back and forth: a
//! *reference* pinned to core 0 and an *iterator* that migrates through
//! cores `1..N-1`. Each side reads its TSC immediately after receiving
//! the token, so for every exchange
//!
//! `tsc_iter = tsc_ref + execution_time + extra + skew`.
//!
//! Over many exchanges `extra` bottoms out, so the signed minimum of
//! `tsc_iter - tsc_ref` estimates the skew. Entries are stored bit-cast
//! in a `u64` table; consumers sign-interpret.
//!
//! Pinning failure on either thread aborts the round trip and leaves
//! the remaining entries zero — the sanctioned degraded mode.

use core::sync::atomic::{AtomicU32, Ordering};

use grit_lib::log::SystemTag;
use grit_lib::log_warning;
use grit_mem::arena::Arena;
use grit_platform::clock;
use grit_platform::thread::pin_to_core;

const ITERATIONS: u32 = 100_000;

const UNLOCKED_BY_REFERENCE: u32 = 1;
const UNLOCKED_BY_ITERATOR: u32 = 2;

/// Per-logical-core skew entries, bit-cast signed. Entry 0 is always 0.
pub struct SkewTable {
    entries: *mut u64,
    len: u32,
}

// SAFETY: written only during calibration (before the table is
// published through the timer), read-only afterwards.
unsafe impl Send for SkewTable {}
unsafe impl Sync for SkewTable {}

impl SkewTable {
    /// Allocate an all-zero table on `persistent`.
    pub fn zeroed(persistent: &mut Arena, core_count: u32) -> Self {
        let entries = persistent.push_zeroed(core_count as u64 * 8) as *mut u64;
        Self {
            entries,
            len: if entries.is_null() { 0 } else { core_count },
        }
    }

    pub fn get(&self, core: u32) -> i64 {
        if core >= self.len {
            return 0;
        }
        unsafe { *self.entries.add(core as usize) as i64 }
    }
}

struct PingPong {
    lock: AtomicU32,
    round_active: AtomicU32,
    abort: AtomicU32,
    core_count: u32,
    tsc_reference: *mut u64,
    tsc_iterator: *mut u64,
}

// SAFETY: the sample buffers are strictly partitioned — each thread
// writes only its own buffer, and the reference reads the iterator's
// samples only after the round_active handshake.
unsafe impl Sync for PingPong {}

impl PingPong {
    #[inline]
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire) != 0
    }
}

fn reference_loop(data: &PingPong, table: &SkewTable) {
    if let Err(err) = pin_to_core(0) {
        log_warning!(
            SystemTag::Timer,
            "skew calibration skipped, cannot pin reference thread: {}",
            err
        );
        data.abort.store(1, Ordering::Release);
        return;
    }

    for core in 1..data.core_count {
        data.round_active.store(1, Ordering::Release);

        for i in 0..ITERATIONS {
            loop {
                if data.aborted() {
                    return;
                }
                if data.lock.load(Ordering::Acquire) == UNLOCKED_BY_ITERATOR {
                    break;
                }
                core::hint::spin_loop();
            }
            let (tsc, _) = clock::rdtscp();
            unsafe {
                *data.tsc_reference.add(i as usize) = tsc;
            }
            data.lock.store(UNLOCKED_BY_REFERENCE, Ordering::Release);
        }

        // Wait for the iterator's final sample before reducing.
        while data.round_active.load(Ordering::Acquire) != 0 {
            if data.aborted() {
                return;
            }
            core::hint::spin_loop();
        }

        let mut skew = i64::MAX;
        for i in 0..ITERATIONS {
            let diff = unsafe {
                (*data.tsc_iterator.add(i as usize))
                    .wrapping_sub(*data.tsc_reference.add(i as usize)) as i64
            };
            if diff < skew {
                skew = diff;
            }
        }
        unsafe {
            *table.entries.add(core as usize) = skew as u64;
        }
    }
}

fn iterator_loop(data: &PingPong) {
    for core in 1..data.core_count {
        if let Err(err) = pin_to_core(core as usize) {
            log_warning!(
                SystemTag::Timer,
                "skew calibration stopped at core {}: {}",
                core,
                err
            );
            data.abort.store(1, Ordering::Release);
            return;
        }

        while data.round_active.load(Ordering::Acquire) != 1 {
            if data.aborted() {
                return;
            }
            core::hint::spin_loop();
        }

        data.lock.store(UNLOCKED_BY_ITERATOR, Ordering::Release);

        for i in 0..ITERATIONS {
            loop {
                if data.aborted() {
                    return;
                }
                if data.lock.load(Ordering::Acquire) == UNLOCKED_BY_REFERENCE {
                    break;
                }
                core::hint::spin_loop();
            }
            let (tsc, _) = clock::rdtscp();
            unsafe {
                *data.tsc_iterator.add(i as usize) = tsc;
            }
            data.lock.store(UNLOCKED_BY_ITERATOR, Ordering::Release);
        }

        data.lock.store(0, Ordering::Release);
        data.round_active.store(0, Ordering::Release);
    }
}

/// Run the calibration. Sample buffers are pushed on `persistent` and
/// popped before returning; the table itself stays.
pub fn estimate(persistent: &mut Arena, core_count: u32) -> SkewTable {
    let table = SkewTable::zeroed(persistent, core_count);
    if table.len == 0 || core_count < 2 {
        return table;
    }

    persistent.push_record();
    let tsc_reference = persistent.push_array::<u64>(ITERATIONS as u64);
    let tsc_iterator = persistent.push_array::<u64>(ITERATIONS as u64);
    if tsc_reference.is_null() || tsc_iterator.is_null() {
        log_warning!(
            SystemTag::Timer,
            "skew calibration skipped, arena cannot hold sample buffers"
        );
        persistent.pop_record();
        return table;
    }

    let data = PingPong {
        lock: AtomicU32::new(0),
        round_active: AtomicU32::new(0),
        abort: AtomicU32::new(0),
        core_count,
        tsc_reference,
        tsc_iterator,
    };

    std::thread::scope(|scope| {
        scope.spawn(|| reference_loop(&data, &table));
        scope.spawn(|| iterator_loop(&data));
    });

    persistent.pop_record();
    table
}
