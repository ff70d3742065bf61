//! Worker-thread registry.
//!
//! The master thread claims index 0 during process init; every spawned
//! worker takes the next index from a relaxed fetch-add counter and
//! stores it in thread-local storage. The index is dense and stable, so
//! subsystems can key per-thread arrays (block caches, profiling slots)
//! off it.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use grit_lib::log::SystemTag;
use grit_lib::{fatal_cleanup_and_exit, log_fatal};

/// Index 0 is the master; workers start at 1.
static INDEX_COUNTER: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static SELF_INDEX: Cell<u32> = const { Cell::new(u32::MAX) };
}

/// Claim index 0 for the calling thread. Call once, before any worker
/// is spawned.
pub fn master_init() {
    SELF_INDEX.with(|index| index.set(0));
}

/// The calling thread's registry index. `u32::MAX` when the thread was
/// neither the master nor spawned through [`Worker::spawn`].
pub fn self_index() -> u32 {
    SELF_INDEX.with(|index| index.get())
}

/// Native thread id of the calling thread.
pub fn self_tid() -> u32 {
    (unsafe { libc::gettid() }) as u32
}

/// A joinable worker thread with a registry index.
pub struct Worker {
    handle: JoinHandle<()>,
    index: u32,
}

impl Worker {
    /// Spawn a worker with the given stack size. The worker's registry
    /// index is assigned before `start` runs and passed to it.
    pub fn spawn<F>(stack_size: usize, start: F) -> Worker
    where
        F: FnOnce(u32) + Send + 'static,
    {
        debug_assert!(stack_size > 0);

        let index = INDEX_COUNTER.fetch_add(1, Ordering::Relaxed);
        let builder = std::thread::Builder::new()
            .name(format!("worker-{index}"))
            .stack_size(stack_size);

        let handle = match builder.spawn(move || {
            SELF_INDEX.with(|tl| tl.set(index));
            start(index);
        }) {
            Ok(handle) => handle,
            Err(err) => {
                log_fatal!(SystemTag::Thread, "failed to spawn worker: {}", err);
                fatal_cleanup_and_exit();
            }
        };

        Worker { handle, index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Wait for the worker to finish. A panicked worker is fatal.
    pub fn join(self) {
        if self.handle.join().is_err() {
            log_fatal!(SystemTag::Thread, "worker {} panicked", self.index);
            fatal_cleanup_and_exit();
        }
    }
}

/// Pin the calling thread to a single logical core.
///
/// Callers decide whether failure matters: the timer's skew calibration
/// degrades gracefully, other users may escalate.
pub fn pin_to_core(core: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_indices_distinct() {
        let a = Worker::spawn(64 * 1024, |index| {
            assert_eq!(self_index(), index);
        });
        let b = Worker::spawn(64 * 1024, |index| {
            assert_eq!(self_index(), index);
        });
        assert_ne!(a.index(), b.index());
        assert!(a.index() >= 1);
        assert!(b.index() >= 1);
        a.join();
        b.join();
    }

    #[test]
    fn test_self_tid_nonzero() {
        assert!(self_tid() != 0);
    }
}
