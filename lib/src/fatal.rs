//! Fatal-cleanup path.
//!
//! Unrecoverable failures (allocator exhaustion escalations, platform
//! primitive failures) end the process through [`fatal_cleanup_and_exit`].
//! A process-wide CAS flag guarantees exactly one thread drives the
//! cleanup: it captures a stacktrace, runs the registered flush hook
//! (the log subsystem's drain-to-disk), and exits with code 1. Threads
//! that lose the race park until the winner terminates the process.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::backtrace::Backtrace;

static FATAL_INITIATED: AtomicU32 = AtomicU32::new(0);

/// Runs after the stacktrace is captured, before `exit(1)`.
pub type FlushHook = fn();

static FLUSH_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register the hook that flushes buffered state before the process
/// exits. The log subsystem registers its drain here.
pub fn register_flush_hook(hook: FlushHook) {
    FLUSH_HOOK.store(hook as *mut (), Ordering::Release);
}

/// Capture a stacktrace, flush, and exit the process with code 1.
///
/// Safe to call from any thread at any time; only the first caller
/// performs the cleanup.
pub fn fatal_cleanup_and_exit() -> ! {
    if FATAL_INITIATED
        .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        let backtrace = Backtrace::force_capture();
        eprintln!("================== STACKTRACE ==================");
        eprintln!("{backtrace}");

        let hook = FLUSH_HOOK.load(Ordering::Acquire);
        if !hook.is_null() {
            // SAFETY: `register_flush_hook` only stores valid `FlushHook`
            // fn pointers.
            let flush: FlushHook = unsafe { core::mem::transmute(hook) };
            flush();
        }

        std::process::exit(1);
    }

    // Another thread owns the cleanup; wait for the exit.
    loop {
        std::thread::park();
    }
}
