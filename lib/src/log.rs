//! Logging facade.
//!
//! All log output funnels through a single **backend** function pointer.
//! Before the log subsystem is initialised the backend writes one line
//! per message to `stderr`. Once `grit-log` initialises it registers
//! itself as the backend, and all subsequent output goes through the
//! lock-free message ring — timestamping, thread tagging, and the file
//! drain happen there.
//!
//! # Backend contract
//!
//! The backend receives the pre-formatted arguments for a **single log
//! line** and is responsible for:
//!
//! 1. Recording the line atomically (no interleaving with other threads).
//! 2. Appending the trailing newline — callers never include one.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Severities and system tags
// ---------------------------------------------------------------------------

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Success = 0,
    Note = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Success => "success",
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

/// Subsystem that produced a message. Rendered inside the log line.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemTag {
    System = 0,
    Memory = 1,
    Physics = 2,
    Timer = 3,
    Thread = 4,
    Assert = 5,
    Utility = 6,
}

impl SystemTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemTag::System => "System",
            SystemTag::Memory => "Memory",
            SystemTag::Physics => "Physics",
            SystemTag::Timer => "Timer",
            SystemTag::Thread => "Thread",
            SystemTag::Assert => "Assert",
            SystemTag::Utility => "Utility",
        }
    }
}

static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Success as u8);

#[inline(always)]
fn is_enabled(severity: Severity) -> bool {
    severity as u8 >= MIN_SEVERITY.load(Ordering::Relaxed)
}

/// Drop messages below `severity`. Fatal messages are never droppable
/// by construction (nothing orders above them).
pub fn log_set_min_severity(severity: Severity) {
    MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Backend dispatch
// ---------------------------------------------------------------------------

/// Signature of a log backend.
pub type LogBackend = fn(SystemTag, Severity, fmt::Arguments<'_>);

/// Stored as a raw pointer; `null` means "use the stderr fallback".
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

fn early_backend(tag: SystemTag, severity: Severity, args: fmt::Arguments<'_>) {
    eprintln!("{} {} - {}", tag.as_str(), severity.as_str(), args);
}

/// Register a backend that replaces the stderr fallback.
///
/// Called once by the log subsystem during its initialisation.
pub fn log_register_backend(backend: LogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

/// Emit a formatted log line at the given tag and severity.
pub fn log_args(tag: SystemTag, severity: Severity, args: fmt::Arguments<'_>) {
    if !is_enabled(severity) {
        return;
    }
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        early_backend(tag, severity, args);
    } else {
        // SAFETY: `log_register_backend` only stores valid `LogBackend`
        // fn pointers, which are the same size as `*mut ()` on all
        // supported targets.
        let backend: LogBackend = unsafe { core::mem::transmute(ptr) };
        backend(tag, severity, args);
    }
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

#[macro_export]
macro_rules! log_msg {
    ($tag:expr, $severity:expr, $($arg:tt)*) => {{
        $crate::log::log_args($tag, $severity, ::core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_note {
    ($tag:expr, $($arg:tt)*) => {
        $crate::log::log_args($tag, $crate::log::Severity::Note, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($tag:expr, $($arg:tt)*) => {
        $crate::log::log_args($tag, $crate::log::Severity::Warning, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($tag:expr, $($arg:tt)*) => {
        $crate::log::log_args($tag, $crate::log::Severity::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_fatal {
    ($tag:expr, $($arg:tt)*) => {
        $crate::log::log_args($tag, $crate::log::Severity::Fatal, ::core::format_args!($($arg)*))
    };
}
