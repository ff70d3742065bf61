//! Shared leaf utilities for the grit runtime substrate.
//!
//! Everything here is dependency-free so that every other workspace
//! member can use it: alignment helpers, the logging facade, and the
//! fatal-cleanup path. The real log subsystem lives in `grit-log` and
//! registers itself as this crate's backend at init.

pub mod alignment;
pub mod fatal;
pub mod log;

pub use alignment::{align_down_u64, align_up_u64, power_of_two_ceil, power_of_two_check};
pub use fatal::{fatal_cleanup_and_exit, register_flush_hook};
pub use log::{Severity, SystemTag, log_args, log_register_backend, log_set_min_severity};
