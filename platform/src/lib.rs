//! Platform facade: the only place in the workspace that talks to the
//! operating system directly.
//!
//! Exposes page-granular virtual memory ([`vm`]), CPU probing ([`arch`]),
//! POSIX counting semaphores ([`sem`]), the worker-thread registry
//! ([`thread`]), and raw clocks ([`clock`]). Everything above this crate
//! consumes these contracts and nothing else from the OS.

pub mod arch;
pub mod clock;
pub mod sem;
pub mod thread;
pub mod vm;

pub use arch::{CACHE_LINE, CpuFeatures, cpu_features, logical_core_count, page_size};
pub use sem::Semaphore;
pub use vm::MemSlot;
