//! Specialised allocators: the memory spine of the runtime.
//!
//! Leaves first: [`poison`] (sanitizer discipline), [`bitvec`],
//! [`arena`] (stack-discipline bump allocation), [`ring`]
//! (double-mapped byte ring), [`block`] (the lock-free fixed-size
//! block allocator), [`pool`] (intrusive slot pools), and [`config`]
//! (the process-wide 256 B / 1 MiB block allocators every subsystem
//! draws from).
//!
//! None of the per-instance allocators are internally synchronised;
//! only the block allocator and the global config are safe to share
//! between threads without external locking.

pub mod arena;
pub mod bitvec;
pub mod block;
pub mod config;
pub mod poison;
pub mod pool;
pub mod ring;

pub use arena::{Arena, MemArray};
pub use bitvec::BitVec;
pub use block::BlockAllocator;
pub use config::{alloc_1mb, alloc_256b, free_1mb, free_256b, mem_api_init, mem_config};
pub use pool::{ExternalPool, GenSlot, Pool, PoolSlot, Slot, POOL_ALLOCATED_BIT, POOL_NULL};
pub use ring::Ring;

/// Default alignment for arena pushes without an explicit alignment.
pub const DEFAULT_MEMORY_ALIGNMENT: u64 = 8;
