//! Process-wide memory configuration.
//!
//! The two global block allocators (256 B and 1 MiB classes) and the
//! cached page size. Initialised exactly once on the master thread
//! before any worker spawns; read-only afterwards. The 256 B class is
//! the hot path and goes through a per-thread id cache; the 1 MiB
//! class always takes the shared list.

use spin::Once;

use grit_lib::log::SystemTag;
use grit_lib::{fatal_cleanup_and_exit, log_fatal};

use grit_platform::arch::page_size;

use crate::block::{BlockAllocator, LocalCache};

pub struct MemConfig {
    pub block_256b: BlockAllocator,
    pub block_1mb: BlockAllocator,
    pub page_size: u64,
}

static MEM_CONFIG: Once<MemConfig> = Once::new();

thread_local! {
    static LOCAL_256B: LocalCache = const { LocalCache::new() };
}

/// Initialise the global allocators with the given block counts.
/// Subsequent calls are no-ops.
pub fn mem_api_init(count_256b: u64, count_1mb: u64) {
    MEM_CONFIG.call_once(|| MemConfig {
        block_256b: BlockAllocator::alloc(count_256b, 256),
        block_1mb: BlockAllocator::alloc(count_1mb, 1024 * 1024),
        page_size: page_size(),
    });
}

/// The global config. Fatal when [`mem_api_init`] has not run.
pub fn mem_config() -> &'static MemConfig {
    match MEM_CONFIG.get() {
        Some(config) => config,
        None => {
            log_fatal!(SystemTag::Memory, "memory api used before mem_api_init");
            fatal_cleanup_and_exit();
        }
    }
}

/// A cache-aligned 256 B block, or null when the class is exhausted.
pub fn alloc_256b() -> *mut u8 {
    let config = mem_config();
    LOCAL_256B.with(|cache| config.block_256b.alloc_block_cached(cache))
}

/// Free a 256 B block into the calling thread's cache.
pub fn free_256b(addr: *mut u8) {
    let config = mem_config();
    LOCAL_256B.with(|cache| config.block_256b.free_block_cached(cache, addr));
}

/// A cache-aligned 1 MiB block, or null when the class is exhausted.
pub fn alloc_1mb() -> *mut u8 {
    mem_config().block_1mb.alloc_block()
}

/// Free a 1 MiB block.
pub fn free_1mb(addr: *mut u8) {
    mem_config().block_1mb.free_block(addr);
}
