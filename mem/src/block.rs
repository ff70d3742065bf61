//! Lock-free fixed-size block allocator.
//!
//! One allocator serves one size class. The free list is threaded
//! through the block headers and published through a single 64-bit
//! head word packing `(generation << 32) | index`. Every successful
//! free bumps the generation carried by the freed block's id, so an
//! allocator that read a stale head can never win the CAS with a stale
//! block's next pointer — the standard counter-ABA defence on a
//! single-word CAS.
//!
//! Blocks are cache-line padded: each begins with a 64-byte header
//! (`id`, `next`) and the payload starts one cache line in. The head
//! word sits alone on its own line so contending threads do not
//! false-share it with the allocator's cold fields.
//!
//! `index == capacity` encodes the empty free list. A block that has
//! never been freed has generation 0, in which case its `next` field
//! is meaningless and the bump convention `next == index + 1` applies.

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicU64, Ordering};

use grit_lib::log::SystemTag;
use grit_lib::{align_up_u64, fatal_cleanup_and_exit, log_fatal};

use grit_platform::arch::CACHE_LINE;
use grit_platform::vm::{self, MemSlot};

/// Block header, alone on the block's first cache line.
///
/// `id` always holds `(generation, index)` of this block as of its most
/// recent allocation; `next` is only meaningful while the block sits on
/// a free list.
#[repr(C, align(64))]
struct BlockHeader {
    id: AtomicU64,
    next: AtomicU64,
}

/// The head word on its own cache line; 64-byte pads on both sides live
/// in the parent struct layout.
#[repr(C, align(64))]
struct HeadWord {
    value: AtomicU64,
    _pad: [u8; CACHE_LINE - 8],
}

enum TryAlloc {
    Success(*mut u8),
    Failure,
    OutOfMemory,
}

pub struct BlockAllocator {
    head: HeadWord,
    region: *mut u8,
    block_size: u64,
    capacity: u64,
    slot: MemSlot,
}

// SAFETY: all shared mutation goes through the atomic head word and the
// per-block headers under the ownership discipline described above.
unsafe impl Send for BlockAllocator {}
unsafe impl Sync for BlockAllocator {}

impl BlockAllocator {
    /// Reserve pages for `block_count` blocks of `block_size` payload
    /// bytes each and initialise an empty-generation allocator. Fatal
    /// on reservation failure.
    pub fn alloc(block_count: u64, block_size: u64) -> Self {
        debug_assert!(block_count > 0 && block_size > 0);

        // One cache line of header, payload rounded out to whole lines.
        let line = CACHE_LINE as u64;
        let actual_block_size = line + align_up_u64(block_size, line);

        let slot = vm::reserve(block_count * actual_block_size, true);
        if slot.is_null() {
            log_fatal!(SystemTag::Memory, "failed to reserve block allocator region");
            fatal_cleanup_and_exit();
        }

        let capacity = slot.size / actual_block_size;
        assert!(
            slot.address as u64 % line == 0,
            "block region should be cacheline aligned"
        );

        let allocator = Self {
            head: HeadWord {
                value: AtomicU64::new(0),
                _pad: [0; CACHE_LINE - 8],
            },
            region: slot.address,
            block_size: actual_block_size,
            capacity,
            slot,
        };
        // Sync point: (generation, index) = (0, 0).
        allocator.head.value.store(0, Ordering::Release);
        allocator
    }

    /// Return the region to the OS. All blocks become invalid.
    pub fn free_region(&mut self) {
        vm::release(&mut self.slot);
        self.region = core::ptr::null_mut();
        self.capacity = 0;
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Payload bytes per block (requested class size rounded into the
    /// actual stride minus the header line).
    #[inline]
    pub fn payload_size(&self) -> u64 {
        self.block_size - CACHE_LINE as u64
    }

    #[inline]
    fn header(&self, index: u64) -> *mut BlockHeader {
        debug_assert!(index < self.capacity);
        unsafe { self.region.add((index * self.block_size) as usize) as *mut BlockHeader }
    }

    #[inline]
    fn contains(&self, addr: *mut u8) -> bool {
        let base = self.region as u64;
        let a = addr as u64;
        a >= base + CACHE_LINE as u64
            && a < base + self.capacity * self.block_size
            && (a - base - CACHE_LINE as u64) % self.block_size == 0
    }

    /// One CAS attempt against the head snapshot in `head`; on failure
    /// the snapshot is refreshed with acquire ordering.
    fn try_alloc(&self, head: &mut u64) -> TryAlloc {
        let generation = *head >> 32;
        let index = *head & u32::MAX as u64;
        if index == self.capacity {
            return TryAlloc::OutOfMemory;
        }

        let header = self.header(index);

        // A never-freed block starts on generation 0; its next field is
        // garbage and the bump convention applies instead.
        let new_next = if generation == 0 {
            index + 1
        } else {
            unsafe { (*header).next.load(Ordering::Relaxed) }
        };

        match self.head.value.compare_exchange(
            *head,
            new_next,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // The block is ours; publishing the bumped id happens
                // through the next Free's release CAS.
                unsafe {
                    (*header).id.store(*head + (1 << 32), Ordering::Relaxed);
                }
                TryAlloc::Success(unsafe { (header as *mut u8).add(CACHE_LINE) })
            }
            Err(current) => {
                *head = current;
                TryAlloc::Failure
            }
        }
    }

    /// Pop a block. Returns null when the class is exhausted.
    pub fn alloc_block(&self) -> *mut u8 {
        let mut head = self.head.value.load(Ordering::Acquire);
        loop {
            match self.try_alloc(&mut head) {
                TryAlloc::Success(addr) => return addr,
                TryAlloc::OutOfMemory => return core::ptr::null_mut(),
                TryAlloc::Failure => {}
            }
        }
    }

    /// Push a block back. `addr` must be a payload pointer previously
    /// returned by this allocator; double frees are caller error.
    pub fn free_block(&self, addr: *mut u8) {
        assert!(self.contains(addr), "free of pointer outside block region");

        let header = unsafe { addr.sub(CACHE_LINE) as *mut BlockHeader };
        let id = unsafe { (*header).id.load(Ordering::Relaxed) };
        let mut head = self.head.value.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*header).next.store(head, Ordering::Relaxed);
            }
            // Release on success publishes our next store to the next
            // allocator of this block.
            match self
                .head
                .value
                .compare_exchange(head, id, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Pop using the thread-local cache, falling back to the shared
    /// list. Only the global 256 B class uses this path.
    pub fn alloc_block_cached(&self, cache: &LocalCache) -> *mut u8 {
        let count = cache.count.get();
        if count > 1 {
            let next = unsafe { (*cache.next.get())[(count - 1) as usize] };
            cache.count.set(count - 1);
            let index = next & u32::MAX as u64;
            let header = self.header(index);
            unsafe {
                (*header).id.store(next + (1 << 32), Ordering::Relaxed);
            }
            return unsafe { (header as *mut u8).add(CACHE_LINE) };
        }

        self.alloc_block()
    }

    /// Push into the thread-local cache; when full, splice the oldest
    /// run back to the shared list in a single CAS (the run is already
    /// linked through the block headers).
    pub fn free_block_cached(&self, cache: &LocalCache, addr: *mut u8) {
        assert!(self.contains(addr), "free of pointer outside block region");

        if cache.count.get() == LOCAL_MAX_COUNT as u32 {
            let (splice_head, splice_tail) = {
                let list = unsafe { &*cache.next.get() };
                (list[LOCAL_FREE_HIGH], list[LOCAL_FREE_LOW])
            };
            let tail_header = self.header(splice_tail & u32::MAX as u64);
            let mut head = self.head.value.load(Ordering::Relaxed);
            loop {
                unsafe {
                    (*tail_header).next.store(head, Ordering::Relaxed);
                }
                match self.head.value.compare_exchange(
                    head,
                    splice_head,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => head = current,
                }
            }
            cache.count.set(LOCAL_FREE_LOW as u32);
        }

        let header = unsafe { addr.sub(CACHE_LINE) as *mut BlockHeader };
        let count = cache.count.get();
        unsafe {
            let list = &mut *cache.next.get();
            // Local entries chain through the headers so a later splice
            // hands the run over with its links already in place.
            (*header)
                .next
                .store(list[(count - 1) as usize], Ordering::Relaxed);
            list[count as usize] = (*header).id.load(Ordering::Relaxed);
        }
        cache.count.set(count + 1);
    }
}

/// Capacity of the per-thread id stack; entry 0 is a dummy.
pub const LOCAL_MAX_COUNT: usize = 32;
/// After a splice-back, the stack keeps entries below this index.
pub const LOCAL_FREE_LOW: usize = 16;
/// Most recent entry spliced back (the run is `[LOW, HIGH]`).
pub const LOCAL_FREE_HIGH: usize = 31;

const _: () = assert!(LOCAL_MAX_COUNT - 1 == LOCAL_FREE_HIGH);
const _: () = assert!(LOCAL_FREE_LOW <= LOCAL_FREE_HIGH);
const _: () = assert!(1 <= LOCAL_FREE_LOW);

/// Per-thread stack of freed block ids for the hot size class.
/// Single-threaded by construction; no atomics needed internally.
pub struct LocalCache {
    count: Cell<u32>,
    next: UnsafeCell<[u64; LOCAL_MAX_COUNT]>,
}

impl LocalCache {
    pub const fn new() -> Self {
        Self {
            count: Cell::new(1),
            next: UnsafeCell::new([0; LOCAL_MAX_COUNT]),
        }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut allocator = BlockAllocator::alloc(16, 256);
        assert!(allocator.capacity() >= 16);
        assert!(allocator.payload_size() >= 256);

        let a = allocator.alloc_block();
        let b = allocator.alloc_block();
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert_eq!(a as u64 % CACHE_LINE as u64, 0);
        assert_eq!(b as u64 % CACHE_LINE as u64, 0);

        unsafe {
            a.write_bytes(0x11, 256);
            b.write_bytes(0x22, 256);
            assert_eq!(a.read(), 0x11);
            assert_eq!(b.read(), 0x22);
        }

        allocator.free_block(b);
        allocator.free_block(a);
        // LIFO: a comes back first.
        assert_eq!(allocator.alloc_block(), a);
        assert_eq!(allocator.alloc_block(), b);
        allocator.free_region();
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut allocator = BlockAllocator::alloc(4, 64);
        let capacity = allocator.capacity();
        let mut held = Vec::new();
        for _ in 0..capacity {
            let addr = allocator.alloc_block();
            assert!(!addr.is_null());
            held.push(addr);
        }
        assert!(allocator.alloc_block().is_null());
        for addr in held {
            allocator.free_block(addr);
        }
        assert!(!allocator.alloc_block().is_null());
        allocator.free_region();
    }

    #[test]
    fn test_blocks_distinct_and_in_region() {
        let mut allocator = BlockAllocator::alloc(64, 128);
        let mut seen = HashSet::new();
        loop {
            let addr = allocator.alloc_block();
            if addr.is_null() {
                break;
            }
            assert!(seen.insert(addr as u64), "duplicate block pointer");
        }
        assert_eq!(seen.len() as u64, allocator.capacity());
        allocator.free_region();
    }

    #[test]
    fn test_cached_path_reuses_locally() {
        let mut allocator = BlockAllocator::alloc(64, 256);
        let cache = LocalCache::new();

        let a = allocator.alloc_block_cached(&cache);
        let b = allocator.alloc_block_cached(&cache);
        allocator.free_block_cached(&cache, a);
        allocator.free_block_cached(&cache, b);
        // Local stack pops in LIFO order.
        assert_eq!(allocator.alloc_block_cached(&cache), b);
        assert_eq!(allocator.alloc_block_cached(&cache), a);
        allocator.free_region();
    }

    #[test]
    fn test_cached_splice_back() {
        let mut allocator = BlockAllocator::alloc(128, 256);
        let cache = LocalCache::new();

        let mut held = Vec::new();
        for _ in 0..(LOCAL_MAX_COUNT + 8) {
            let addr = allocator.alloc_block_cached(&cache);
            assert!(!addr.is_null());
            held.push(addr);
        }
        // Free more than the cache holds to force a splice.
        for addr in held.drain(..) {
            allocator.free_block_cached(&cache, addr);
        }
        // Everything must still be allocatable exactly once.
        let mut seen = HashSet::new();
        loop {
            let addr = allocator.alloc_block_cached(&cache);
            if addr.is_null() {
                break;
            }
            assert!(seen.insert(addr as u64));
        }
        assert_eq!(seen.len() as u64, allocator.capacity());
        allocator.free_region();
    }

    #[test]
    fn test_concurrent_alloc_free_stress() {
        const THREADS: usize = 8;
        const CYCLES: usize = 20_000;

        let allocator = Arc::new(BlockAllocator::alloc(512, 256));
        let live = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let allocator = Arc::clone(&allocator);
            let live = Arc::clone(&live);
            handles.push(std::thread::spawn(move || {
                for _ in 0..CYCLES {
                    let addr = allocator.alloc_block();
                    if addr.is_null() {
                        continue;
                    }
                    let now = live.fetch_add(1, AtomicOrdering::Relaxed) + 1;
                    assert!(now as u64 <= allocator.capacity());
                    unsafe {
                        addr.write(0xA5);
                    }
                    live.fetch_sub(1, AtomicOrdering::Relaxed);
                    allocator.free_block(addr);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // After the storm every block is allocatable exactly once.
        let mut seen = HashSet::new();
        loop {
            let addr = allocator.alloc_block();
            if addr.is_null() {
                break;
            }
            assert!(seen.insert(addr as u64));
        }
        assert_eq!(seen.len() as u64, allocator.capacity());
    }
}
