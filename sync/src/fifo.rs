//! Single-producer / multi-consumer FIFO.
//!
//! The producer owns the write cursor outright; consumers reserve
//! entries by blocking on the semaphore and fetch-adding the shared
//! head. Capacity is a power of two so the monotonic counters fold
//! modulo capacity without a discontinuity at the 32-bit wrap.
//!
//! Ordering: the payload store is release and the consumer's load
//! acquire, so everything the producer wrote before publishing is
//! visible to the consumer. The consumer's `in_use` clear is release so
//! the producer's next relaxed check observes the slot's reuse once the
//! semaphore has carried the happens-before.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use grit_lib::power_of_two_check;
use grit_mem::arena::Arena;
use grit_platform::sem::Semaphore;
use grit_platform::vm::{self, MemSlot};

#[repr(C)]
struct FifoEntry {
    in_use: AtomicU32,
    data: AtomicPtr<()>,
}

pub struct FifoSpmc {
    entries: *mut FifoEntry,
    slot: MemSlot,
    capacity: u32,
    /// Producer-owned; stored atomically only so the queue stays `Sync`.
    next_alloc: AtomicU32,
    head: AtomicU32,
    ready: Semaphore,
}

// SAFETY: entries are handed off through release/acquire pairs and the
// semaphore; the producer cursor is single-writer by contract.
unsafe impl Send for FifoSpmc {}
unsafe impl Sync for FifoSpmc {}

impl FifoSpmc {
    /// Allocate a queue of `capacity` entries (power of two) on `mem`
    /// when given, else on fresh pages.
    pub fn alloc(mem: Option<&mut Arena>, capacity: u32) -> Self {
        assert!(capacity > 0 && power_of_two_check(capacity as u64));

        let bytes = capacity as u64 * core::mem::size_of::<FifoEntry>() as u64;
        let mut slot = MemSlot::empty();
        let buf = match mem {
            Some(arena) => arena.push_aligned(bytes, core::mem::align_of::<FifoEntry>() as u64),
            None => {
                slot = vm::reserve(bytes, false);
                assert!(!slot.is_null());
                slot.address
            }
        };
        assert!(!buf.is_null());
        let entries = buf as *mut FifoEntry;

        for i in 0..capacity {
            unsafe {
                (*entries.add(i as usize)).in_use = AtomicU32::new(0);
                (*entries.add(i as usize)).data = AtomicPtr::new(core::ptr::null_mut());
            }
        }

        Self {
            entries,
            slot,
            capacity,
            next_alloc: AtomicU32::new(0),
            head: AtomicU32::new(0),
            ready: Semaphore::new(0),
        }
    }

    pub fn destroy(&mut self) {
        if !self.slot.is_null() {
            vm::release(&mut self.slot);
        }
        self.entries = core::ptr::null_mut();
        self.capacity = 0;
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    fn entry(&self, index: u32) -> &FifoEntry {
        unsafe { &*self.entries.add((index % self.capacity) as usize) }
    }

    /// Producer only. False when the target slot is still in use.
    pub fn try_push(&self, data: *mut ()) -> bool {
        let cursor = self.next_alloc.load(Ordering::Relaxed);
        let entry = self.entry(cursor);

        if entry.in_use.load(Ordering::Relaxed) != 0 {
            return false;
        }

        self.next_alloc.store(cursor.wrapping_add(1), Ordering::Relaxed);
        entry.in_use.store(1, Ordering::Relaxed);
        // The release publishes both the payload and the in_use mark.
        entry.data.store(data, Ordering::Release);
        self.ready.post();
        true
    }

    /// Producer only. Spins until the queue has room.
    pub fn push(&self, data: *mut ()) {
        while !self.try_push(data) {
            core::hint::spin_loop();
        }
    }

    /// Blocks until an entry is available, then takes ownership of it.
    /// Any number of consumers may call this concurrently.
    pub fn pop(&self) -> *mut () {
        self.ready.wait();

        // Whatever index we draw, we own: the producer posted the
        // semaphore only after fully publishing the entry.
        let index = self.head.fetch_add(1, Ordering::Relaxed);
        let entry = self.entry(index);
        let data = entry.data.load(Ordering::Acquire);

        debug_assert!(entry.in_use.load(Ordering::Relaxed) == 1);

        // Release so the producer's next check observes slot reuse
        // only after our payload load has completed.
        entry.in_use.store(0, Ordering::Release);
        data
    }

    /// How many pushes would currently succeed. Acquire loads because
    /// the caller may inspect the payload region of free entries.
    pub fn pushable_count(&self) -> u32 {
        let cursor = self.next_alloc.load(Ordering::Relaxed);
        let mut count = 0;
        while count < self.capacity {
            if self.entry(cursor.wrapping_add(count)).in_use.load(Ordering::Acquire) != 0 {
                break;
            }
            count += 1;
        }
        count
    }
}

impl Drop for FifoSpmc {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_push_full_queue() {
        let fifo = FifoSpmc::alloc(None, 4);
        assert_eq!(fifo.pushable_count(), 4);

        let mut payload = [0u64; 8];
        for i in 0..4 {
            assert!(fifo.try_push(&mut payload[i] as *mut u64 as *mut ()));
        }
        assert!(!fifo.try_push(core::ptr::null_mut()));
        assert_eq!(fifo.pushable_count(), 0);

        let popped = fifo.pop();
        assert_eq!(popped, &mut payload[0] as *mut u64 as *mut ());
        assert_eq!(fifo.pushable_count(), 1);
    }

    #[test]
    fn test_fifo_order_single_consumer() {
        let fifo = FifoSpmc::alloc(None, 8);
        let mut payload = [0u32; 6];
        for i in 0..6 {
            fifo.push(&mut payload[i] as *mut u32 as *mut ());
        }
        for i in 0..6 {
            assert_eq!(fifo.pop(), &mut payload[i] as *mut u32 as *mut ());
        }
    }

    #[test]
    fn test_handoff_to_multiple_consumers() {
        const TOTAL: usize = 8;
        let fifo = Arc::new(FifoSpmc::alloc(None, 4));

        let payloads: Vec<Box<u64>> = (0..TOTAL as u64).map(Box::new).collect();
        let expected: Vec<*mut ()> = payloads
            .iter()
            .map(|b| b.as_ref() as *const u64 as *mut ())
            .collect();

        // Three consumers share the 8 pops.
        let shares = [3usize, 3, 2];
        let mut handles = Vec::new();
        for share in shares {
            let fifo = Arc::clone(&fifo);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..share {
                    seen.push(fifo.pop() as usize);
                }
                seen
            }));
        }

        for &ptr in &expected {
            fifo.push(ptr);
        }

        let mut delivered: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        delivered.sort_unstable();
        let mut wanted: Vec<usize> = expected.iter().map(|&p| p as usize).collect();
        wanted.sort_unstable();
        // Every payload delivered exactly once.
        assert_eq!(delivered, wanted);
        drop(payloads);
    }

    #[test]
    fn test_arena_backed_queue() {
        let mut arena = Arena::alloc(4096);
        let mut value = 9u32;
        {
            let fifo = FifoSpmc::alloc(Some(&mut arena), 8);
            fifo.push(&mut value as *mut u32 as *mut ());
            assert_eq!(fifo.pop(), &mut value as *mut u32 as *mut ());
        }
        arena.free();
    }
}
