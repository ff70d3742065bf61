//! Intrusive slot pools.
//!
//! A pool allocates fixed-size records out of one contiguous buffer.
//! Each record embeds a state word the pool owns: allocated slots have
//! the top bit set, free slots hold the index of the next free slot,
//! and [`POOL_NULL`] terminates the chain. Records never move, so a
//! `u32` index is a stable handle.
//!
//! The generational variant additionally embeds a `u32` generation the
//! pool bumps every time a slot is recycled; callers holding
//! `(index, generation)` pairs can detect stale handles.
//!
//! [`ExternalPool`] keeps the state words in an internal side pool and
//! the payload in a separate plain buffer, so primitive types can be
//! pooled without embedding anything.

use grit_lib::log::SystemTag;
use grit_lib::{fatal_cleanup_and_exit, log_fatal};

use grit_platform::vm::{self, MemSlot};

use crate::arena::Arena;
use crate::poison::{poison, unpoison};

/// Terminates the free chain; also the largest invalid index.
pub const POOL_NULL: u32 = 0x7fff_ffff;

/// Top bit of the state word: set while the slot is allocated.
pub const POOL_ALLOCATED_BIT: u32 = 0x8000_0000;

/// Access to the state word a pooled record embeds.
pub trait PoolSlot {
    fn state(&self) -> u32;
    fn set_state(&mut self, state: u32);
}

/// Access to the generation word of a generational record.
pub trait GenSlot: PoolSlot {
    fn generation(&self) -> u32;
    fn set_generation(&mut self, generation: u32);
}

/// Returns true when the record is currently allocated.
#[inline]
pub fn slot_allocated<T: PoolSlot>(record: &T) -> bool {
    record.state() & POOL_ALLOCATED_BIT != 0
}

/// An allocation: the record address and its stable index.
pub struct Slot<T> {
    pub address: *mut T,
    pub index: u32,
}

impl<T> Slot<T> {
    pub const fn null() -> Self {
        Self {
            address: core::ptr::null_mut(),
            index: POOL_NULL,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }
}

pub struct Pool<T: PoolSlot> {
    slot: MemSlot,
    buf: *mut T,
    length: u32,
    count: u32,
    count_max: u32,
    next_free: u32,
    growable: bool,
}

impl<T: PoolSlot> Pool<T> {
    const SLOT_SIZE: u64 = core::mem::size_of::<T>() as u64;

    /// An unusable pool; every `add` fails.
    pub const fn empty() -> Self {
        Self {
            slot: MemSlot::empty(),
            buf: core::ptr::null_mut(),
            length: 0,
            count: 0,
            count_max: 0,
            next_free: POOL_NULL,
            growable: false,
        }
    }

    /// Allocate a pool of `length` records on `mem` when given, else on
    /// fresh pages. Growable pools must be page-backed. Returns an
    /// empty pool (`length == 0`) on allocation failure.
    pub fn alloc(mem: Option<&mut Arena>, length: u32, growable: bool) -> Self {
        debug_assert!(!(growable && mem.is_some()));
        debug_assert!(length > 0 && length <= POOL_NULL);

        let mut pool = Self::empty();

        let (buf, length_used) = match mem {
            Some(arena) => (
                arena.push_aligned(
                    Self::SLOT_SIZE * length as u64,
                    core::mem::align_of::<T>() as u64,
                ),
                length,
            ),
            None => {
                let slot = vm::reserve(Self::SLOT_SIZE * length as u64, true);
                if slot.is_null() {
                    return pool;
                }
                let fit = (slot.size / Self::SLOT_SIZE).min(POOL_NULL as u64) as u32;
                pool.slot = slot;
                (pool.slot.address, fit)
            }
        };

        if buf.is_null() {
            return Self::empty();
        }

        pool.buf = buf as *mut T;
        pool.length = length_used;
        pool.growable = growable;
        poison(buf, Self::SLOT_SIZE * length_used as u64);
        pool
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// High watermark: one past the largest index ever allocated.
    #[inline]
    pub fn count_max(&self) -> u32 {
        self.count_max
    }

    /// Release page-backed storage. Arena-backed pools are freed by
    /// their arena.
    pub fn dealloc(&mut self) {
        if !self.slot.is_null() {
            vm::release(&mut self.slot);
        }
        self.buf = core::ptr::null_mut();
        self.length = 0;
    }

    /// Drop every allocation.
    pub fn flush(&mut self) {
        self.count = 0;
        self.count_max = 0;
        self.next_free = POOL_NULL;
        poison(self.buf as *mut u8, Self::SLOT_SIZE * self.length as u64);
    }

    fn grow(&mut self) {
        const LENGTH_MAX: u32 = u32::MAX >> 1;
        if self.length == LENGTH_MAX {
            log_fatal!(SystemTag::Memory, "pool allocator full, exiting");
            fatal_cleanup_and_exit();
        }

        let old_length = self.length;
        self.length = (self.length << 1).min(LENGTH_MAX);

        self.buf = vm::remap(&mut self.slot, self.length as u64 * Self::SLOT_SIZE) as *mut T;

        unpoison(self.buf as *mut u8, Self::SLOT_SIZE * old_length as u64);
        poison(
            unsafe { (self.buf as *mut u8).add((old_length as u64 * Self::SLOT_SIZE) as usize) },
            (self.length - old_length) as u64 * Self::SLOT_SIZE,
        );
    }

    /// Take a slot from the free chain, or bump-allocate, or grow.
    /// Returns a null slot when the pool is full and not growable.
    pub fn add(&mut self) -> Slot<T> {
        if self.count < self.length {
            let index = if self.next_free != POOL_NULL {
                let index = self.next_free;
                let address = self.address(index);
                unpoison(address as *mut u8, Self::SLOT_SIZE);
                let state = unsafe { (*address).state() };
                debug_assert!(state & POOL_ALLOCATED_BIT == 0);
                self.next_free = state & !POOL_ALLOCATED_BIT;
                index
            } else {
                let index = self.count_max;
                unpoison(self.address(index) as *mut u8, Self::SLOT_SIZE);
                self.count_max += 1;
                index
            };
            let address = self.address(index);
            unsafe {
                (*address).set_state(POOL_ALLOCATED_BIT);
            }
            self.count += 1;
            Slot { address, index }
        } else if self.growable {
            self.grow();
            let index = self.count_max;
            let address = self.address(index);
            unpoison(address as *mut u8, Self::SLOT_SIZE);
            unsafe {
                (*address).set_state(POOL_ALLOCATED_BIT);
            }
            self.count_max += 1;
            self.count += 1;
            Slot { address, index }
        } else {
            Slot::null()
        }
    }

    /// Free the slot at `index`, putting it at the head of the free
    /// chain.
    pub fn remove(&mut self, index: u32) {
        debug_assert!(index < self.length);

        let address = self.address(index);
        debug_assert!(slot_allocated(unsafe { &*address }));

        unsafe {
            (*address).set_state(self.next_free);
        }
        self.next_free = index;
        self.count -= 1;
        poison(address as *mut u8, Self::SLOT_SIZE);
    }

    /// Free the slot holding `record`.
    pub fn remove_address(&mut self, record: *mut T) {
        let index = self.index(record);
        self.remove(index);
    }

    /// Record address for `index`.
    #[inline]
    pub fn address(&self, index: u32) -> *mut T {
        debug_assert!(index <= self.count_max);
        unsafe { self.buf.add(index as usize) }
    }

    /// Index of `record`, asserting it lies inside the buffer on a
    /// record boundary.
    pub fn index(&self, record: *const T) -> u32 {
        let base = self.buf as u64;
        let addr = record as u64;
        debug_assert!(addr >= base);
        debug_assert!(addr < base + self.length as u64 * Self::SLOT_SIZE);
        debug_assert!((addr - base) % Self::SLOT_SIZE == 0);
        ((addr - base) / Self::SLOT_SIZE) as u32
    }
}

impl<T: GenSlot> Pool<T> {
    /// Generational `add`: recycled slots get their generation bumped,
    /// fresh slots start at generation 0.
    pub fn add_generational(&mut self) -> Slot<T> {
        if self.count < self.length {
            let (index, fresh) = if self.next_free != POOL_NULL {
                let index = self.next_free;
                unpoison(self.address(index) as *mut u8, Self::SLOT_SIZE);
                let state = unsafe { (*self.address(index)).state() };
                debug_assert!(state & POOL_ALLOCATED_BIT == 0);
                self.next_free = state & !POOL_ALLOCATED_BIT;
                (index, false)
            } else {
                let index = self.count_max;
                unpoison(self.address(index) as *mut u8, Self::SLOT_SIZE);
                self.count_max += 1;
                (index, true)
            };
            let address = self.address(index);
            unsafe {
                if fresh {
                    (*address).set_generation(0);
                } else {
                    let generation = (*address).generation();
                    (*address).set_generation(generation.wrapping_add(1));
                }
                (*address).set_state(POOL_ALLOCATED_BIT);
            }
            self.count += 1;
            Slot { address, index }
        } else if self.growable {
            self.grow();
            let index = self.count_max;
            let address = self.address(index);
            unpoison(address as *mut u8, Self::SLOT_SIZE);
            unsafe {
                (*address).set_generation(0);
                (*address).set_state(POOL_ALLOCATED_BIT);
            }
            self.count_max += 1;
            self.count += 1;
            Slot { address, index }
        } else {
            Slot::null()
        }
    }

    /// True when `generation` still matches the slot's stored
    /// generation — the handle has not been recycled.
    pub fn handle_valid(&self, index: u32, generation: u32) -> bool {
        if index >= self.count_max {
            return false;
        }
        let record = unsafe { &*self.address(index) };
        slot_allocated(record) && record.generation() == generation
    }
}

impl<T: PoolSlot> Drop for Pool<T> {
    fn drop(&mut self) {
        self.dealloc();
    }
}

// ---------------------------------------------------------------------------
// External pool
// ---------------------------------------------------------------------------

/// State-word record backing each external payload slot.
struct ExternalState {
    state: u32,
}

impl PoolSlot for ExternalState {
    fn state(&self) -> u32 {
        self.state
    }
    fn set_state(&mut self, state: u32) {
        self.state = state;
    }
}

/// Pools plain values (`f32`, `u32`, vectors) by pairing an internal
/// state pool with a separate payload buffer using the same indices.
pub struct ExternalPool<V> {
    pool: Pool<ExternalState>,
    payload: MemSlot,
    buf: *mut V,
}

impl<V> ExternalPool<V> {
    const SLOT_SIZE: u64 = core::mem::size_of::<V>() as u64;

    /// Returns an unusable pool (`length == 0`) on failure.
    pub fn alloc(length: u32, growable: bool) -> Self {
        let mut ext = Self {
            pool: Pool::alloc(None, length, growable),
            payload: MemSlot::empty(),
            buf: core::ptr::null_mut(),
        };

        if ext.pool.length() == 0 {
            return ext;
        }

        let payload = vm::reserve(Self::SLOT_SIZE * ext.pool.length() as u64, true);
        if payload.is_null() {
            ext.pool.dealloc();
            return ext;
        }
        ext.buf = payload.address as *mut V;
        ext.payload = payload;
        poison(
            ext.payload.address,
            Self::SLOT_SIZE * ext.pool.length() as u64,
        );
        ext
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.pool.length()
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.pool.count()
    }

    pub fn dealloc(&mut self) {
        self.pool.dealloc();
        if !self.payload.is_null() {
            vm::release(&mut self.payload);
        }
        self.buf = core::ptr::null_mut();
    }

    pub fn flush(&mut self) {
        self.pool.flush();
        poison(
            self.payload.address,
            Self::SLOT_SIZE * self.pool.length() as u64,
        );
    }

    /// Allocate a payload slot. Grows both buffers when the internal
    /// pool grows.
    pub fn add(&mut self) -> Slot<V> {
        let old_length = self.pool.length();
        let slot = self.pool.add();

        if slot.is_null() {
            return Slot::null();
        }

        if old_length != self.pool.length() {
            self.buf =
                vm::remap(&mut self.payload, Self::SLOT_SIZE * self.pool.length() as u64) as *mut V;
            unpoison(self.payload.address, Self::SLOT_SIZE * old_length as u64);
            poison(
                unsafe {
                    self.payload
                        .address
                        .add((Self::SLOT_SIZE * old_length as u64) as usize)
                },
                Self::SLOT_SIZE * (self.pool.length() - old_length) as u64,
            );
        }

        let address = unsafe { self.buf.add(slot.index as usize) };
        unpoison(address as *mut u8, Self::SLOT_SIZE);
        Slot {
            address,
            index: slot.index,
        }
    }

    pub fn remove(&mut self, index: u32) {
        self.pool.remove(index);
        poison(
            unsafe { self.buf.add(index as usize) } as *mut u8,
            Self::SLOT_SIZE,
        );
    }

    pub fn remove_address(&mut self, value: *mut V) {
        let index = self.index(value);
        self.remove(index);
    }

    #[inline]
    pub fn address(&self, index: u32) -> *mut V {
        debug_assert!(index <= self.pool.count_max());
        unsafe { self.buf.add(index as usize) }
    }

    pub fn index(&self, value: *const V) -> u32 {
        let base = self.buf as u64;
        let addr = value as u64;
        debug_assert!(addr >= base);
        debug_assert!(addr < base + self.pool.length() as u64 * Self::SLOT_SIZE);
        debug_assert!((addr - base) % Self::SLOT_SIZE == 0);
        ((addr - base) / Self::SLOT_SIZE) as u32
    }
}

impl<V> Drop for ExternalPool<V> {
    fn drop(&mut self) {
        self.dealloc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Record {
        state: u32,
        value: u64,
    }

    impl PoolSlot for Record {
        fn state(&self) -> u32 {
            self.state
        }
        fn set_state(&mut self, state: u32) {
            self.state = state;
        }
    }

    struct GenRecord {
        state: u32,
        generation: u32,
        value: u64,
    }

    impl PoolSlot for GenRecord {
        fn state(&self) -> u32 {
            self.state
        }
        fn set_state(&mut self, state: u32) {
            self.state = state;
        }
    }

    impl GenSlot for GenRecord {
        fn generation(&self) -> u32 {
            self.generation
        }
        fn set_generation(&mut self, generation: u32) {
            self.generation = generation;
        }
    }

    #[test]
    fn test_add_assigns_sequential_then_recycles() {
        let mut pool: Pool<Record> = Pool::alloc(None, 100, false);
        assert!(pool.length() >= 100);

        for i in 0..100u32 {
            let slot = pool.add();
            assert!(!slot.is_null());
            assert_eq!(slot.index, i);
            unsafe {
                (*slot.address).value = i as u64;
            }
        }
        assert_eq!(unsafe { (*pool.address(42)).value }, 42);

        // Free 0, 5, 17: the chain serves them back LIFO.
        pool.remove(0);
        pool.remove(5);
        pool.remove(17);
        assert_eq!(pool.add().index, 17);
        assert_eq!(pool.add().index, 5);
        assert_eq!(pool.add().index, 0);
        pool.dealloc();
    }

    #[test]
    fn test_count_invariant() {
        let mut pool: Pool<Record> = Pool::alloc(None, 64, false);
        let length = pool.length();

        for _ in 0..10 {
            pool.add();
        }
        pool.remove(3);
        pool.remove(7);

        // count + free-chain length + untouched tail == length
        let mut chain = 0u32;
        let mut cursor = pool.next_free;
        while cursor != POOL_NULL {
            chain += 1;
            cursor = unsafe { (*pool.address(cursor)).state() } & !POOL_ALLOCATED_BIT;
        }
        assert_eq!(pool.count() + chain + (length - pool.count_max()), length);
        pool.dealloc();
    }

    #[test]
    fn test_index_address_roundtrip() {
        let mut pool: Pool<Record> = Pool::alloc(None, 32, false);
        for _ in 0..32 {
            pool.add();
        }
        for i in 0..32u32 {
            assert_eq!(pool.index(pool.address(i)), i);
        }
        pool.dealloc();
    }

    #[test]
    fn test_full_pool_returns_null() {
        let mut pool: Pool<Record> = Pool::alloc(None, 8, false);
        let length = pool.length();
        for _ in 0..length {
            assert!(!pool.add().is_null());
        }
        assert!(pool.add().is_null());
        pool.dealloc();
    }

    #[test]
    fn test_growable_pool_doubles() {
        let mut pool: Pool<Record> = Pool::alloc(None, 64, true);
        let initial = pool.length();
        for _ in 0..initial {
            assert!(!pool.add().is_null());
        }
        let slot = pool.add();
        assert!(!slot.is_null());
        assert_eq!(slot.index, initial);
        assert!(pool.length() > initial);
        pool.dealloc();
    }

    #[test]
    fn test_arena_backed_pool() {
        let mut arena = Arena::alloc(64 * 1024);
        let mut pool: Pool<Record> = Pool::alloc(Some(&mut arena), 16, false);
        assert_eq!(pool.length(), 16);
        let slot = pool.add();
        assert!(!slot.is_null());
        unsafe {
            (*slot.address).value = 7;
        }
        pool.remove(slot.index);
        // Arena owns the buffer; dealloc must not unmap anything.
        pool.dealloc();
        arena.free();
    }

    #[test]
    fn test_generations_bump_on_recycle() {
        let mut pool: Pool<GenRecord> = Pool::alloc(None, 8, false);
        let slot = pool.add_generational();
        let index = slot.index;
        assert_eq!(unsafe { (*slot.address).generation() }, 0);
        unsafe {
            (*slot.address).value = 1;
            assert_eq!((*slot.address).value, 1);
        }
        assert!(pool.handle_valid(index, 0));

        pool.remove(index);
        assert!(!pool.handle_valid(index, 0));

        let slot = pool.add_generational();
        assert_eq!(slot.index, index);
        assert_eq!(unsafe { (*slot.address).generation() }, 1);
        assert!(pool.handle_valid(index, 1));
        assert!(!pool.handle_valid(index, 0));
        pool.dealloc();
    }

    #[test]
    fn test_flush_resets() {
        let mut pool: Pool<Record> = Pool::alloc(None, 8, false);
        pool.add();
        pool.add();
        pool.flush();
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.count_max(), 0);
        assert_eq!(pool.add().index, 0);
        pool.dealloc();
    }

    #[test]
    fn test_external_pool_roundtrip() {
        let mut pool: ExternalPool<f32> = ExternalPool::alloc(16, false);
        assert!(pool.length() >= 16);

        let a = pool.add();
        let b = pool.add();
        unsafe {
            *a.address = 1.5;
            *b.address = -2.25;
        }
        assert_eq!(pool.index(a.address), a.index);
        assert_eq!(unsafe { *pool.address(b.index) }, -2.25);

        pool.remove(a.index);
        let c = pool.add();
        assert_eq!(c.index, a.index);
        pool.dealloc();
    }

    #[test]
    fn test_external_pool_growable() {
        let mut pool: ExternalPool<u32> = ExternalPool::alloc(1024, true);
        let initial = pool.length();
        for i in 0..initial {
            let slot = pool.add();
            unsafe {
                *slot.address = i;
            }
        }
        let slot = pool.add();
        assert!(!slot.is_null());
        assert_eq!(slot.index, initial);
        // Old payload survived the growth copy.
        assert_eq!(unsafe { *pool.address(0) }, 0);
        assert_eq!(unsafe { *pool.address(initial - 1) }, initial - 1);
        pool.dealloc();
    }
}
