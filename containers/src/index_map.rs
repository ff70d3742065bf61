//! Chained hash map from a 32-bit hash to chains of `u32` indices.
//!
//! Built for the contact database: values *are* pool indices, so the
//! chain links live in a per-index side table (`next[value]`) and a
//! bucket array of chain heads. The map resolves nothing itself — on
//! lookup the caller walks `first(hash)` / `next(index)` and compares
//! its own full keys, exactly like the records it indexes.

use grit_lib::power_of_two_check;
use grit_platform::vm::{self, MemSlot};

/// End of a bucket chain.
pub const MAP_NULL: u32 = u32::MAX;

pub struct IndexMap {
    bucket_slot: MemSlot,
    buckets: *mut u32,
    mask: u32,
    next_slot: MemSlot,
    next: *mut u32,
    length: u32,
    growable: bool,
}

#[inline]
fn mix(hash: u32) -> u32 {
    // Fibonacci spread so low-entropy keys still fill the buckets.
    hash.wrapping_mul(0x9E37_79B9)
}

impl IndexMap {
    /// `bucket_count` must be a power of two; `length` bounds the index
    /// side table (growable maps extend it on demand).
    pub fn alloc(bucket_count: u32, length: u32, growable: bool) -> Self {
        debug_assert!(power_of_two_check(bucket_count as u64));
        debug_assert!(length > 0);

        let bucket_slot = vm::reserve(bucket_count as u64 * 4, false);
        let next_slot = vm::reserve(length as u64 * 4, false);
        assert!(!bucket_slot.is_null() && !next_slot.is_null());

        let length = (next_slot.size / 4).min(u32::MAX as u64 - 1) as u32;
        let mut map = Self {
            buckets: bucket_slot.address as *mut u32,
            bucket_slot,
            mask: bucket_count - 1,
            next: next_slot.address as *mut u32,
            next_slot,
            length,
            growable,
        };
        map.flush();
        map
    }

    pub fn free(&mut self) {
        vm::release(&mut self.bucket_slot);
        vm::release(&mut self.next_slot);
        self.buckets = core::ptr::null_mut();
        self.next = core::ptr::null_mut();
        self.length = 0;
    }

    /// Empty every bucket. The side table needs no clearing; entries
    /// are written before they become reachable.
    pub fn flush(&mut self) {
        for bucket in 0..=self.mask {
            unsafe {
                *self.buckets.add(bucket as usize) = MAP_NULL;
            }
        }
    }

    #[inline]
    fn bucket(&self, hash: u32) -> usize {
        (mix(hash) & self.mask) as usize
    }

    /// Make the side table cover `index`. False when it cannot: the
    /// index is out of range and the map is not growable.
    fn ensure_length(&mut self, index: u32) -> bool {
        if index < self.length {
            return true;
        }
        if !self.growable {
            return false;
        }
        let mut new_length = self.length.max(1);
        while new_length <= index {
            new_length <<= 1;
        }
        vm::remap(&mut self.next_slot, new_length as u64 * 4);
        self.next = self.next_slot.address as *mut u32;
        self.length = new_length;
        true
    }

    /// Prepend `index` to the chain of `hash`. False when `index` lies
    /// outside the side table of a non-growable map; the map is
    /// unchanged in that case.
    pub fn add(&mut self, hash: u32, index: u32) -> bool {
        if !self.ensure_length(index) {
            return false;
        }
        let bucket = self.bucket(hash);
        unsafe {
            *self.next.add(index as usize) = *self.buckets.add(bucket);
            *self.buckets.add(bucket) = index;
        }
        true
    }

    /// Unlink `index` from the chain of `hash`. The pair must be
    /// present.
    pub fn remove(&mut self, hash: u32, index: u32) {
        let bucket = self.bucket(hash);
        unsafe {
            let mut cursor = *self.buckets.add(bucket);
            if cursor == index {
                *self.buckets.add(bucket) = *self.next.add(index as usize);
                return;
            }
            while cursor != MAP_NULL {
                let next = *self.next.add(cursor as usize);
                if next == index {
                    *self.next.add(cursor as usize) = *self.next.add(index as usize);
                    return;
                }
                cursor = next;
            }
        }
        debug_assert!(false, "index map remove of absent entry");
    }

    /// Head of the chain for `hash`, or [`MAP_NULL`].
    #[inline]
    pub fn first(&self, hash: u32) -> u32 {
        unsafe { *self.buckets.add(self.bucket(hash)) }
    }

    /// Next index on the chain after `index`, or [`MAP_NULL`].
    #[inline]
    pub fn next(&self, index: u32) -> u32 {
        debug_assert!(index < self.length);
        unsafe { *self.next.add(index as usize) }
    }
}

impl Drop for IndexMap {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(map: &IndexMap, hash: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut cursor = map.first(hash);
        while cursor != MAP_NULL {
            chain.push(cursor);
            cursor = map.next(cursor);
        }
        chain
    }

    #[test]
    fn test_add_first_next() {
        let mut map = IndexMap::alloc(16, 64, false);
        assert!(map.add(7, 3));
        assert!(map.add(7, 9));
        assert!(map.add(8, 4));
        assert_eq!(collect(&map, 7), vec![9, 3]);
        assert_eq!(collect(&map, 8), vec![4]);
        assert_eq!(map.first(10), MAP_NULL);
        map.free();
    }

    #[test]
    fn test_remove_head_and_middle() {
        let mut map = IndexMap::alloc(16, 64, false);
        for index in [1, 2, 3] {
            assert!(map.add(5, index));
        }
        assert_eq!(collect(&map, 5), vec![3, 2, 1]);
        map.remove(5, 3);
        assert_eq!(collect(&map, 5), vec![2, 1]);
        map.remove(5, 1);
        assert_eq!(collect(&map, 5), vec![2]);
        map.remove(5, 2);
        assert!(collect(&map, 5).is_empty());
        map.free();
    }

    #[test]
    fn test_colliding_hashes_share_bucket() {
        let mut map = IndexMap::alloc(2, 16, false);
        // With two buckets most hashes collide; chains must stay
        // disjoint per insertion regardless.
        assert!(map.add(0, 1));
        assert!(map.add(1, 2));
        assert!(map.add(2, 3));
        let total: usize = [0u32, 1, 2].iter().map(|&h| collect(&map, h).len()).sum();
        // Chains may alias buckets; every entry reachable exactly once
        // through its own hash.
        assert!(total >= 3);
        assert!(collect(&map, 0).contains(&1));
        assert!(collect(&map, 1).contains(&2));
        assert!(collect(&map, 2).contains(&3));
        map.free();
    }

    #[test]
    fn test_growable_side_table() {
        let mut map = IndexMap::alloc(16, 1024, true);
        let beyond = 100_000;
        assert!(map.add(3, beyond));
        assert_eq!(collect(&map, 3), vec![beyond]);
        map.free();
    }

    #[test]
    fn test_non_growable_rejects_out_of_range() {
        let mut map = IndexMap::alloc(16, 64, false);
        // The side table may round up to whole pages; probe its real
        // edge, not the requested length.
        let limit = map.length;
        assert!(map.add(4, limit - 1));
        assert!(!map.add(4, limit));
        assert!(!map.add(4, u32::MAX - 1));
        // The refused index left the chains untouched.
        assert_eq!(collect(&map, 4), vec![limit - 1]);
        map.free();
    }

    #[test]
    fn test_flush_empties() {
        let mut map = IndexMap::alloc(16, 64, false);
        assert!(map.add(1, 1));
        assert!(map.add(2, 2));
        map.flush();
        assert_eq!(map.first(1), MAP_NULL);
        assert_eq!(map.first(2), MAP_NULL);
        map.free();
    }
}
