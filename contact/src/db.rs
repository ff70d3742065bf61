use grit_containers::index_map::{IndexMap, MAP_NULL};
use grit_containers::list::{Dll, DllNode, NULL_INDEX};
use grit_containers::net_list::{NET_NULL, NetLinks, NetList, NetNode};
use grit_lib::power_of_two_check;
use grit_mem::arena::Arena;
use grit_mem::bitvec::BitVec;
use grit_mem::pool::{Pool, PoolSlot};

/// Island id of bodies that belong to no island (static geometry).
pub const ISLAND_NONE: u32 = u32::MAX;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IslandFlags: u32 {
        /// Set once the island has been reported for re-partitioning.
        const SPLIT = 1 << 0;
    }
}

/// Pooled island record; the caller owns partitioning, the database
/// only dedups reports through the `SPLIT` flag.
pub struct IslandRec {
    state: u32,
    pub flags: IslandFlags,
}

impl IslandRec {
    pub fn init(record: *mut IslandRec) {
        unsafe {
            (*record).flags = IslandFlags::empty();
        }
    }
}

impl PoolSlot for IslandRec {
    fn state(&self) -> u32 {
        self.state
    }
    fn set_state(&mut self, state: u32) {
        self.state = state;
    }
}

/// Narrow-phase manifold for one body pair. The database stores it
/// verbatim; its geometry is produced elsewhere.
#[derive(Clone, Copy, Debug)]
pub struct ContactManifold {
    pub normal: [f32; 3],
    pub depth: f32,
    pub point_count: u32,
    pub points: [[f32; 3]; 4],
}

impl ContactManifold {
    pub const fn empty() -> Self {
        Self {
            normal: [0.0; 3],
            depth: 0.0,
            point_count: 0,
            points: [[0.0; 3]; 4],
        }
    }
}

/// Pair fingerprint: the higher body id in the top 32 bits.
#[inline]
pub fn contact_key(body_a: u32, body_b: u32) -> u64 {
    let (lo, hi) = if body_a < body_b {
        (body_a, body_b)
    } else {
        (body_b, body_a)
    };
    ((hi as u64) << 32) | lo as u64
}

#[inline]
pub fn contact_body_lo(key: u64) -> u32 {
    key as u32
}

#[inline]
pub fn contact_body_hi(key: u64) -> u32 {
    (key >> 32) as u32
}

/// A live contact. Chain side 0 belongs to the pair's lower body,
/// side 1 to the higher.
#[repr(C)]
pub struct Contact {
    state: u32,
    links: NetLinks,
    pub key: u64,
    pub cm: ContactManifold,
    pub cached_count: u32,
}

impl PoolSlot for Contact {
    fn state(&self) -> u32 {
        self.state
    }
    fn set_state(&mut self, state: u32) {
        self.state = state;
    }
}

impl NetNode for Contact {
    fn links(&self) -> &NetLinks {
        &self.links
    }
    fn links_mut(&mut self) -> &mut NetLinks {
        &mut self.links
    }
}

/// Cached separating-axis state for one pair, swept when untouched for
/// a full frame.
#[repr(C)]
pub struct SatCache {
    state: u32,
    prev: u32,
    next: u32,
    pub key: u64,
    pub touched: u32,
    pub axis: u32,
}

impl SatCache {
    pub fn template(key: u64, axis: u32) -> Self {
        Self {
            state: 0,
            prev: NULL_INDEX,
            next: NULL_INDEX,
            key,
            touched: 0,
            axis,
        }
    }
}

impl PoolSlot for SatCache {
    fn state(&self) -> u32 {
        self.state
    }
    fn set_state(&mut self, state: u32) {
        self.state = state;
    }
}

impl DllNode for SatCache {
    fn prev(&self) -> u32 {
        self.prev
    }
    fn set_prev(&mut self, prev: u32) {
        self.prev = prev;
    }
    fn next(&self) -> u32 {
        self.next
    }
    fn set_next(&mut self, next: u32) {
        self.next = next;
    }
}

/// The slice of a rigid body the database touches: the head of its
/// contact chain and its island id.
pub struct Body {
    state: u32,
    pub first_contact: u32,
    pub island: u32,
}

impl Body {
    pub fn init(record: *mut Body, island: u32) {
        unsafe {
            (*record).first_contact = NET_NULL;
            (*record).island = island;
        }
    }
}

impl PoolSlot for Body {
    fn state(&self) -> u32 {
        self.state
    }
    fn set_state(&mut self, state: u32) {
        self.state = state;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContactEvent {
    New { body_lo: u32, body_hi: u32 },
    Removed { body_lo: u32, body_hi: u32 },
}

fn side_in_prev(list: &NetList<Contact>, contact: &Contact, side: u32) -> u32 {
    debug_assert!(side <= 1);
    let body = if side == 0 {
        contact_body_lo(contact.key)
    } else {
        contact_body_hi(contact.key)
    };

    let peer_index = contact.links().prev[side as usize];
    let peer = unsafe { &*list.address(peer_index) };
    debug_assert!(
        peer_index == NET_NULL
            || body == contact_body_lo(peer.key)
            || body == contact_body_hi(peer.key)
    );
    if body == contact_body_lo(peer.key) { 0 } else { 1 }
}

fn side_in_next(list: &NetList<Contact>, contact: &Contact, side: u32) -> u32 {
    debug_assert!(side <= 1);
    let body = if side == 0 {
        contact_body_lo(contact.key)
    } else {
        contact_body_hi(contact.key)
    };

    let peer_index = contact.links().next[side as usize];
    let peer = unsafe { &*list.address(peer_index) };
    debug_assert!(
        peer_index == NET_NULL
            || body == contact_body_lo(peer.key)
            || body == contact_body_hi(peer.key)
    );
    if body == contact_body_lo(peer.key) { 0 } else { 1 }
}

pub struct ContactDb {
    contacts: NetList<Contact>,
    contact_map: IndexMap,
    sat_pool: Pool<SatCache>,
    sat_list: Dll,
    sat_map: IndexMap,
    frame_usage: BitVec,
    persistent_usage: BitVec,
    events: Vec<ContactEvent>,
}

impl ContactDb {
    /// `size` must be a power of two; every internal structure starts
    /// at that capacity and grows on demand.
    pub fn alloc(size: u32) -> Self {
        assert!(power_of_two_check(size as u64));

        Self {
            contacts: NetList::alloc(None, size, true, side_in_prev, side_in_next),
            contact_map: IndexMap::alloc(size, size, true),
            sat_pool: Pool::alloc(None, size, true),
            sat_list: Dll::new(),
            sat_map: IndexMap::alloc(size, size, true),
            frame_usage: BitVec::empty(),
            persistent_usage: BitVec::alloc(None, size as u64, false, true),
            events: Vec::new(),
        }
    }

    pub fn free(&mut self) {
        self.contacts.dealloc();
        self.contact_map.free();
        self.sat_pool.dealloc();
        self.sat_map.free();
        self.frame_usage.free();
        self.persistent_usage.free();
        self.events.clear();
    }

    pub fn flush(&mut self) {
        self.frame_usage.free();
        self.sat_list.flush();
        self.sat_pool.flush();
        self.sat_map.flush();
        self.contacts.flush();
        self.contact_map.flush();
        self.persistent_usage.clear_all(false);
        self.events.clear();
    }

    #[inline]
    pub fn contact_count(&self) -> u32 {
        // The net list's dummy occupies one slot.
        self.contacts.pool().count() - 1
    }

    #[inline]
    pub fn sat_cache_count(&self) -> u32 {
        self.sat_pool.count()
    }

    #[inline]
    pub fn contact(&self, index: u32) -> *mut Contact {
        self.contacts.address(index)
    }

    /// Start a frame: fresh touched-bits sized to the persistent set.
    pub fn begin_frame(&mut self) {
        self.frame_usage.free();
        self.frame_usage = BitVec::alloc(None, self.persistent_usage.bit_count(), false, false);
    }

    /// Record (or refresh) the contact between `i1` and `i2`.
    pub fn add_contact(
        &mut self,
        bodies: &mut Pool<Body>,
        cm: &ContactManifold,
        i1: u32,
        i2: u32,
    ) -> *mut Contact {
        let key = contact_key(i1, i2);
        let lo = contact_body_lo(key);
        let hi = contact_body_hi(key);

        let index = self.lookup_contact_index(lo, hi);
        if index == NET_NULL {
            let body_lo = bodies.address(lo);
            let body_hi = bodies.address(hi);

            let template = Contact {
                state: 0,
                links: NetLinks::detached(),
                key,
                cm: *cm,
                cached_count: 0,
            };
            let slot = unsafe {
                self.contacts
                    .add(&template, (*body_lo).first_contact, (*body_hi).first_contact)
            };
            debug_assert!(!slot.is_null());

            unsafe {
                (*body_lo).first_contact = slot.index;
                (*body_hi).first_contact = slot.index;
            }

            // The map is growable, so coverage of a fresh pool index
            // cannot fail.
            let mapped = self.contact_map.add(key as u32, slot.index);
            debug_assert!(mapped);
            if (slot.index as u64) < self.frame_usage.bit_count() {
                self.frame_usage.set(slot.index as u64, true);
            }
            self.events.push(ContactEvent::New {
                body_lo: lo,
                body_hi: hi,
            });

            slot.address
        } else {
            let contact = self.contacts.address(index);
            if (index as u64) < self.frame_usage.bit_count() {
                self.frame_usage.set(index as u64, true);
            }
            unsafe {
                (*contact).cm = *cm;
            }
            contact
        }
    }

    /// Index of the pair's contact, or [`NET_NULL`].
    pub fn lookup_contact_index(&self, i1: u32, i2: u32) -> u32 {
        let key = contact_key(i1, i2);
        let mut index = self.contact_map.first(key as u32);
        while index != MAP_NULL {
            let contact = unsafe { &*self.contacts.address(index) };
            if contact.key == key {
                return index;
            }
            index = self.contact_map.next(index);
        }
        NET_NULL
    }

    /// The pair's contact, or null.
    pub fn lookup_contact(&self, i1: u32, i2: u32) -> *mut Contact {
        let index = self.lookup_contact_index(i1, i2);
        if index == NET_NULL {
            core::ptr::null_mut()
        } else {
            self.contacts.address(index)
        }
    }

    fn clear_usage_bits(&mut self, index: u32) {
        if (index as u64) < self.persistent_usage.bit_count() {
            self.persistent_usage.set(index as u64, false);
        }
        if (index as u64) < self.frame_usage.bit_count() {
            self.frame_usage.set(index as u64, false);
        }
    }

    /// Remove one contact, patching whichever body heads pointed at it.
    pub fn remove_contact(&mut self, bodies: &mut Pool<Body>, index: u32) {
        let contact = self.contacts.address(index);
        let (key, links) = unsafe { ((*contact).key, *(*contact).links()) };
        let lo = contact_body_lo(key);
        let hi = contact_body_hi(key);

        unsafe {
            let body_lo = bodies.address(lo);
            if (*body_lo).first_contact == index {
                (*body_lo).first_contact = links.next[0];
            }
            let body_hi = bodies.address(hi);
            if (*body_hi).first_contact == index {
                (*body_hi).first_contact = links.next[1];
            }
        }

        self.events.push(ContactEvent::Removed {
            body_lo: lo,
            body_hi: hi,
        });
        self.clear_usage_bits(index);
        self.contact_map.remove(key as u32, index);
        self.contacts.remove(index);
    }

    fn remove_sat_cache_for(&mut self, lo: u32, hi: u32) {
        let sat_index = self.sat_lookup_index(lo, hi);
        if sat_index != NULL_INDEX {
            let key = unsafe { (*self.sat_pool.address(sat_index)).key };
            self.sat_list.remove(&self.sat_pool, sat_index);
            self.sat_map.remove(key as u32, sat_index);
            self.sat_pool.remove(sat_index);
        }
    }

    /// Remove every contact of `body_index`, including any SAT caches
    /// for those pairs.
    pub fn remove_body_contacts(&mut self, bodies: &mut Pool<Body>, body_index: u32) {
        let body = bodies.address(body_index);
        let mut ci = unsafe { (*body).first_contact };
        unsafe {
            (*body).first_contact = NET_NULL;
        }

        while ci != NET_NULL {
            let contact = self.contacts.address(ci);
            let (key, links) = unsafe { ((*contact).key, *(*contact).links()) };
            let lo = contact_body_lo(key);
            let hi = contact_body_hi(key);

            self.remove_sat_cache_for(lo, hi);

            let (side, peer_index) = if body_index == lo { (0, hi) } else { (1, lo) };
            unsafe {
                let peer = bodies.address(peer_index);
                if (*peer).first_contact == ci {
                    (*peer).first_contact = links.next[1 - side];
                }
            }
            let ci_next = links.next[side];

            self.events.push(ContactEvent::Removed {
                body_lo: lo,
                body_hi: hi,
            });
            self.clear_usage_bits(ci);
            self.contact_map.remove(key as u32, ci);
            self.contacts.remove(ci);
            ci = ci_next;
        }
    }

    /// Remove every contact of a static body and record, once per
    /// island, the island id of each dynamic body that lost a contact.
    /// Ids are pushed packed onto `mem`; returns the array and count.
    pub fn remove_static_contacts_and_report_islands(
        &mut self,
        mem: &mut Arena,
        bodies: &mut Pool<Body>,
        islands: &mut Pool<IslandRec>,
        static_index: u32,
    ) -> (*mut u32, u32) {
        let mut array: *mut u32 = core::ptr::null_mut();
        let mut count = 0u32;

        let body = bodies.address(static_index);
        debug_assert!(unsafe { (*body).island } == ISLAND_NONE);
        let mut ci = unsafe { (*body).first_contact };
        unsafe {
            (*body).first_contact = NET_NULL;
        }

        while ci != NET_NULL {
            let contact = self.contacts.address(ci);
            let (key, links) = unsafe { ((*contact).key, *(*contact).links()) };
            let lo = contact_body_lo(key);
            let hi = contact_body_hi(key);

            let (side, peer_index) = if static_index == lo { (0, hi) } else { (1, lo) };
            let peer = bodies.address(peer_index);
            unsafe {
                if (*peer).first_contact == ci {
                    (*peer).first_contact = links.next[1 - side];
                }
            }
            let ci_next = links.next[side];

            let island_index = unsafe { (*peer).island };
            if island_index != ISLAND_NONE {
                let island = islands.address(island_index);
                if unsafe { !(*island).flags.contains(IslandFlags::SPLIT) } {
                    let pushed =
                        mem.push_packed_copy(&island_index.to_ne_bytes()) as *mut u32;
                    debug_assert!(!pushed.is_null());
                    if array.is_null() {
                        array = pushed;
                    }
                    unsafe {
                        (*island).flags |= IslandFlags::SPLIT;
                    }
                    count += 1;
                }
            }

            self.events.push(ContactEvent::Removed {
                body_lo: lo,
                body_hi: hi,
            });
            self.clear_usage_bits(ci);
            self.contact_map.remove(key as u32, ci);
            self.contacts.remove(ci);
            ci = ci_next;
        }

        (array, count)
    }

    /// Insert a cache for a pair that has none. The stored copy joins
    /// the sweep list touched.
    pub fn sat_cache_add(&mut self, cache: &SatCache) {
        let lo = contact_body_lo(cache.key);
        let hi = contact_body_hi(cache.key);
        debug_assert!(self.sat_lookup_index(lo, hi) == NULL_INDEX);

        let slot = self.sat_pool.add();
        debug_assert!(!slot.is_null());
        unsafe {
            let state = (*slot.address).state();
            core::ptr::copy_nonoverlapping(cache as *const SatCache, slot.address, 1);
            (*slot.address).set_state(state);
        }
        self.sat_list.append(&self.sat_pool, slot.index);
        let mapped = self.sat_map.add(cache.key as u32, slot.index);
        debug_assert!(mapped);
        unsafe {
            (*slot.address).touched = 1;
        }
    }

    fn sat_lookup_index(&self, b1: u32, b2: u32) -> u32 {
        let key = contact_key(b1, b2);
        let mut index = self.sat_map.first(key as u32);
        while index != MAP_NULL {
            let cache = unsafe { &*self.sat_pool.address(index) };
            if cache.key == key {
                return index;
            }
            index = self.sat_map.next(index);
        }
        NULL_INDEX
    }

    /// The pair's cache, or null. Marks nothing; touching is the
    /// caller's statement that the cache was used this frame.
    pub fn sat_cache_lookup(&self, b1: u32, b2: u32) -> *mut SatCache {
        let index = self.sat_lookup_index(b1.min(b2), b1.max(b2));
        if index == NULL_INDEX {
            core::ptr::null_mut()
        } else {
            self.sat_pool.address(index)
        }
    }

    /// Frame boundary: promote the frame's touched set to the
    /// persistent set (extending it over newly-introduced contacts) and
    /// sweep untouched SAT caches.
    pub fn end_frame(&mut self) {
        if !self.frame_usage.is_null() {
            debug_assert!(self.persistent_usage.block_count() == self.frame_usage.block_count());
            self.persistent_usage.copy_from(&self.frame_usage);
        }

        let count_max = self.contacts.pool().count_max() as u64;
        if self.persistent_usage.bit_count() < count_max {
            let low_bit = self.persistent_usage.bit_count();
            self.persistent_usage
                .grow(self.contacts.pool().length() as u64, false);
            // Contacts introduced past the old frame window are live.
            for bit in low_bit..count_max {
                self.persistent_usage.set(bit, true);
            }
        }

        let mut index = self.sat_list.first;
        while index != NULL_INDEX {
            let cache = self.sat_pool.address(index);
            let next = unsafe { (*cache).next() };
            unsafe {
                if (*cache).touched != 0 {
                    (*cache).touched = 0;
                } else {
                    let key = (*cache).key;
                    self.sat_list.remove(&self.sat_pool, index);
                    self.sat_map.remove(key as u32, index);
                    self.sat_pool.remove(index);
                }
            }
            index = next;
        }

        self.frame_usage.free();
    }

    /// Take the events recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<ContactEvent> {
        core::mem::take(&mut self.events)
    }

    /// Debug check: every persistent contact is allocated and findable
    /// from both of its bodies' chains, with consistent back links.
    pub fn validate(&self, bodies: &Pool<Body>) {
        for bit in 0..self.persistent_usage.bit_count() {
            if !self.persistent_usage.get(bit) {
                continue;
            }
            let index = bit as u32;
            assert!(self.contacts.allocated(index));
            let contact = unsafe { &*self.contacts.address(index) };
            let lo = contact_body_lo(contact.key);
            let hi = contact_body_hi(contact.key);
            self.validate_chain_contains(bodies, lo, index);
            self.validate_chain_contains(bodies, hi, index);
        }
    }

    fn validate_chain_contains(&self, bodies: &Pool<Body>, body_index: u32, target: u32) {
        let mut prev = NET_NULL;
        let mut cursor = unsafe { (*bodies.address(body_index)).first_contact };
        let mut found = false;
        while cursor != NET_NULL {
            if cursor == target {
                found = true;
                break;
            }
            let contact = unsafe { &*self.contacts.address(cursor) };
            assert!(self.contacts.allocated(cursor));
            let side = if contact_body_lo(contact.key) == body_index {
                0
            } else {
                debug_assert!(contact_body_hi(contact.key) == body_index);
                1
            };
            assert_eq!(prev, contact.links().prev[side]);
            prev = cursor;
            cursor = contact.links().next[side];
        }
        assert!(found, "contact missing from body chain");
    }
}

impl Drop for ContactDb {
    fn drop(&mut self) {
        self.free();
    }
}
