//! Net list: intrusive nodes that belong to two chains at once.
//!
//! Each node carries two `(prev, next)` pairs — one per membership
//! axis. The canonical use is a physics contact that sits on both
//! bodies' contact lists: side 0 chains on the lower-numbered body,
//! side 1 on the higher. Because a neighbour may hold us on *either* of
//! its own sides, the caller supplies two resolution functions that
//! answer "which side of this peer points back at the given node".
//!
//! Index 0 is a dummy node allocated at init whose links all point to
//! itself-as-null; link patches through [`NET_NULL`] land there
//! harmlessly, which removes every null branch from add/remove.

use grit_lib::log::SystemTag;
use grit_lib::{fatal_cleanup_and_exit, log_fatal};

use grit_mem::arena::Arena;
use grit_mem::pool::{Pool, PoolSlot, Slot, slot_allocated};

/// The dummy node's index; doubles as the empty-chain sentinel.
pub const NET_NULL: u32 = 0;

/// The two link pairs embedded in a net-list record.
#[derive(Clone, Copy, Debug)]
pub struct NetLinks {
    pub next: [u32; 2],
    pub prev: [u32; 2],
}

impl NetLinks {
    pub const fn detached() -> Self {
        Self {
            next: [NET_NULL; 2],
            prev: [NET_NULL; 2],
        }
    }
}

/// Access to the embedded link pairs.
pub trait NetNode: PoolSlot {
    fn links(&self) -> &NetLinks;
    fn links_mut(&mut self) -> &mut NetLinks;
}

/// Given a node and one of its sides, returns which side of the peer
/// (reached through that side's link) points back at the node.
pub type PeerSide<T> = fn(&NetList<T>, &T, u32) -> u32;

pub struct NetList<T: NetNode> {
    pool: Pool<T>,
    side_in_prev: PeerSide<T>,
    side_in_next: PeerSide<T>,
}

impl<T: NetNode> NetList<T> {
    /// Allocate a net list with room for `length` nodes (one of which
    /// is the dummy). Fatal when the pool cannot be created.
    pub fn alloc(
        mem: Option<&mut Arena>,
        length: u32,
        growable: bool,
        side_in_prev: PeerSide<T>,
        side_in_next: PeerSide<T>,
    ) -> Self {
        debug_assert!(length > 0);

        let mut net = Self {
            pool: Pool::alloc(mem, length, growable),
            side_in_prev,
            side_in_next,
        };

        if net.pool.length() == 0 {
            log_fatal!(SystemTag::Memory, "failed to allocate net list");
            fatal_cleanup_and_exit();
        }

        net.reserve_dummy();
        net
    }

    fn reserve_dummy(&mut self) {
        let slot = self.pool.add();
        debug_assert!(slot.index == NET_NULL);
        unsafe {
            *(*slot.address).links_mut() = NetLinks::detached();
        }
    }

    /// Drop every node and re-seat the dummy.
    pub fn flush(&mut self) {
        self.pool.flush();
        self.reserve_dummy();
    }

    pub fn dealloc(&mut self) {
        self.pool.dealloc();
    }

    #[inline]
    pub fn pool(&self) -> &Pool<T> {
        &self.pool
    }

    #[inline]
    pub fn address(&self, index: u32) -> *mut T {
        self.pool.address(index)
    }

    #[inline]
    pub fn index(&self, record: *const T) -> u32 {
        self.pool.index(record)
    }

    #[inline]
    pub fn allocated(&self, index: u32) -> bool {
        slot_allocated(unsafe { &*self.pool.address(index) })
    }

    /// Insert a copy of `data` as the new head of both target chains.
    /// `next_0` / `next_1` are the previous heads (or [`NET_NULL`]).
    /// Returns a null slot when the pool is full and not growable.
    pub fn add(&mut self, data: &T, next_0: u32, next_1: u32) -> Slot<T> {
        let slot = self.pool.add();
        if slot.is_null() {
            return slot;
        }

        unsafe {
            // The record's pool state word survives the payload copy.
            let state = (*slot.address).state();
            core::ptr::copy_nonoverlapping(data as *const T, slot.address, 1);
            (*slot.address).set_state(state);

            let links = (*slot.address).links_mut();
            links.next = [next_0, next_1];
            links.prev = [NET_NULL, NET_NULL];
        }

        for side in 0..2u32 {
            let next = if side == 0 { next_0 } else { next_1 };
            let peer_side = (self.side_in_next)(self, unsafe { &*slot.address }, side);
            let peer = self.pool.address(next);
            unsafe {
                debug_assert!(
                    next == NET_NULL || (*peer).links().prev[peer_side as usize] == NET_NULL,
                    "the next node must be the null node or a chain head with no predecessor"
                );
                (*peer).links_mut().prev[peer_side as usize] = slot.index;
            }
        }

        slot
    }

    /// Unlink `index` from both chains and free the node.
    pub fn remove(&mut self, index: u32) {
        debug_assert!(index != NET_NULL);

        let node = self.pool.address(index);
        let links = unsafe { *(*node).links() };

        let side_prev_0 = (self.side_in_prev)(self, unsafe { &*node }, 0) as usize;
        let side_prev_1 = (self.side_in_prev)(self, unsafe { &*node }, 1) as usize;
        let side_next_0 = (self.side_in_next)(self, unsafe { &*node }, 0) as usize;
        let side_next_1 = (self.side_in_next)(self, unsafe { &*node }, 1) as usize;

        let prev_0 = self.pool.address(links.prev[0]);
        let prev_1 = self.pool.address(links.prev[1]);
        let next_0 = self.pool.address(links.next[0]);
        let next_1 = self.pool.address(links.next[1]);

        unsafe {
            debug_assert!(
                links.prev[0] == NET_NULL || (*prev_0).links().next[side_prev_0] == index
            );
            debug_assert!(
                links.prev[1] == NET_NULL || (*prev_1).links().next[side_prev_1] == index
            );
            debug_assert!(
                links.next[0] == NET_NULL || (*next_0).links().prev[side_next_0] == index
            );
            debug_assert!(
                links.next[1] == NET_NULL || (*next_1).links().prev[side_next_1] == index
            );

            (*prev_0).links_mut().next[side_prev_0] = links.next[0];
            (*prev_1).links_mut().next[side_prev_1] = links.next[1];
            (*next_0).links_mut().prev[side_next_0] = links.prev[0];
            (*next_1).links_mut().prev[side_next_1] = links.prev[1];
        }

        self.pool.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal two-axis membership: each node belongs to one chain per
    // axis, identified by `owner[axis]`; peers resolve sides by owner.
    #[repr(C)]
    struct TestNode {
        state: u32,
        links: NetLinks,
        owner: [u32; 2],
    }

    impl PoolSlot for TestNode {
        fn state(&self) -> u32 {
            self.state
        }
        fn set_state(&mut self, state: u32) {
            self.state = state;
        }
    }

    impl NetNode for TestNode {
        fn links(&self) -> &NetLinks {
            &self.links
        }
        fn links_mut(&mut self) -> &mut NetLinks {
            &mut self.links
        }
    }

    fn side_in_prev(list: &NetList<TestNode>, node: &TestNode, side: u32) -> u32 {
        let owner = node.owner[side as usize];
        let peer_index = node.links().prev[side as usize];
        let peer = unsafe { &*list.address(peer_index) };
        if peer.owner[0] == owner { 0 } else { 1 }
    }

    fn side_in_next(list: &NetList<TestNode>, node: &TestNode, side: u32) -> u32 {
        let owner = node.owner[side as usize];
        let peer_index = node.links().next[side as usize];
        let peer = unsafe { &*list.address(peer_index) };
        if peer.owner[0] == owner { 0 } else { 1 }
    }

    fn node(owner_0: u32, owner_1: u32) -> TestNode {
        TestNode {
            state: 0,
            links: NetLinks::detached(),
            owner: [owner_0, owner_1],
        }
    }

    fn chain(list: &NetList<TestNode>, head: u32, owner: u32) -> Vec<u32> {
        let mut order = Vec::new();
        let mut cursor = head;
        while cursor != NET_NULL {
            let record = unsafe { &*list.address(cursor) };
            order.push(cursor);
            let side = if record.owner[0] == owner { 0 } else { 1 };
            cursor = record.links().next[side];
        }
        order
    }

    #[test]
    fn test_add_links_two_chains() {
        let mut list = NetList::alloc(None, 16, false, side_in_prev, side_in_next);

        // Owners: node a belongs to chains (1, 2); b to (1, 3).
        let a = list.add(&node(1, 2), NET_NULL, NET_NULL);
        assert_eq!(a.index, 1);
        let b = list.add(&node(1, 3), a.index, NET_NULL);
        assert!(!b.is_null());

        // Chain of owner 1 now runs b -> a (heads prepend).
        assert_eq!(chain(&list, b.index, 1), vec![b.index, a.index]);
        assert_eq!(chain(&list, b.index, 3), vec![b.index]);
        assert_eq!(chain(&list, a.index, 2), vec![a.index]);
        list.dealloc();
    }

    #[test]
    fn test_remove_middle_of_shared_chain() {
        let mut list = NetList::alloc(None, 16, false, side_in_prev, side_in_next);

        let a = list.add(&node(1, 2), NET_NULL, NET_NULL).index;
        let b = list.add(&node(1, 3), a, NET_NULL).index;
        let c = list.add(&node(1, 4), b, NET_NULL).index;
        assert_eq!(chain(&list, c, 1), vec![c, b, a]);

        list.remove(b);
        assert_eq!(chain(&list, c, 1), vec![c, a]);
        assert!(!list.allocated(b));

        // Recycled slot rejoins cleanly.
        let d = list.add(&node(1, 5), c, NET_NULL).index;
        assert_eq!(d, b);
        assert_eq!(chain(&list, d, 1), vec![d, c, a]);
        list.dealloc();
    }

    #[test]
    fn test_flush_reseats_dummy() {
        let mut list = NetList::alloc(None, 8, false, side_in_prev, side_in_next);
        list.add(&node(1, 2), NET_NULL, NET_NULL);
        list.flush();
        assert_eq!(list.pool().count(), 1);
        let first = list.add(&node(7, 8), NET_NULL, NET_NULL);
        assert_eq!(first.index, 1);
        list.dealloc();
    }
}
