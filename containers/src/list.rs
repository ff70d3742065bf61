//! Intrusive singly- and doubly-linked lists over pool slots.
//!
//! The lists store only head/tail indices and a count; the links live
//! inside the pooled records, exposed through [`SllNode`] / [`DllNode`].
//! [`NULL_INDEX`] terminates chains; a removed DLL node gets its links
//! set to [`NOT_IN_LIST`], which is distinct from every valid index and
//! from the chain terminator so membership stays checkable.

use grit_mem::pool::{Pool, PoolSlot};

/// Chain terminator.
pub const NULL_INDEX: u32 = u32::MAX;

/// Marks a detached DLL node.
pub const NOT_IN_LIST: u32 = u32::MAX - 1;

/// Single link embedded in an SLL record.
pub trait SllNode {
    fn next(&self) -> u32;
    fn set_next(&mut self, next: u32);
}

/// Link pair embedded in a DLL record.
pub trait DllNode {
    fn prev(&self) -> u32;
    fn set_prev(&mut self, prev: u32);
    fn next(&self) -> u32;
    fn set_next(&mut self, next: u32);
}

/// Intrusive singly-linked list.
pub struct Sll {
    pub first: u32,
    pub last: u32,
    pub count: u32,
}

impl Sll {
    pub const fn new() -> Self {
        Self {
            first: NULL_INDEX,
            last: NULL_INDEX,
            count: 0,
        }
    }

    pub fn flush(&mut self) {
        *self = Self::new();
    }

    /// Link `index` in as the new head.
    pub fn push_front<T: PoolSlot + SllNode>(&mut self, pool: &Pool<T>, index: u32) {
        self.count += 1;
        unsafe {
            (*pool.address(index)).set_next(self.first);
        }
        self.first = index;
        if self.last == NULL_INDEX {
            self.last = index;
        }
    }

    /// Link `index` in as the new tail.
    pub fn push_back<T: PoolSlot + SllNode>(&mut self, pool: &Pool<T>, index: u32) {
        self.count += 1;
        if self.last == NULL_INDEX {
            self.first = index;
        } else {
            unsafe {
                (*pool.address(self.last)).set_next(index);
            }
        }
        self.last = index;
        unsafe {
            (*pool.address(index)).set_next(NULL_INDEX);
        }
    }
}

impl Default for Sll {
    fn default() -> Self {
        Self::new()
    }
}

/// Intrusive doubly-linked list.
pub struct Dll {
    pub first: u32,
    pub last: u32,
    pub count: u32,
}

impl Dll {
    pub const fn new() -> Self {
        Self {
            first: NULL_INDEX,
            last: NULL_INDEX,
            count: 0,
        }
    }

    pub fn flush(&mut self) {
        *self = Self::new();
    }

    /// Link `index` in as the new tail.
    pub fn append<T: PoolSlot + DllNode>(&mut self, pool: &Pool<T>, index: u32) {
        self.count += 1;
        unsafe {
            let node = pool.address(index);
            (*node).set_prev(self.last);
            (*node).set_next(NULL_INDEX);
        }

        if self.last == NULL_INDEX {
            self.first = index;
        } else {
            unsafe {
                (*pool.address(self.last)).set_next(index);
            }
        }
        self.last = index;
    }

    /// Link `index` in as the new head.
    pub fn prepend<T: PoolSlot + DllNode>(&mut self, pool: &Pool<T>, index: u32) {
        self.count += 1;
        unsafe {
            let node = pool.address(index);
            (*node).set_prev(NULL_INDEX);
            (*node).set_next(self.first);
        }

        if self.first == NULL_INDEX {
            self.last = index;
        } else {
            unsafe {
                (*pool.address(self.first)).set_prev(index);
            }
        }
        self.first = index;
    }

    /// Unlink `index`. Handles the only / first / middle / last cases
    /// and marks the node detached.
    pub fn remove<T: PoolSlot + DllNode>(&mut self, pool: &Pool<T>, index: u32) {
        debug_assert!(self.count > 0);
        self.count -= 1;

        let node = pool.address(index);
        let (node_prev, node_next) = unsafe { ((*node).prev(), (*node).next()) };

        if node_prev == NULL_INDEX {
            if node_next == NULL_INDEX {
                // only node
                self.first = NULL_INDEX;
                self.last = NULL_INDEX;
            } else {
                // first
                unsafe {
                    (*pool.address(node_next)).set_prev(NULL_INDEX);
                }
                self.first = node_next;
            }
        } else if node_next == NULL_INDEX {
            // last
            unsafe {
                (*pool.address(node_prev)).set_next(NULL_INDEX);
            }
            self.last = node_prev;
        } else {
            // in between
            unsafe {
                (*pool.address(node_prev)).set_next(node_next);
                (*pool.address(node_next)).set_prev(node_prev);
            }
        }

        unsafe {
            (*node).set_prev(NOT_IN_LIST);
            (*node).set_next(NOT_IN_LIST);
        }
    }

    /// Mark a record detached without touching the list.
    pub fn detach_slot<T: DllNode>(record: &mut T) {
        record.set_prev(NOT_IN_LIST);
        record.set_next(NOT_IN_LIST);
    }
}

impl Default for Dll {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        state: u32,
        prev: u32,
        next: u32,
    }

    impl PoolSlot for Node {
        fn state(&self) -> u32 {
            self.state
        }
        fn set_state(&mut self, state: u32) {
            self.state = state;
        }
    }

    impl SllNode for Node {
        fn next(&self) -> u32 {
            self.next
        }
        fn set_next(&mut self, next: u32) {
            self.next = next;
        }
    }

    impl DllNode for Node {
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

    fn pool_with(count: u32) -> Pool<Node> {
        let mut pool: Pool<Node> = Pool::alloc(None, count.max(8), false);
        for _ in 0..count {
            assert!(!pool.add().is_null());
        }
        pool
    }

    fn forward<T: PoolSlot + DllNode>(dll: &Dll, pool: &Pool<T>) -> Vec<u32> {
        let mut order = Vec::new();
        let mut cursor = dll.first;
        while cursor != NULL_INDEX {
            order.push(cursor);
            cursor = unsafe { (*pool.address(cursor)).next() };
        }
        order
    }

    fn backward<T: PoolSlot + DllNode>(dll: &Dll, pool: &Pool<T>) -> Vec<u32> {
        let mut order = Vec::new();
        let mut cursor = dll.last;
        while cursor != NULL_INDEX {
            order.push(cursor);
            cursor = unsafe { (*pool.address(cursor)).prev() };
        }
        order
    }

    #[test]
    fn test_sll_push_front_and_back() {
        let pool = pool_with(3);
        let mut sll = Sll::new();
        sll.push_back(&pool, 0);
        sll.push_back(&pool, 1);
        sll.push_front(&pool, 2);
        assert_eq!(sll.count, 3);
        assert_eq!(sll.first, 2);
        assert_eq!(sll.last, 1);

        let mut order = Vec::new();
        let mut cursor = sll.first;
        while cursor != NULL_INDEX {
            order.push(cursor);
            cursor = unsafe { SllNode::next(&*pool.address(cursor)) };
        }
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn test_dll_append_prepend_order() {
        let pool = pool_with(4);
        let mut dll = Dll::new();
        dll.append(&pool, 0);
        dll.append(&pool, 1);
        dll.prepend(&pool, 2);
        dll.append(&pool, 3);

        assert_eq!(forward(&dll, &pool), vec![2, 0, 1, 3]);
        let mut reversed = backward(&dll, &pool);
        reversed.reverse();
        assert_eq!(reversed, vec![2, 0, 1, 3]);
        assert_eq!(dll.count, 4);
    }

    #[test]
    fn test_dll_remove_cases() {
        let pool = pool_with(4);
        let mut dll = Dll::new();
        for i in 0..4 {
            dll.append(&pool, i);
        }

        // middle
        dll.remove(&pool, 1);
        assert_eq!(forward(&dll, &pool), vec![0, 2, 3]);
        // first
        dll.remove(&pool, 0);
        assert_eq!(forward(&dll, &pool), vec![2, 3]);
        // last
        dll.remove(&pool, 3);
        assert_eq!(forward(&dll, &pool), vec![2]);
        // only
        dll.remove(&pool, 2);
        assert_eq!(forward(&dll, &pool), Vec::<u32>::new());
        assert_eq!(dll.count, 0);
        assert_eq!(dll.first, NULL_INDEX);
        assert_eq!(dll.last, NULL_INDEX);

        // Detached nodes carry the reserved marker.
        let node = unsafe { &*pool.address(1) };
        assert_eq!(DllNode::prev(node), NOT_IN_LIST);
        assert_eq!(DllNode::next(node), NOT_IN_LIST);
    }

    #[test]
    fn test_dll_traversals_agree() {
        let pool = pool_with(6);
        let mut dll = Dll::new();
        for i in [5, 1, 4, 2] {
            dll.append(&pool, i);
        }
        let fwd = forward(&dll, &pool);
        let mut bwd = backward(&dll, &pool);
        bwd.reverse();
        assert_eq!(fwd, bwd);
        assert_eq!(fwd.len() as u32, dll.count);
    }
}
