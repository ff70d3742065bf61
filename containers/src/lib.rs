//! Intrusive index-based containers over the pool allocators.
//!
//! Nodes never hold pointers — links are `u32` indices into a pool, so
//! the pool owns every record and the containers own only indices.
//! That keeps records compact and sidesteps ownership cycles entirely.

pub mod hierarchy;
pub mod index_map;
pub mod list;
pub mod net_list;

pub use hierarchy::{HI_NULL, HI_ORPHAN_STUB, HI_ROOT_STUB, Hierarchy, HierarchyIter, HierarchyNode};
pub use index_map::{IndexMap, MAP_NULL};
pub use list::{Dll, DllNode, NOT_IN_LIST, NULL_INDEX, Sll, SllNode};
pub use net_list::{NET_NULL, NetLinks, NetList, NetNode, PeerSide};
