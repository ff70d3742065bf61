//! Page-granular virtual memory.
//!
//! Every allocation is an anonymous private mapping rounded up to whole
//! pages and described by a [`MemSlot`]. The slot is the ticket for any
//! later [`remap`] or [`release`]; its fields are owned by whoever made
//! the allocation.
//!
//! [`double_map`] builds the aliased pair of views the ring allocator
//! needs: one physical region mapped twice back-to-back, so a write at
//! offset `i` is visible at `i + size` and contiguous reads never have
//! to handle wrap.

use grit_lib::log::SystemTag;
use grit_lib::{align_up_u64, fatal_cleanup_and_exit, log_error, log_fatal};

use crate::arch::page_size;

/// An owned page-aligned region. An empty slot has a null `address` and
/// zero `size`.
#[derive(Clone, Copy, Debug)]
pub struct MemSlot {
    pub address: *mut u8,
    pub size: u64,
    pub huge_pages: bool,
}

// SAFETY: a MemSlot is a plain description of an owned mapping; the
// mapping itself has no thread affinity.
unsafe impl Send for MemSlot {}

impl MemSlot {
    pub const fn empty() -> Self {
        Self {
            address: core::ptr::null_mut(),
            size: 0,
            huge_pages: false,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }
}

impl Default for MemSlot {
    fn default() -> Self {
        Self::empty()
    }
}

fn round_to_pages(size: u64) -> u64 {
    align_up_u64(size, page_size())
}

/// Reserve at least `size` bytes of zero-filled page-aligned memory.
///
/// When `huge_pages` is set the kernel is advised (not required) to back
/// the region with huge pages. Returns an empty slot on failure.
pub fn reserve(size: u64, huge_pages: bool) -> MemSlot {
    debug_assert!(size > 0);

    let size_used = round_to_pages(size);
    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size_used as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        log_error!(
            SystemTag::Memory,
            "mmap of {} bytes failed: {}",
            size_used,
            std::io::Error::last_os_error()
        );
        return MemSlot::empty();
    }

    if huge_pages {
        unsafe {
            libc::madvise(addr, size_used as usize, libc::MADV_HUGEPAGE);
        }
    }

    debug_assert!(addr as u64 % page_size() == 0);

    MemSlot {
        address: addr as *mut u8,
        size: size_used,
        huge_pages,
    }
}

/// Grow a slot to at least `size` bytes, in place when possible.
///
/// Huge-page slots are re-reserved and copied so the kernel re-applies
/// the page policy to the whole region. Failure is fatal: growth is only
/// requested by allocators that cannot continue without it.
pub fn remap(slot: &mut MemSlot, size: u64) -> *mut u8 {
    debug_assert!(size > slot.size);

    if slot.huge_pages {
        let new_slot = reserve(size, true);
        if !new_slot.is_null() {
            unsafe {
                core::ptr::copy_nonoverlapping(slot.address, new_slot.address, slot.size as usize);
            }
        }
        release(slot);
        *slot = new_slot;
    } else {
        let size_used = round_to_pages(size);
        let addr = unsafe {
            libc::mremap(
                slot.address as *mut libc::c_void,
                slot.size as usize,
                size_used as usize,
                libc::MREMAP_MAYMOVE,
            )
        };
        slot.address = if addr == libc::MAP_FAILED {
            core::ptr::null_mut()
        } else {
            addr as *mut u8
        };
        slot.size = size_used;
    }

    if slot.is_null() {
        log_fatal!(SystemTag::Memory, "failed to remap memory slot, exiting");
        fatal_cleanup_and_exit();
    }

    slot.address
}

/// Return a slot's pages to the OS and clear it.
pub fn release(slot: &mut MemSlot) {
    if !slot.is_null() {
        unsafe {
            libc::munmap(slot.address as *mut libc::c_void, slot.size as usize);
        }
    }
    slot.address = core::ptr::null_mut();
    slot.size = 0;
    slot.huge_pages = false;
}

/// One physical region of `size` bytes mapped at `base` and again at
/// `base + size`.
#[derive(Debug)]
pub struct DoubleMapped {
    pub base: *mut u8,
    pub size: u64,
}

unsafe impl Send for DoubleMapped {}

/// Create the double mapping backing a ring of at least `size_hint`
/// bytes (rounded up to whole pages). Returns `None` on failure.
///
/// A memfd provides the shared physical pages; the two views are bound
/// over a single reservation so they stay adjacent.
pub fn double_map(size_hint: u64) -> Option<DoubleMapped> {
    debug_assert!(size_hint > 0);
    let size = round_to_pages(size_hint);

    let reservation = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            (size << 1) as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if reservation == libc::MAP_FAILED {
        log_error!(
            SystemTag::Memory,
            "failed to reserve ring region: {}",
            std::io::Error::last_os_error()
        );
        return None;
    }

    let fd = unsafe { libc::memfd_create(c"grit-ring".as_ptr(), 0) };
    if fd < 0 {
        log_error!(
            SystemTag::Memory,
            "memfd_create failed: {}",
            std::io::Error::last_os_error()
        );
        unsafe { libc::munmap(reservation, (size << 1) as usize) };
        return None;
    }

    let mut ok = unsafe { libc::ftruncate(fd, size as libc::off_t) } == 0;

    let base = reservation as *mut u8;
    for view in 0..2u64 {
        if !ok {
            break;
        }
        let view_addr = unsafe {
            libc::mmap(
                base.add((view * size) as usize) as *mut libc::c_void,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        ok = view_addr != libc::MAP_FAILED;
    }

    unsafe { libc::close(fd) };

    if !ok {
        log_error!(
            SystemTag::Memory,
            "failed to bind ring views: {}",
            std::io::Error::last_os_error()
        );
        unsafe { libc::munmap(reservation, (size << 1) as usize) };
        return None;
    }

    unsafe {
        libc::madvise(reservation, (size << 1) as usize, libc::MADV_WILLNEED);
    }

    Some(DoubleMapped { base, size })
}

/// Unmap both views and clear the descriptor.
pub fn double_unmap(map: &mut DoubleMapped) {
    if !map.base.is_null() {
        let status = unsafe {
            libc::munmap(map.base as *mut libc::c_void, (map.size << 1) as usize)
        };
        if status == -1 {
            log_error!(
                SystemTag::Memory,
                "failed to unmap ring region: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    map.base = core::ptr::null_mut();
    map.size = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_release() {
        let mut slot = reserve(100, false);
        assert!(!slot.is_null());
        assert!(slot.size >= 100);
        assert_eq!(slot.size % page_size(), 0);
        unsafe {
            slot.address.write(0xAB);
            assert_eq!(slot.address.read(), 0xAB);
        }
        release(&mut slot);
        assert!(slot.is_null());
        assert_eq!(slot.size, 0);
    }

    #[test]
    fn test_reserve_zero_filled() {
        let mut slot = reserve(page_size(), false);
        assert!(!slot.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(slot.address, slot.size as usize) };
        assert!(bytes.iter().all(|&b| b == 0));
        release(&mut slot);
    }

    #[test]
    fn test_remap_preserves_contents() {
        let mut slot = reserve(page_size(), false);
        unsafe { slot.address.write_bytes(0x5A, page_size() as usize) };
        let old_size = slot.size;
        remap(&mut slot, old_size * 4);
        assert!(slot.size >= old_size * 4);
        let bytes = unsafe { core::slice::from_raw_parts(slot.address, old_size as usize) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        release(&mut slot);
    }

    #[test]
    fn test_double_map_aliases() {
        let mut map = double_map(page_size()).expect("double map");
        unsafe {
            map.base.write(0xC3);
            assert_eq!(map.base.add(map.size as usize).read(), 0xC3);
            map.base.add(map.size as usize + 1).write(0x7E);
            assert_eq!(map.base.add(1).read(), 0x7E);
        }
        double_unmap(&mut map);
        assert!(map.base.is_null());
    }
}
