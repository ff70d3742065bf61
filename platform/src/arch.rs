//! CPU and system probing: cpuid, feature flags, core count, page size.
//!
//! All values are read-only after process start; callers may cache them
//! freely. On non-x86_64 targets the cpuid wrappers return zeros and the
//! feature set is empty, which downstream code treats as "no usable TSC".

use grit_lib::log::SystemTag;
use grit_lib::log_warning;

/// Upper bound on cache line size across supported targets. Padding and
/// alignment throughout the workspace use this value.
pub const CACHE_LINE: usize = 64;

/// Execute CPUID with the given leaf (subleaf 0).
/// Returns `(eax, ebx, ecx, edx)`, or zeros when the leaf is unsupported.
#[cfg(target_arch = "x86_64")]
pub fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    if !leaf_supported(leaf) {
        return (0, 0, 0, 0);
    }
    let res = core::arch::x86_64::__cpuid(leaf);
    (res.eax, res.ebx, res.ecx, res.edx)
}

/// Execute CPUID with a specific leaf **and subleaf** (ECX).
/// Returns `(eax, ebx, ecx, edx)`, or zeros when the leaf is unsupported.
#[cfg(target_arch = "x86_64")]
pub fn cpuid_count(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    if !leaf_supported(leaf) {
        return (0, 0, 0, 0);
    }
    let res = core::arch::x86_64::__cpuid_count(leaf, subleaf);
    (res.eax, res.ebx, res.ecx, res.edx)
}

/// A leaf is supported when it does not exceed the highest leaf of its
/// range (basic or extended).
#[cfg(target_arch = "x86_64")]
fn leaf_supported(leaf: u32) -> bool {
    let range_base = leaf & 0x8000_0000;
    let max_leaf = core::arch::x86_64::__cpuid(range_base).eax;
    leaf <= max_leaf
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid(_leaf: u32) -> (u32, u32, u32, u32) {
    (0, 0, 0, 0)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid_count(_leaf: u32, _subleaf: u32) -> (u32, u32, u32, u32) {
    (0, 0, 0, 0)
}

/// Extended function information (RDTSCP, long mode).
pub const CPUID_LEAF_EXT_INFO: u32 = 0x8000_0001;

/// Advanced power management / invariant TSC.
pub const CPUID_LEAF_EXT_POWER: u32 = 0x8000_0007;

/// RDTSCP instruction support (leaf 0x8000_0001 EDX).
pub const CPUID_EXT_EDX_RDTSCP: u32 = 1 << 27;

/// Invariant TSC: constant rate across P-/C-state transitions
/// (leaf 0x8000_0007 EDX).
pub const CPUID_EXT_POWER_EDX_INVARIANT_TSC: u32 = 1 << 8;

bitflags::bitflags! {
    /// Hardware capabilities the timer subsystem keys off.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        const RDTSCP = 1 << 0;
        const INVARIANT_TSC = 1 << 1;
    }
}

/// Probe the feature set once; the result never changes at runtime.
pub fn cpu_features() -> CpuFeatures {
    let mut features = CpuFeatures::empty();

    let (_, _, _, edx) = cpuid(CPUID_LEAF_EXT_INFO);
    if edx & CPUID_EXT_EDX_RDTSCP != 0 {
        features |= CpuFeatures::RDTSCP;
    }

    let (_, _, _, edx) = cpuid(CPUID_LEAF_EXT_POWER);
    if edx & CPUID_EXT_POWER_EDX_INVARIANT_TSC != 0 {
        features |= CpuFeatures::INVARIANT_TSC;
    }

    features
}

/// Number of logical cores currently online. Falls back to 2 with a
/// logged warning when the query fails.
pub fn logical_core_count() -> u32 {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count < 1 {
        log_warning!(
            SystemTag::System,
            "failed to retrieve number of logical cores, defaulting to 2"
        );
        return 2;
    }
    count as u32
}

/// System page size in bytes.
pub fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(size > 0);
    size as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(grit_lib::power_of_two_check(size));
        assert!(size >= 4096);
    }

    #[test]
    fn test_logical_core_count_nonzero() {
        assert!(logical_core_count() >= 1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_cpuid_vendor_leaf() {
        // Leaf 0 is always supported and reports the max basic leaf in eax.
        let (eax, ebx, ecx, edx) = cpuid(0);
        assert!(eax > 0);
        assert!(ebx != 0 || ecx != 0 || edx != 0);
    }
}
