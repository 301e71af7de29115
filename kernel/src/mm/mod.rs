//! Memory management
//!
//! Three layers, initialized in order at boot: the physical frame allocator
//! ([`frame`]), the paging engine ([`paging`]), and the kernel heap
//! ([`heap`]). The kernel image and the first 4 MiB identity map live in
//! every address space's upper/lower halves respectively; everything the
//! kernel touches by physical address goes through the direct map.

pub mod frame;
pub mod heap;
pub mod paging;

use bitflags::bitflags;

/// Size of a physical frame / virtual page (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Base of the kernel's direct physical-memory map. Every physical address
/// `p` is reachable at virtual address `p + DIRECT_MAP_BASE`.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Physical load address of the kernel image (1 MiB).
pub const KERNEL_PHYSICAL_START: u64 = 0x10_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Frame number containing this address
    pub const fn frame_index(&self) -> u64 {
        self.0 / PAGE_SIZE as u64
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }

    /// True for addresses in the canonical lower half (user space).
    pub const fn is_lower_half(&self) -> bool {
        self.0 < 0x0000_8000_0000_0000
    }
}

/// Round a byte count up to whole pages.
pub const fn bytes_to_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Round an address up to the next page boundary.
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Translate a physical address into the kernel's direct map.
pub const fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress(phys.0 + DIRECT_MAP_BASE)
}

bitflags! {
    /// Page table entry flags (x86_64)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// Flag policy for kernel mappings.
    pub const fn kernel() -> Self {
        Self::PRESENT.union(Self::WRITABLE)
    }

    /// Flag policy for user mappings.
    pub const fn user() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER)
    }
}

/// Snapshot of physical memory usage.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_memory: u64,
    pub free_memory: u64,
    pub total_pages: usize,
    pub used_pages: usize,
    pub free_pages: usize,
}

/// Collect a snapshot of the frame allocator's counters.
pub fn stats() -> MemoryStats {
    crate::arch::without_interrupts(|| {
        let fa = frame::FRAME_ALLOCATOR.lock();
        MemoryStats {
            total_memory: (fa.total_frames() * PAGE_SIZE) as u64,
            free_memory: (fa.free_frames() * PAGE_SIZE) as u64,
            total_pages: fa.total_frames(),
            used_pages: fa.used_frames(),
            free_pages: fa.free_frames(),
        }
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn address_alignment() {
        let v = VirtualAddress::new(0x1234);
        assert_eq!(v.align_down().as_u64(), 0x1000);
        assert_eq!(v.page_offset(), 0x234);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x2000), 0x2000);
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn lower_half_boundary() {
        assert!(VirtualAddress::new(0x7FFF_FFFF_FFFF).is_lower_half());
        assert!(!VirtualAddress::new(0xFFFF_8000_0000_0000).is_lower_half());
        assert!(VirtualAddress::new(0x80_0000_0000).is_lower_half());
    }

    #[test]
    fn direct_map_translation() {
        let p = PhysicalAddress::new(0x5000);
        assert_eq!(phys_to_virt(p).as_u64(), DIRECT_MAP_BASE + 0x5000);
    }

    #[test]
    fn flag_policies() {
        assert!(PageFlags::kernel().contains(PageFlags::PRESENT | PageFlags::WRITABLE));
        assert!(!PageFlags::kernel().contains(PageFlags::USER));
        assert!(PageFlags::user().contains(PageFlags::USER));
    }
}
