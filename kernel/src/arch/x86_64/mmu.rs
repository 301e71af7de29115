//! Control-register and TLB primitives
//!
//! Thin wrappers over the `x86_64` crate. On the host (unit tests) these
//! are no-ops so the paging and scheduler logic above them stays testable.

use crate::mm::{PhysicalAddress, VirtualAddress};

/// Read the current translation root (CR3).
#[cfg(target_os = "none")]
pub fn read_cr3() -> PhysicalAddress {
    use x86_64::registers::control::Cr3;
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64())
}

/// Install a new translation root. Implicitly flushes the non-global TLB.
#[cfg(target_os = "none")]
pub fn write_cr3(root: PhysicalAddress) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    // SAFETY: the caller supplies a frame holding a valid root table whose
    // kernel half covers the currently executing code, so execution
    // continues across the switch.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(root.as_u64())),
            Cr3Flags::empty(),
        );
    }
}

/// Invalidate the TLB entry for one virtual address.
#[cfg(target_os = "none")]
pub fn invlpg(virt: VirtualAddress) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
}

/// Faulting address of the most recent page fault (CR2).
#[cfg(target_os = "none")]
pub fn read_cr2() -> u64 {
    use x86_64::registers::control::Cr2;
    Cr2::read_raw()
}

// Host stubs: keep the callers (paging engine, scheduler) compilable and
// testable off-target.

#[cfg(not(target_os = "none"))]
pub fn read_cr3() -> PhysicalAddress {
    PhysicalAddress::new(0)
}

#[cfg(not(target_os = "none"))]
pub fn write_cr3(_root: PhysicalAddress) {}

#[cfg(not(target_os = "none"))]
pub fn invlpg(_virt: VirtualAddress) {}

#[cfg(not(target_os = "none"))]
pub fn read_cr2() -> u64 {
    0
}
