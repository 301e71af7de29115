//! Multiboot2 boot handoff
//!
//! The loader has already switched to long mode and installed initial page
//! tables covering the kernel image, a 4 MiB identity map, and the
//! higher-half direct map of physical memory at
//! [`DIRECT_MAP_BASE`](crate::mm::DIRECT_MAP_BASE) (which the paging engine
//! relies on from its first table write). Entry is at `_start` with the
//! multiboot magic in EAX and the info pointer in EBX. RAM is taken as a
//! fixed 512 MiB in this revision.

use core::arch::global_asm;

use crate::mm::PhysicalAddress;

/// Magic value the loader leaves in EAX for multiboot2.
pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36d7_6289;

/// RAM size assumed at boot.
pub const TOTAL_MEMORY: u64 = 512 * 1024 * 1024;

global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8

multiboot_header_start:
    .long 0xe85250d6                // magic number
    .long 0                         // architecture (0 = i386/x86)
    .long multiboot_header_end - multiboot_header_start  // header length

    // checksum
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))

    // End tag
    .word 0                         // type
    .word 0                         // flags
    .long 8                         // size
multiboot_header_end:
"#
);

extern "C" {
    /// End of the kernel image, provided by the linker script.
    static __kernel_end: u8;
}

/// First byte past the kernel image, as a physical address.
pub fn kernel_end() -> PhysicalAddress {
    // SAFETY: the linker defines the symbol; only its address is taken.
    let end = unsafe { &__kernel_end as *const u8 as u64 };
    // The image is linked in the higher half; strip the direct-map offset
    // if present to get the physical location.
    PhysicalAddress::new(end.wrapping_sub(crate::mm::DIRECT_MAP_BASE).min(end))
}

/// Verify the loader's magic. A wrong value means we were started by
/// something that did not follow the multiboot2 handoff; nothing below is
/// trustworthy, so refuse to continue.
pub fn check_magic(magic: u32) {
    if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
        panic!("invalid multiboot2 magic: {:#x}", magic);
    }
}
