//! Global Descriptor Table and Task State Segment
//!
//! Fixed selector layout the rest of the kernel hard-codes into saved
//! frames:
//!
//! - 0x00: null descriptor
//! - 0x08: kernel code (ring 0)
//! - 0x10: kernel data (ring 0)
//! - 0x18: user code (0x1B with RPL 3)
//! - 0x20: user data (0x23 with RPL 3)
//! - 0x28: TSS (64-bit descriptor, occupies two slots)
//!
//! The TSS carries one meaningful dynamic field: the ring-0 stack pointer
//! (RSP0) the CPU loads when an interrupt arrives from ring 3. The scheduler
//! repoints it at the incoming task's kernel stack on every switch. The
//! I/O-map base points past the structure, disabling the I/O bitmap.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// Selector values as u16, for building saved register frames.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Boot-time RSP0: used until the scheduler starts repointing it at
        // task kernel stacks. Must be 16-byte aligned for the x86_64 ABI.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            #[allow(dead_code)] // alignment wrapper, accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut BOOT_RSP0_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const BOOT_RSP0_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };

        // Separate stack for double faults so a corrupt RSP cannot take the
        // fault path down with it.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            #[allow(dead_code)] // alignment wrapper, accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const DOUBLE_FAULT_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        let user_code_selector = gdt.append(Descriptor::user_code_segment()); // 0x18 (0x1B)
        let user_data_selector = gdt.append(Descriptor::user_data_segment()); // 0x20 (0x23)
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS)); // 0x28, two slots
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_code_selector,
                user_data_selector,
                tss_selector,
            },
        )
    };
}

pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

/// Load the GDT, reload the segment registers, and load the TSS.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors come from the GDT that was just loaded, so every
    // set_reg references a valid descriptor.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
    log::info!(target: "gdt", "descriptor tables loaded, TSS at selector 0x28");
}

/// Selectors for kernel and user mode. Valid after `init()`.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Repoint the TSS ring-0 stack (RSP0) at `stack_top`.
///
/// Called on every context switch so interrupts from ring 3 land on the
/// running task's kernel stack. Must be called with interrupts disabled.
#[cfg(target_os = "none")]
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: the TSS is a boot-initialized static; this runs only with
    // interrupts disabled on the single CPU, so no concurrent access exists.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Current TSS ring-0 stack pointer.
#[cfg(target_os = "none")]
pub fn kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}

// Host shadow of RSP0 so the scheduler's update path stays observable (and
// race-free) in unit tests.
#[cfg(not(target_os = "none"))]
static RSP0_SHADOW: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

#[cfg(not(target_os = "none"))]
pub fn set_kernel_stack(stack_top: u64) {
    RSP0_SHADOW.store(stack_top, core::sync::atomic::Ordering::Relaxed);
}

#[cfg(not(target_os = "none"))]
pub fn kernel_stack() -> u64 {
    RSP0_SHADOW.load(core::sync::atomic::Ordering::Relaxed)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn selector_layout_matches_contract() {
        let s = selectors();
        assert_eq!(s.code_selector.0, KERNEL_CODE_SELECTOR);
        assert_eq!(s.data_selector.0, KERNEL_DATA_SELECTOR);
        // User selectors carry RPL 3
        assert_eq!(s.user_code_selector.0 | 3, USER_CODE_SELECTOR);
        assert_eq!(s.user_data_selector.0 | 3, USER_DATA_SELECTOR);
        assert_eq!(s.tss_selector.0 & !7, 0x28);
    }

}
