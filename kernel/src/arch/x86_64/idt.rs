//! Interrupt Descriptor Table
//!
//! 256 gates. Exceptions and IRQs use ring-0 interrupt gates; the syscall
//! gate at 0x80 is reachable from ring 3. Every installed gate points at the
//! matching trampoline in [`super::interrupts`], which builds the uniform
//! register frame before dispatching.

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::interrupts::*;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // SAFETY: every address handed to set_handler_addr is a naked
        // trampoline with the interrupt-entry ABI (it preserves all state in
        // the RegisterFrame and leaves via iretq).
        unsafe {
            idt.divide_error.set_handler_addr(VirtAddr::new(isr0 as usize as u64));
            idt.debug.set_handler_addr(VirtAddr::new(isr1 as usize as u64));
            idt.non_maskable_interrupt
                .set_handler_addr(VirtAddr::new(isr2 as usize as u64));
            idt.breakpoint.set_handler_addr(VirtAddr::new(isr3 as usize as u64));
            idt.overflow.set_handler_addr(VirtAddr::new(isr4 as usize as u64));
            idt.bound_range_exceeded
                .set_handler_addr(VirtAddr::new(isr5 as usize as u64));
            idt.invalid_opcode
                .set_handler_addr(VirtAddr::new(isr6 as usize as u64));
            idt.device_not_available
                .set_handler_addr(VirtAddr::new(isr7 as usize as u64));
            idt.double_fault
                .set_handler_addr(VirtAddr::new(isr8 as usize as u64))
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss
                .set_handler_addr(VirtAddr::new(isr10 as usize as u64));
            idt.segment_not_present
                .set_handler_addr(VirtAddr::new(isr11 as usize as u64));
            idt.stack_segment_fault
                .set_handler_addr(VirtAddr::new(isr12 as usize as u64));
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(isr13 as usize as u64));
            idt.page_fault
                .set_handler_addr(VirtAddr::new(isr14 as usize as u64));
            idt.x87_floating_point
                .set_handler_addr(VirtAddr::new(isr16 as usize as u64));
            idt.alignment_check
                .set_handler_addr(VirtAddr::new(isr17 as usize as u64));
            idt.machine_check
                .set_handler_addr(VirtAddr::new(isr18 as usize as u64));
            idt.simd_floating_point
                .set_handler_addr(VirtAddr::new(isr19 as usize as u64));
            idt.virtualization
                .set_handler_addr(VirtAddr::new(isr20 as usize as u64));
            idt.security_exception
                .set_handler_addr(VirtAddr::new(isr30 as usize as u64));

            // Remapped PIC lines 32..47
            let irqs: [extern "C" fn(); 16] = [
                irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11,
                irq12, irq13, irq14, irq15,
            ];
            for (i, stub) in irqs.iter().enumerate() {
                idt[32 + i as u8].set_handler_addr(VirtAddr::new(*stub as usize as u64));
            }

            // Syscall gate: reachable from ring 3
            idt[0x80]
                .set_handler_addr(VirtAddr::new(isr128 as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

/// Load the IDT. Interrupts stay disabled until the boot thread enables
/// them after the scheduler is ready.
#[cfg(target_os = "none")]
pub fn init() {
    IDT.load();
    log::info!(target: "idt", "256 gates loaded, syscall gate at 0x80 (DPL 3)");
}
