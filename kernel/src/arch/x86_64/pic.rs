//! Legacy 8259 PIC pair
//!
//! The two cascaded controllers are remapped so IRQ 0..15 land on vectors
//! 32..47, clear of the CPU exceptions. `pic8259` drives the ICW1-ICW4
//! initialization sequence (restoring the pre-init masks afterwards) and the
//! EOI protocol; the per-line mask helpers and the IRR/ISR queries sit on
//! top of it.

use pic8259::ChainedPics;
use spin::Mutex;

/// Vector base of the master PIC after remap (IRQ 0..7 -> 32..39).
pub const PIC_1_OFFSET: u8 = 32;
/// Vector base of the slave PIC after remap (IRQ 8..15 -> 40..47).
pub const PIC_2_OFFSET: u8 = 40;

/// IRQ line numbers used by this kernel.
pub const IRQ_TIMER: u8 = 0;
pub const IRQ_CASCADE: u8 = 2;
pub const IRQ_ATA_PRIMARY: u8 = 14;
pub const IRQ_ATA_SECONDARY: u8 = 15;

// SAFETY: the offsets do not collide with CPU exceptions (both >= 32).
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the cascade. Must run with interrupts disabled; the previous IRQ
/// masks survive the re-initialization.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: boot runs this once with interrupts disabled; the offsets are
    // the remapped 32/40 bases every IDT gate below expects.
    unsafe {
        PICS.lock().initialize();
    }
    log::info!(
        target: "pic",
        "8259 cascade remapped (master: {}, slave: {})",
        PIC_1_OFFSET,
        PIC_2_OFFSET
    );
}

/// Signal end-of-interrupt for `irq`. Routed to the master always, and to
/// the slave additionally for lines 8..15 -- `pic8259` implements exactly
/// that routing from the vector number.
pub fn end_of_interrupt(irq: u8) {
    // SAFETY: the vector corresponds to a remapped IRQ line owned by these
    // controllers.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq);
    }
}

/// Disable delivery of one IRQ line.
pub fn mask(irq: u8) {
    let mut pics = PICS.lock();
    // SAFETY: reading and writing the mask registers of an initialized
    // cascade; interrupts from these lines are the only consumers.
    unsafe {
        let [mut m1, mut m2] = pics.read_masks();
        if irq < 8 {
            m1 |= 1 << irq;
        } else {
            m2 |= 1 << (irq - 8);
        }
        pics.write_masks(m1, m2);
    }
}

/// Enable delivery of one IRQ line.
pub fn unmask(irq: u8) {
    let mut pics = PICS.lock();
    // SAFETY: as in `mask`.
    unsafe {
        let [mut m1, mut m2] = pics.read_masks();
        if irq < 8 {
            m1 &= !(1 << irq);
        } else {
            m2 &= !(1 << (irq - 8));
        }
        pics.write_masks(m1, m2);
    }
}

/// Mask every line on both controllers.
pub fn mask_all() {
    // SAFETY: writing all-ones masks is always valid.
    unsafe {
        PICS.lock().write_masks(0xFF, 0xFF);
    }
}

/// Read the interrupt request registers (pending lines), slave in the high
/// byte.
#[cfg(target_os = "none")]
pub fn read_irr() -> u16 {
    read_reg(0x0A)
}

/// Read the in-service registers (lines being serviced), slave in the high
/// byte.
#[cfg(target_os = "none")]
pub fn read_isr() -> u16 {
    read_reg(0x0B)
}

#[cfg(target_os = "none")]
fn read_reg(ocw3: u8) -> u16 {
    use x86_64::instructions::port::Port;

    let mut master_cmd: Port<u8> = Port::new(0x20);
    let mut slave_cmd: Port<u8> = Port::new(0xA0);
    // SAFETY: OCW3 reads on the command ports of an initialized cascade.
    unsafe {
        master_cmd.write(ocw3);
        slave_cmd.write(ocw3);
        let low: u8 = master_cmd.read();
        let high: u8 = slave_cmd.read();
        ((high as u16) << 8) | low as u16
    }
}
