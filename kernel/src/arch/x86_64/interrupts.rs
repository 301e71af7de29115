//! Interrupt core
//!
//! Owns the uniform register frame, the per-vector trampolines, and the
//! common dispatcher. Vectors 0..31 are CPU exceptions, 32..47 the remapped
//! PIC lines, 0x80 the syscall gate.
//!
//! Every trampoline normalizes the stack to the [`RegisterFrame`] layout:
//! a dummy error code is pushed where the CPU did not push one, then the
//! vector, then the common stub saves every register and calls
//! [`isr_dispatch`] with the frame pointer. The frame is rewritten in place
//! by the scheduler and the syscall gate before the restore path `iretq`s --
//! that in-place rewrite is how a different task resumes.

use spin::Mutex;

use crate::arch::x86_64::mmu;

/// Register state captured on interrupt entry.
///
/// The field order is a fixed contract with the assembly in
/// [`isr_common_stub`]: segment registers at the lowest addresses (pushed
/// last), then the general-purpose registers, the vector number, the uniform
/// error-code slot, and the context the CPU pushed itself.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegisterFrame {
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,

    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub vector: u64,
    pub error_code: u64,

    // Pushed by the CPU on entry, consumed by iretq on the way out
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl RegisterFrame {
    pub const fn zeroed() -> Self {
        Self {
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Did this frame come from ring 3?
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

impl Default for RegisterFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// A registered interrupt handler. Handlers may rewrite the frame; the
/// restore path resumes whatever state the frame holds afterwards.
pub type HandlerFn = fn(&mut RegisterFrame);

static HANDLERS: Mutex<[Option<HandlerFn>; 256]> = Mutex::new([None; 256]);

/// Install `handler` for `vector`, replacing any previous registration.
pub fn register_handler(vector: u8, handler: HandlerFn) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Remove the handler for `vector`.
pub fn unregister_handler(vector: u8) {
    HANDLERS.lock()[vector as usize] = None;
}

static EXCEPTION_NAMES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Security Exception",
    "Reserved",
];

const VECTOR_PAGE_FAULT: u64 = 14;

/// Common dispatcher. Every trampoline funnels here with a pointer to the
/// frame it just built on the interrupt stack.
#[no_mangle]
pub extern "C" fn isr_dispatch(frame: &mut RegisterFrame) {
    let vector = (frame.vector & 0xFF) as usize;

    // Copy the slot out so the table lock is released before the handler
    // runs; handlers register and unregister freely.
    let handler = HANDLERS.lock()[vector];
    if let Some(handler) = handler {
        handler(frame);
        return;
    }

    if vector < 32 {
        fatal_exception(frame, vector);
    }

    log::warn!(target: "isr", "unhandled vector {}", vector);
}

/// Unhandled CPU exception: dump the captured state and halt for good.
fn fatal_exception(frame: &RegisterFrame, vector: usize) -> ! {
    use crate::arch::x86_64::vga::{self, Color};

    vga::set_color(Color::White, Color::Red);
    println!("\n\n*** CPU EXCEPTION: {} ***", EXCEPTION_NAMES[vector]);
    println!(
        "Vector: {}, Error Code: {:#x}",
        vector, frame.error_code
    );
    println!(
        "RIP: {:#x}, CS: {:#x}, RFLAGS: {:#x}",
        frame.rip, frame.cs, frame.rflags
    );
    println!("RSP: {:#x}, SS: {:#x}", frame.rsp, frame.ss);
    println!(
        "RAX: {:#x}, RBX: {:#x}, RCX: {:#x}, RDX: {:#x}",
        frame.rax, frame.rbx, frame.rcx, frame.rdx
    );
    println!(
        "RSI: {:#x}, RDI: {:#x}, RBP: {:#x}",
        frame.rsi, frame.rdi, frame.rbp
    );
    println!(
        "R8:  {:#x}, R9:  {:#x}, R10: {:#x}, R11: {:#x}",
        frame.r8, frame.r9, frame.r10, frame.r11
    );

    if frame.vector == VECTOR_PAGE_FAULT {
        println!("Faulting Address: {:#x}", mmu::read_cr2());
        println!(
            "Cause: {}, {}, {}",
            if frame.error_code & 1 != 0 {
                "protection violation"
            } else {
                "non-present page"
            },
            if frame.error_code & 2 != 0 { "write" } else { "read" },
            if frame.error_code & 4 != 0 {
                "user mode"
            } else {
                "kernel mode"
            },
        );
    }

    println!("\nSystem halted.");
    crate::arch::halt_forever();
}

/// Raise the timer vector synchronously (voluntary yield goes through the
/// same dispatcher as preemption).
#[cfg(target_os = "none")]
pub fn raise_timer() {
    // SAFETY: software interrupt into our own registered vector; the
    // dispatcher treats it exactly like a hardware tick.
    unsafe {
        core::arch::asm!("int 32");
    }
}

// ---------------------------------------------------------------------------
// Low-level entry stubs
// ---------------------------------------------------------------------------

/// Common save/dispatch/restore stub. Entered from the per-vector
/// trampolines with `[vector][error_code]` already on the stack.
#[unsafe(naked)]
pub extern "C" fn isr_common_stub() {
    core::arch::naked_asm!(
        // General-purpose registers, matching RegisterFrame back to front
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Segment registers (rax is already saved and free to clobber)
        "mov rax, gs",
        "push rax",
        "mov rax, fs",
        "push rax",
        "mov rax, es",
        "push rax",
        "mov rax, ds",
        "push rax",
        // Run the dispatcher on kernel data segments
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov rdi, rsp",
        "call {dispatch}",
        // Restore ds/es from the (possibly rewritten) frame
        "pop rax",
        "mov ds, ax",
        "pop rax",
        "mov es, ax",
        // fs/gs were captured for the frame but are not reloaded
        "add rsp, 16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Discard vector and error code
        "add rsp, 16",
        "iretq",
        dispatch = sym isr_dispatch,
    )
}

/// Trampoline for a vector where the CPU pushes no error code: push the
/// uniform dummy slot, the vector, and fall into the common stub.
macro_rules! isr_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common_stub,
            )
        }
    };
}

/// Trampoline for a vector where the CPU pushed an error code already.
macro_rules! isr_stub_err {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common_stub,
            )
        }
    };
}

// CPU exceptions. 8, 10-14, 17 and 30 push an error code.
isr_stub!(isr0, 0);
isr_stub!(isr1, 1);
isr_stub!(isr2, 2);
isr_stub!(isr3, 3);
isr_stub!(isr4, 4);
isr_stub!(isr5, 5);
isr_stub!(isr6, 6);
isr_stub!(isr7, 7);
isr_stub_err!(isr8, 8);
isr_stub_err!(isr10, 10);
isr_stub_err!(isr11, 11);
isr_stub_err!(isr12, 12);
isr_stub_err!(isr13, 13);
isr_stub_err!(isr14, 14);
isr_stub!(isr16, 16);
isr_stub_err!(isr17, 17);
isr_stub!(isr18, 18);
isr_stub!(isr19, 19);
isr_stub!(isr20, 20);
isr_stub_err!(isr30, 30);

// Remapped PIC lines
isr_stub!(irq0, 32);
isr_stub!(irq1, 33);
isr_stub!(irq2, 34);
isr_stub!(irq3, 35);
isr_stub!(irq4, 36);
isr_stub!(irq5, 37);
isr_stub!(irq6, 38);
isr_stub!(irq7, 39);
isr_stub!(irq8, 40);
isr_stub!(irq9, 41);
isr_stub!(irq10, 42);
isr_stub!(irq11, 43);
isr_stub!(irq12, 44);
isr_stub!(irq13, 45);
isr_stub!(irq14, 46);
isr_stub!(irq15, 47);

// Syscall gate
isr_stub!(isr128, 128);

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::mem::{offset_of, size_of};

    use super::*;

    /// The trampolines push exactly this layout; the offsets are load-bearing.
    #[test]
    fn frame_layout_matches_entry_stub() {
        assert_eq!(size_of::<RegisterFrame>(), 26 * 8);
        assert_eq!(offset_of!(RegisterFrame, ds), 0x00);
        assert_eq!(offset_of!(RegisterFrame, gs), 0x18);
        assert_eq!(offset_of!(RegisterFrame, r15), 0x20);
        assert_eq!(offset_of!(RegisterFrame, r8), 0x58);
        assert_eq!(offset_of!(RegisterFrame, rbp), 0x60);
        assert_eq!(offset_of!(RegisterFrame, rax), 0x90);
        assert_eq!(offset_of!(RegisterFrame, vector), 0x98);
        assert_eq!(offset_of!(RegisterFrame, error_code), 0xA0);
        assert_eq!(offset_of!(RegisterFrame, rip), 0xA8);
        assert_eq!(offset_of!(RegisterFrame, cs), 0xB0);
        assert_eq!(offset_of!(RegisterFrame, rflags), 0xB8);
        assert_eq!(offset_of!(RegisterFrame, rsp), 0xC0);
        assert_eq!(offset_of!(RegisterFrame, ss), 0xC8);
    }

    #[test]
    fn registered_handler_receives_frame() {
        fn mark(frame: &mut RegisterFrame) {
            frame.rax = 0x1234;
        }
        register_handler(200, mark);

        let mut frame = RegisterFrame {
            vector: 200,
            ..RegisterFrame::zeroed()
        };
        isr_dispatch(&mut frame);
        assert_eq!(frame.rax, 0x1234);

        unregister_handler(200);
    }

    #[test]
    fn unhandled_high_vector_is_benign() {
        let mut frame = RegisterFrame {
            vector: 201,
            ..RegisterFrame::zeroed()
        };
        // No handler registered: logs a warning and returns
        isr_dispatch(&mut frame);
        assert_eq!(frame.rax, 0);
    }

    #[test]
    fn ring_detection_reads_cs_rpl() {
        let mut frame = RegisterFrame::zeroed();
        frame.cs = 0x08;
        assert!(!frame.from_user());
        frame.cs = 0x1B;
        assert!(frame.from_user());
    }
}
