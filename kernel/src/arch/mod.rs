//! Architecture support
//!
//! Single-architecture kernel: x86_64 in long mode. The module boundary
//! keeps the portable core (mm, process, sched, syscall, fs) free of inline
//! assembly and port I/O.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Enable interrupt delivery. Called exactly once by the boot thread, after
/// the scheduler has started and the first tasks are queued.
#[cfg(target_os = "none")]
pub fn enable_interrupts() {
    ::x86_64::instructions::interrupts::enable();
}

/// Disable interrupt delivery.
#[cfg(target_os = "none")]
pub fn disable_interrupts() {
    ::x86_64::instructions::interrupts::disable();
}

/// Run `f` with interrupts masked, restoring the previous state after.
///
/// Interrupt masking is this kernel's mutual-exclusion mechanism: every
/// task-context path that touches a shared structure (process table, ready
/// queue, heap, frame bitmap) goes through here so the timer handler can
/// never spin on a lock its own interrupted context holds.
#[cfg(target_os = "none")]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    ::x86_64::instructions::interrupts::without_interrupts(f)
}

/// Hosted builds have no interrupt delivery; run `f` directly.
#[cfg(not(target_os = "none"))]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Park the CPU forever with interrupts disabled. Terminal error path.
#[cfg(target_os = "none")]
pub fn halt_forever() -> ! {
    loop {
        ::x86_64::instructions::interrupts::disable();
        ::x86_64::instructions::hlt();
    }
}

/// Host stand-in so terminal paths stay compilable in unit tests; a test
/// reaching one is a bug, so fail loudly.
#[cfg(not(target_os = "none"))]
pub fn halt_forever() -> ! {
    panic!("halt_forever reached in hosted build");
}

/// Wait for the next interrupt.
#[cfg(target_os = "none")]
pub fn wait_for_interrupt() {
    ::x86_64::instructions::hlt();
}
