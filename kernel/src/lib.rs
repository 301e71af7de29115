//! NovaKernel library
//!
//! A small preemptive single-CPU kernel for x86_64 long mode: 4-level
//! paging with per-process address spaces, a first-fit kernel heap, a
//! remapped legacy PIC feeding a uniform interrupt frame, a round-robin
//! scheduler that rewrites that frame in place, and an `int 0x80` syscall
//! gate for ring-3 tasks.
//!
//! The crate builds for `x86_64-unknown-none` (the kernel proper) and for
//! the host, where hardware access is stubbed and the unit suite runs under
//! the standard test harness.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(all(test, target_os = "none"), feature(custom_test_frameworks))]
#![cfg_attr(
    all(test, target_os = "none"),
    test_runner(crate::test_framework::test_runner)
)]
#![cfg_attr(all(test, target_os = "none"), reexport_test_harness_main = "test_main")]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so unit tests can run under the normal harness.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod test_framework;

// On bare metal the first-fit kernel heap backs all of `alloc`; hosted
// builds delegate to the system allocator.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Heap exhaustion inside `alloc` itself is unrecoverable in a no_std
/// kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}

// Serializes unit tests that exercise global kernel state (process table,
// fd table, root mount, syscall table).
#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_sync {
    extern crate std;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    pub(crate) fn guard() -> MutexGuard<'static, ()> {
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    arch::halt_forever();
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}
