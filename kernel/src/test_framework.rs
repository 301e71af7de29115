//! Bare-metal test scaffolding
//!
//! Used by the custom test runner when the suite runs under QEMU: results go
//! to the serial port and the run terminates through the isa-debug-exit
//! device. Hosted unit tests use the standard harness and never touch this.

use core::panic::PanicInfo;

use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Trait all testable functions implement.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {}", e);
                Err(e)
            }
        }
    }
}

/// Custom test runner for bare-metal test binaries.
#[cfg(all(test, target_os = "none"))]
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    let mut failed = 0;

    for test in tests {
        if test.run().is_err() {
            failed += 1;
        }
    }

    if failed == 0 {
        exit_qemu(QemuExitCode::Success);
    } else {
        serial_println!("{} tests failed", failed);
        exit_qemu(QemuExitCode::Failed);
    }
}

/// Panic handler for test mode.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
}

/// Exit QEMU through the isa-debug-exit device at port 0xf4.
#[cfg(target_os = "none")]
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    // SAFETY: port 0xf4 is the QEMU debug exit device; QEMU terminates
    // before the next instruction runs.
    unsafe {
        use x86_64::instructions::port::Port;
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
    crate::arch::halt_forever();
}

#[cfg(not(target_os = "none"))]
pub fn exit_qemu(_exit_code: QemuExitCode) -> ! {
    panic!("exit_qemu reached in hosted build");
}
