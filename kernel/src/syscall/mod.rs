//! Syscall gate
//!
//! Entered through vector 0x80 (the only ring-3 reachable gate). The
//! syscall number arrives in RAX; arguments follow in RDI, RSI, RDX, R10,
//! R8, R9. The dispatcher looks the number up in a fixed handler table,
//! calls the handler with the saved frame, and writes the signed 64-bit
//! result back into the frame's RAX slot, where the `iretq` path returns it
//! in the architectural accumulator.
//!
//! User mode observes a uniform `-1` for any failure; the kernel does not
//! expose distinct error codes in this revision. Buffer pointers from user
//! mode are taken at face value -- `write` performs no pointer validation
//! (a known hole of this revision) and `read`/`open` only reject null.

use spin::Mutex;

use crate::arch::x86_64::interrupts::{self, RegisterFrame};
use crate::arch::x86_64::{timer, vga};
use crate::fs::vfs;
use crate::process;

/// Size of the syscall handler table.
pub const SYSCALL_COUNT: usize = 16;

/// Recognized syscall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Syscall {
    Exit = 0,
    Write = 1,
    Read = 2,
    Open = 3,
    Close = 4,
    GetPid = 5,
    Sleep = 6,
    Yield = 7,
    Time = 13,
    GetChar = 14,
    PutChar = 15,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Write),
            2 => Ok(Self::Read),
            3 => Ok(Self::Open),
            4 => Ok(Self::Close),
            5 => Ok(Self::GetPid),
            6 => Ok(Self::Sleep),
            7 => Ok(Self::Yield),
            13 => Ok(Self::Time),
            14 => Ok(Self::GetChar),
            15 => Ok(Self::PutChar),
            _ => Err(()),
        }
    }
}

/// A syscall handler: consumes the frame, produces the RAX result.
pub type SyscallHandler = fn(&mut RegisterFrame) -> i64;

static SYSCALL_TABLE: Mutex<[Option<SyscallHandler>; SYSCALL_COUNT]> =
    Mutex::new([None; SYSCALL_COUNT]);

/// Install a handler for syscall number `nr`.
pub fn register(nr: usize, handler: SyscallHandler) {
    if nr < SYSCALL_COUNT {
        SYSCALL_TABLE.lock()[nr] = Some(handler);
    }
}

/// Vector 0x80 handler: table lookup, call, result into RAX. Unknown
/// numbers and empty slots yield -1.
pub fn dispatch(frame: &mut RegisterFrame) {
    let nr = frame.rax;
    if nr >= SYSCALL_COUNT as u64 {
        frame.rax = -1i64 as u64;
        return;
    }

    let handler = SYSCALL_TABLE.lock()[nr as usize];
    let Some(handler) = handler else {
        frame.rax = -1i64 as u64;
        return;
    };

    let result = handler(frame);
    frame.rax = result as u64;
}

/// Register the recognized set and hook vector 0x80.
pub fn init() {
    register(Syscall::Exit as usize, sys_exit);
    register(Syscall::Write as usize, sys_write);
    register(Syscall::Read as usize, sys_read);
    register(Syscall::Open as usize, sys_open);
    register(Syscall::Close as usize, sys_close);
    register(Syscall::GetPid as usize, sys_getpid);
    register(Syscall::Sleep as usize, sys_sleep);
    register(Syscall::Yield as usize, sys_yield);
    register(Syscall::Time as usize, sys_time);
    register(Syscall::GetChar as usize, sys_getchar);
    register(Syscall::PutChar as usize, sys_putchar);

    interrupts::register_handler(0x80, dispatch);
    log::info!(target: "syscall", "{} handlers registered, gate at 0x80", 11);
}

/// exit(code): current task becomes a ZOMBIE and yields; never returns to
/// the caller.
fn sys_exit(frame: &mut RegisterFrame) -> i64 {
    process::exit_current(frame.rdi as i32);
    0
}

/// write(fd, buf, len): fd 1 and 2 go to the console; anything else is -1.
fn sys_write(frame: &mut RegisterFrame) -> i64 {
    let fd = frame.rdi as i64;
    let buf = frame.rsi;
    let len = frame.rdx as usize;

    match fd {
        1 | 2 => {
            // TODO: Validate user pointer
            // For now, assume it's valid
            // SAFETY: the buffer is taken at face value (known hole of this
            // revision); the pages are read through the current (caller's)
            // address space.
            let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, len) };
            for &b in bytes {
                vga::put_byte(b);
            }
            len as i64
        }
        _ => -1,
    }
}

/// read(fd, buf, len): delegates to the fd table; -1 if nothing backs it.
fn sys_read(frame: &mut RegisterFrame) -> i64 {
    let fd = frame.rdi as i64;
    let buf = frame.rsi;
    let len = frame.rdx as usize;

    if buf == 0 {
        return -1;
    }
    vfs::read(fd, buf as *mut u8, len).unwrap_or(-1)
}

/// open(path, flags): path is a NUL-terminated string in the caller's
/// address space.
fn sys_open(frame: &mut RegisterFrame) -> i64 {
    let ptr = frame.rdi;
    let flags = frame.rsi as u32;
    if ptr == 0 {
        return -1;
    }

    let mut buf = [0u8; vfs::MAX_PATH];
    let mut len = 0;
    // SAFETY: non-null pointer taken at face value, as with `write`; the
    // copy stops at NUL or MAX_PATH.
    unsafe {
        while len < vfs::MAX_PATH {
            let b = *((ptr + len as u64) as *const u8);
            if b == 0 {
                break;
            }
            buf[len] = b;
            len += 1;
        }
    }
    let Ok(path) = core::str::from_utf8(&buf[..len]) else {
        return -1;
    };

    vfs::open(path, flags).unwrap_or(-1)
}

/// close(fd)
fn sys_close(frame: &mut RegisterFrame) -> i64 {
    vfs::close(frame.rdi as i64).map(|_| 0).unwrap_or(-1)
}

/// getpid(): current PID, or 0 when no task is current.
fn sys_getpid(frame: &mut RegisterFrame) -> i64 {
    let _ = frame;
    process::PROCESS_TABLE
        .lock()
        .current_pid()
        .map(|pid| pid.0 as i64)
        .unwrap_or(0)
}

/// sleep(ms): converts to ticks (rounding up) and sleeps.
fn sys_sleep(frame: &mut RegisterFrame) -> i64 {
    let ms = frame.rdi;
    if ms == 0 {
        return 0;
    }
    process::sleep_current(timer::ms_to_ticks(ms));
    0
}

/// yield(): reschedule.
fn sys_yield(frame: &mut RegisterFrame) -> i64 {
    let _ = frame;
    crate::sched::yield_now();
    0
}

/// time(): uptime in milliseconds.
fn sys_time(frame: &mut RegisterFrame) -> i64 {
    let _ = frame;
    timer::uptime_ms() as i64
}

/// getchar(): no input path in this revision.
fn sys_getchar(frame: &mut RegisterFrame) -> i64 {
    let _ = frame;
    -1
}

/// putchar(c): one byte to the console.
fn sys_putchar(frame: &mut RegisterFrame) -> i64 {
    vga::put_byte(frame.rdi as u8);
    0
}
