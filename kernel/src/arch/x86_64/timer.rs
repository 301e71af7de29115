//! Programmable interval timer (PIT)
//!
//! Channel 0 runs as a rate generator at [`TICK_HZ`], feeding the vector-32
//! handler that drives scheduling. The tick counter is the kernel's only
//! clock.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

#[cfg(target_os = "none")]
use super::interrupts::{self, RegisterFrame};
#[cfg(target_os = "none")]
use super::pic;

/// Tick frequency chosen by this kernel (10 ms per tick).
pub const TICK_HZ: u32 = 100;

/// The PIT's fixed input clock.
const PIT_BASE_HZ: u32 = 1_193_182;

/// PIT command: channel 0, lobyte/hibyte access, rate generator, binary.
#[cfg(target_os = "none")]
const PIT_COMMAND_BYTE: u8 = 0x34;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Optional per-tick callback, invoked before the scheduler.
static TICK_CALLBACK: Mutex<Option<fn()>> = Mutex::new(None);

/// Monotone tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot, derived from the tick count.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TICK_HZ as u64
}

/// Milliseconds rounded up to whole ticks (sleep syscall conversion).
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(1000 / TICK_HZ as u64)
}

/// Install a per-tick callback. One slot; the latest registration wins.
pub fn register_callback(callback: fn()) {
    *TICK_CALLBACK.lock() = Some(callback);
}

const fn pit_divisor(frequency: u32) -> u16 {
    (PIT_BASE_HZ / frequency) as u16
}

/// Vector-32 handler: account the tick, run the callback, let the scheduler
/// rewrite the frame, then signal EOI.
#[cfg(target_os = "none")]
fn timer_interrupt(frame: &mut RegisterFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);

    let callback = *TICK_CALLBACK.lock();
    if let Some(callback) = callback {
        callback();
    }

    crate::sched::schedule(frame);

    pic::end_of_interrupt(pic::IRQ_TIMER);
}

/// Program the PIT and hook vector 32. The timer line stays masked until
/// `unmask_timer` runs, right before interrupts are enabled.
#[cfg(target_os = "none")]
pub fn init() {
    interrupts::register_handler(32, timer_interrupt);

    let divisor = pit_divisor(TICK_HZ);
    // SAFETY: standard PIT programming sequence on ports 0x43/0x40 with
    // interrupts still disabled.
    unsafe {
        use x86_64::instructions::port::Port;

        let mut command: Port<u8> = Port::new(0x43);
        let mut channel0: Port<u8> = Port::new(0x40);

        command.write(PIT_COMMAND_BYTE);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    log::info!(
        target: "timer",
        "PIT at {} Hz ({} ms per tick), divisor {}",
        TICK_HZ,
        1000 / TICK_HZ,
        divisor
    );
}

/// Allow IRQ0 through the PIC.
#[cfg(target_os = "none")]
pub fn unmask_timer() {
    pic::unmask(pic::IRQ_TIMER);
}

/// Busy-wait for `count` ticks. Pre-scheduler use only; tasks sleep through
/// the scheduler instead.
#[cfg(target_os = "none")]
pub fn sleep_ticks(count: u64) {
    let target = ticks() + count;
    while ticks() < target {
        x86_64::instructions::hlt();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn divisor_for_100hz() {
        assert_eq!(pit_divisor(100), 11931);
    }

    #[test]
    fn uptime_follows_ticks() {
        // 100 Hz -> 10 ms per tick
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(11), 2);
        assert_eq!(ms_to_ticks(500), 50);
        assert_eq!(ms_to_ticks(1000), 100);
    }

    #[test]
    fn tick_counter_is_monotone() {
        let before = ticks();
        TICKS.fetch_add(3, Ordering::Relaxed);
        assert_eq!(ticks(), before + 3);
    }
}
