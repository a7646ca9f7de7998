//! Programmable Interval Timer (PIT) driver.
//!
//! Grounded on `original_source/src/arch/x86/timer.c`: programs channel 0
//! to the configured frequency and counts ticks, handing each one to the
//! scheduler the way `timer_callback` calls `sched_tick`.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TIMER_HZ;
use crate::interrupts::{register_interrupt_handler, InterruptFrame, InterruptIndex};
use crate::io::{io_wait, outb};

const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_FREQUENCY: u32 = 1_193_180;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Number of timer ticks since boot.
#[must_use]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Program the PIT to `TIMER_HZ` and register the tick handler.
///
/// # Safety
/// Must run after `interrupts::init` and before `interrupts::enable`.
pub unsafe fn init() {
    let divisor = PIT_BASE_FREQUENCY / TIMER_HZ;
    outb(PIT_COMMAND, 0x36); // channel 0, lobyte/hibyte, mode 3 (square wave)
    io_wait();
    outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
    io_wait();
    outb(PIT_CHANNEL0_DATA, ((divisor >> 8) & 0xFF) as u8);

    register_interrupt_handler(InterruptIndex::Timer.as_u8(), timer_tick);
}

fn timer_tick(frame: &mut InterruptFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::task::schedule_tick(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ticks_starts_at_some_monotonic_value() {
        let first = ticks();
        let second = ticks();
        assert!(second >= first);
    }
}
