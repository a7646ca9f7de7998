//! The kernel's single panic/fatal-fault choke point.
//!
//! Grounded on `original_source/src/arch/x86/interrupts.c`'s
//! `panic_with_frame`/`print_page_fault_details`: every unrecoverable
//! condition — a Rust `panic!`, or a CPU exception with no registered
//! handler — funnels through here so there is exactly one format for a
//! kernel crash dump.

use crate::interrupts::{exception_message, InterruptFrame};
use crate::println;

/// Decode and print a page-fault's CR2 + error code, the way
/// `print_page_fault_details` does.
fn print_page_fault_details(err_code: u32) {
    let cr2: u32;
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    let present = err_code & 0x1 != 0;
    let write = err_code & 0x2 != 0;
    let user = err_code & 0x4 != 0;
    println!(
        "  page fault at {:#010x}: {} / {} / {}",
        cr2,
        if present { "protection violation" } else { "not present" },
        if write { "write" } else { "read" },
        if user { "user" } else { "kernel" },
    );
}

/// Dump a saved register frame and halt, for a CPU exception with no
/// registered handler. Never returns.
pub fn panic_with_frame(frame: &InterruptFrame) -> ! {
    println!(
        "PANIC: {} (vector {}, error code {:#x})",
        exception_message(frame.int_no),
        frame.int_no,
        frame.err_code,
    );
    println!(
        "  eip={:#010x} cs={:#06x} eflags={:#010x}",
        frame.eip, frame.cs, frame.eflags,
    );
    println!(
        "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        frame.eax, frame.ebx, frame.ecx, frame.edx,
    );
    println!(
        "  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        frame.esi, frame.edi, frame.ebp, frame.useresp,
    );
    if frame.int_no == 14 {
        print_page_fault_details(frame.err_code);
    }
    halt_forever();
}

/// Disable interrupts and spin forever. The terminal state of a kernel
/// panic or unrecoverable hardware fault.
pub fn halt_forever() -> ! {
    loop {
        // SAFETY: cli/hlt with no preconditions.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}
