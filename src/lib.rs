//! PenOS: a small 32-bit x86 monolithic kernel.
//! This project is a learning project to understand how an OS works.
//! It is not intended to be a production ready OS.
//! I wanted to combine my love for Rust and my curiosity for OS development.
//! Refer to the README.md file for more information about the features supported.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

pub mod block;
pub mod boot;
pub mod config;
pub mod console;
pub mod elf;
pub mod gdt;
pub mod interrupts;
pub mod io;
pub mod memory;
pub mod multiboot;
pub mod panic;
pub mod process;
pub mod serial;
pub mod syscall;
pub mod task;
pub mod timer;

use multiboot::MultibootInfo;

/// Production boot sequence, wired up as `main.rs`'s `entry_point!`
/// handler and run with interrupts still disabled. Mirrors
/// `original_source/src/kernel.c`'s `kernel_main` subsystem bring-up
/// order: segmentation and interrupt plumbing first, then physical
/// memory, then the heap and paging, then the scheduler and syscalls, and
/// only then are interrupts turned on.
pub fn kernel_main(magic: u32, mb_info: MultibootInfo) -> ! {
    if magic != boot::BOOTLOADER_MAGIC {
        println!("kernel_main: unexpected bootloader magic {:#x}", magic);
    }

    // SAFETY: first thing to run, interrupts are still off.
    unsafe { gdt::init() };
    // SAFETY: runs right after `gdt::init`, interrupts still off.
    unsafe { interrupts::init() };

    memory::pmm::init(&mb_info);
    memory::heap::init();
    // SAFETY: pmm and the heap are up; nothing else has touched CR3 yet.
    unsafe { memory::paging::init() };

    interrupts::register_interrupt_handler(14, memory::paging::page_fault_handler);

    let block_device = alloc::boxed::Box::new(block::MemoryBlockDevice::new(
        config::SWAP_START_SECTOR + u64::from(config::SWAP_SLOT_COUNT as u32) * u64::from(config::SWAP_SECTORS_PER_SLOT),
        512,
    ));
    memory::swap::set_device(block_device);

    syscall::init();
    task::init();

    // SAFETY: runs after interrupts::init, before interrupts are enabled.
    unsafe { timer::init() };

    // SAFETY: IDT and PICs are installed, every handler this boot needs is
    // registered.
    unsafe { interrupts::enable() };

    println!("PenOS up, {} free frames", memory::pmm::free_frame_count());

    idle_loop()
}

#[cfg(test)]
entry_point!(test_kernel_main);

/// Entry point for `cargo test --lib`: the same subsystem bring-up as
/// [`kernel_main`], minus the swap device and scheduler (the unit tests
/// under each module's own `#[cfg(test)] mod tests` don't need a running
/// task table), ending in the reexported test harness instead of the idle
/// loop.
#[cfg(test)]
fn test_kernel_main(_magic: u32, mb_info: MultibootInfo) -> ! {
    // SAFETY: first thing to run.
    unsafe { gdt::init() };
    // SAFETY: runs right after `gdt::init`.
    unsafe { interrupts::init() };
    memory::pmm::init(&mb_info);
    memory::heap::init();
    // SAFETY: pmm and the heap are up.
    unsafe { memory::paging::init() };

    test_main();
    panic::halt_forever();
}

/// Park the boot task forever once there is nothing left to do at startup;
/// the scheduler's timer tick is what actually does useful work from here
/// on, the same way `original_source`'s `kernel_main` ends in a `hlt` loop
/// once `sched_init` has handed control to the timer.
fn idle_loop() -> ! {
    loop {
        // SAFETY: `hlt` with interrupts enabled just waits for the next one.
        unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
    }
}

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
pub fn exit_qemu(exit_code: QemuExitCode) {
    // SAFETY: port 0xf4 is the `isa-debug-exit` device QEMU is configured
    // with for this target; writing to it has no effect on real hardware.
    unsafe {
        io::outb(QEMU_EXIT_PORT, exit_code as u8);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);

    #[expect(
        clippy::empty_loop,
        reason = "Endless loop if a test panics. It should not be possible as we exit_qemu before."
    )]
    loop {}
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);
    loop {}
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}
