//! Smoke test: the kernel brings up GDT, interrupts, and memory far enough
//! to print through the console.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(pen_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use pen_os::multiboot::MultibootInfo;
use pen_os::{gdt, interrupts, memory, println};

pen_os::entry_point!(test_kernel_main);

fn test_kernel_main(_magic: u32, mb_info: MultibootInfo) -> ! {
    // SAFETY: first thing to run.
    unsafe { gdt::init() };
    // SAFETY: runs right after `gdt::init`.
    unsafe { interrupts::init() };
    memory::pmm::init(&mb_info);
    memory::heap::init();
    // SAFETY: pmm and heap are up.
    unsafe { memory::paging::init() };

    test_main();

    pen_os::panic::halt_forever();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pen_os::test_panic_handler(info)
}

/// Test that we can print a line.
#[test_case]
fn test_println() {
    println!("test_println output");
}
