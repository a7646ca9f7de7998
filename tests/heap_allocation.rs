//! Tests for heap allocation in a `no_std` environment using a custom allocator.
#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(pen_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use pen_os::multiboot::MultibootInfo;
use pen_os::{gdt, interrupts, memory};

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

#[test_case]
fn simple_allocation_is_usable() {
    let heap_value_1 = Box::new(41);
    let heap_value_2 = Box::new(42);

    assert_eq!(*heap_value_1, 41);
    assert_eq!(*heap_value_2, 42);
}

#[test_case]
fn large_vec_allocation_sums_correctly() {
    let mut vec = Vec::new();
    for i in 0..1000 {
        vec.push(i);
    }
    assert_eq!(vec.iter().sum::<u64>(), (0..1000).sum());
}

#[test_case]
fn many_sequential_boxes_reuse_freed_space() {
    let before = memory::heap::bytes_in_use();
    for i in 0..1000 {
        let x = Box::new(i);
        assert_eq!(*x, i);
    }
    // Each box is dropped before the next is allocated, so the freed block is
    // reused rather than growing the heap by 1000 separate allocations.
    let after = memory::heap::bytes_in_use();
    assert_eq!(before, after);
}

#[test_case]
fn freeing_everything_returns_heap_to_empty() {
    let before = memory::heap::bytes_in_use();
    {
        let _a = Box::new([0u8; 256]);
        let _b = Vec::<u32>::with_capacity(64);
        assert!(memory::heap::bytes_in_use() > before);
    }
    assert_eq!(memory::heap::bytes_in_use(), before);
}
