//! Integration test for the `int 0x80` syscall dispatcher.
//!
//! Drives the real IDT gate at `interrupts::SYSCALL_VECTOR` with a software
//! interrupt rather than calling the dispatcher function directly, so the
//! test covers the gate's DPL and the `eax`/`ebx` calling convention too.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use pen_os::multiboot::MultibootInfo;
use pen_os::syscall::{SYS_GETPID, SYS_TICKS, SYS_WRITE, SYS_YIELD};
use pen_os::{exit_qemu, gdt, interrupts, memory, serial_print, serial_println, syscall, task, timer, QemuExitCode};

pen_os::entry_point!(test_kernel_main);

/// # Safety
/// Caller must only pass syscall numbers whose handler does not rely on a
/// real ring-3 caller (no `SYS_EXEC`/`SYS_EXIT` here).
unsafe fn syscall2(num: u32, arg1: u32) -> u32 {
    let result: u32;
    core::arch::asm!(
        "int 0x80",
        inout("eax") num => result,
        in("ebx") arg1,
        options(nostack),
    );
    result
}

fn test_kernel_main(_magic: u32, mb_info: MultibootInfo) -> ! {
    serial_print!("syscall::int_0x80_dispatches_by_number...\t");

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
    // SAFETY: interrupts::init ran above, and this runs before `enable`.
    unsafe { timer::init() };
    // SAFETY: every handler this test needs is registered above.
    unsafe { interrupts::enable() };

    // SYS_GETPID: the boot task is always pid 0.
    // SAFETY: SYS_GETPID ignores its argument.
    let pid = unsafe { syscall2(SYS_GETPID, 0) };
    assert_eq!(pid, 0, "the boot task's pid must be 0");

    // SYS_TICKS: must match the timer's own monotonic counter.
    // SAFETY: SYS_TICKS ignores its argument.
    let ticks_via_syscall = unsafe { syscall2(SYS_TICKS, 0) };
    assert!(u64::from(ticks_via_syscall) <= timer::ticks(), "syscall ticks must not read ahead of the timer");

    // SYS_WRITE: the pointer just needs to resolve under the currently
    // loaded (boot/identity-mapped) directory; it doesn't need to come
    // from a real ring-3 task for this dispatch-path test.
    let message = b"syscall test message\0";
    // SAFETY: `message` is `'static` and NUL-terminated.
    let write_result = unsafe { syscall2(SYS_WRITE, message.as_ptr() as u32) };
    assert_eq!(write_result, 0, "sys_write must accept a valid NUL-terminated pointer");

    let null_write_result =
        // SAFETY: a null pointer is the documented rejection case.
        unsafe { syscall2(SYS_WRITE, 0) };
    assert_eq!(null_write_result, 0xFFFF_FFFF, "sys_write must reject a null pointer");

    // SYS_YIELD: just needs to return control; the timer tick wakes the
    // `hlt` it spins on.
    // SAFETY: SYS_YIELD ignores its argument.
    let yield_result = unsafe { syscall2(SYS_YIELD, 0) };
    assert_eq!(yield_result, 0);

    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);

    #[expect(clippy::empty_loop, reason = "exit_qemu never returns under QEMU")]
    loop {}
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pen_os::test_panic_handler(info)
}
