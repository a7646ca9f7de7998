//! Integration test for address spaces, swap eviction, and the boot
//! address space dispatch the page-fault handler relies on.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use pen_os::interrupts::InterruptFrame;
use pen_os::memory::paging::{self, PageFlags};
use pen_os::memory::{pmm, swap};
use pen_os::multiboot::MultibootInfo;
use pen_os::{block, config, exit_qemu, gdt, interrupts, memory, serial_print, serial_println, QemuExitCode};

pen_os::entry_point!(test_kernel_main);

fn test_kernel_main(_magic: u32, mb_info: MultibootInfo) -> ! {
    serial_print!("paging::swap_eviction_round_trips_through_page_fault...\t");

    // SAFETY: first thing to run.
    unsafe { gdt::init() };
    // SAFETY: runs right after `gdt::init`.
    unsafe { interrupts::init() };
    memory::pmm::init(&mb_info);
    memory::heap::init();
    // SAFETY: pmm and heap are up.
    unsafe { memory::paging::init() };

    let device = alloc::boxed::Box::new(block::MemoryBlockDevice::new(
        config::SWAP_START_SECTOR + u64::from(config::SWAP_SLOT_COUNT as u32) * u64::from(config::SWAP_SECTORS_PER_SLOT),
        512,
    ));
    swap::set_device(device);

    // `with_current` falls back to the boot address space while no task is
    // running, the same space `paging::init` just loaded into CR3.
    let virt = 0x5000_0000u32;
    paging::with_current(|space| {
        let frame = pmm::alloc_frame().expect("frame available");
        space.map(virt, frame, PageFlags::PRESENT | PageFlags::WRITABLE);
        // SAFETY: just mapped writable in the currently loaded directory.
        unsafe { core::ptr::write_bytes(frame.start_address() as *mut u8, 0x5A, 1) };
    });

    let evicted_slot = paging::with_current(|space| {
        let entry = space.entry(virt).expect("page is mapped");
        let phys = pmm::PhysFrame::containing_address(entry & !0xFFF);
        let slot = swap::swap_out(phys).expect("swap has room");
        space.mark_swapped(virt, slot);
        pmm::free_frame(phys);
        assert_eq!(space.translate(virt), None, "swapped-out page must not translate");
        slot
    });

    // Simulate the CPU faulting on `virt`: write CR2, then dispatch the
    // same handler vector 14 uses.
    // SAFETY: loading CR2 for a synthetic fault the handler is about to
    // service; nothing else reads CR2 concurrently on this single core.
    unsafe {
        core::arch::asm!("mov cr2, {virt}", virt = in(reg) virt, options(nostack));
    }
    let mut frame = zero_frame();
    frame.int_no = 14;
    paging::with_current(|space| paging::handle_page_fault(&mut frame, space));

    let restored_byte = paging::with_current(|space| {
        let phys = space.translate(virt).expect("page fault handler must remap the page");
        // SAFETY: freshly remapped, identity-mapped present frame.
        unsafe { core::ptr::read(phys as *const u8) }
    });
    assert_eq!(restored_byte, 0x5A, "swapped-in page must keep its original contents");
    assert!(swap::available_slots() > 0, "the evicted slot must be released back to the pool");
    let _ = evicted_slot;

    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);

    #[expect(clippy::empty_loop, reason = "exit_qemu never returns under QEMU")]
    loop {}
}

fn zero_frame() -> InterruptFrame {
    InterruptFrame {
        edi: 0,
        esi: 0,
        ebp: 0,
        esp_kernel: 0,
        ebx: 0,
        edx: 0,
        ecx: 0,
        eax: 0,
        gs: 0,
        fs: 0,
        es: 0,
        ds: 0,
        int_no: 0,
        err_code: 0,
        eip: 0,
        cs: 0,
        eflags: 0,
        useresp: 0,
        ss: 0,
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pen_os::test_panic_handler(info)
}
