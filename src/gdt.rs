//! GDT and TSS initialization.
//!
//! Grounded on the teacher's `gdt.rs` (the `lazy_static!` table-of-selectors
//! shape, `init()`/`user_code_selector()`/`user_data_selector()` split) and
//! on `original_source/src/arch/x86/gdt.c` + `tss.c` for the concrete
//! descriptor layout: the `x86_64` crate's `GlobalDescriptorTable` only
//! emits long-mode descriptors, so the table itself is hand-built here.

use core::arch::asm;
use core::mem::size_of;

use lazy_static::lazy_static;
use spin::Mutex;

/// Kernel code segment selector (`spec.md` §6).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// User code segment selector, RPL 3.
pub const USER_CODE_SELECTOR: u16 = 0x1B;
/// User data segment selector, RPL 3.
pub const USER_DATA_SELECTOR: u16 = 0x23;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

const GDT_ENTRIES: usize = 6;

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry { limit_low: 0, base_low: 0, base_mid: 0, access: 0, granularity: 0, base_high: 0 }
    }

    const fn flat(access: u8, granularity: u8) -> Self {
        GdtEntry { limit_low: 0xFFFF, base_low: 0, base_mid: 0, access, granularity, base_high: 0 }
    }

    const fn tss(base: u32, limit: u32) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access: 0x89,
            granularity: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// x86 Task State Segment. Only `ss0`/`esp0` (the ring-0 stack loaded on a
/// privilege-level change) and `iomap_base` are meaningful here: this kernel
/// does not use hardware task switching, so every other field stays zero,
/// per `original_source/src/arch/x86/tss.c`'s `tss_init`.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Tss {
    prev_tss: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Tss {
            prev_tss: 0, esp0: 0, ss0: KERNEL_DATA_SELECTOR as u32,
            esp1: 0, ss1: 0, esp2: 0, ss2: 0, cr3: 0, eip: 0, eflags: 0,
            eax: 0, ecx: 0, edx: 0, ebx: 0, esp: 0, ebp: 0, esi: 0, edi: 0,
            es: 0, cs: 0, ss: 0, ds: 0, fs: 0, gs: 0, ldt: 0, trap: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }
}

lazy_static! {
    static ref TSS: Mutex<Tss> = Mutex::new(Tss::new());
}

struct Gdt {
    entries: [GdtEntry; GDT_ENTRIES],
}

/// Builds the GDT against the TSS's current (`'static`, so fixed) address,
/// mirroring the teacher's lazily-built `(GlobalDescriptorTable, Selectors)`
/// pair.
fn build_gdt() -> Gdt {
    let tss_base = &raw const *TSS.lock() as u32;
    let tss_limit = (size_of::<Tss>() - 1) as u32;
    Gdt {
        entries: [
            GdtEntry::null(),
            GdtEntry::flat(0x9A, 0xCF), // kernel code: present, ring0, exec/read, 4K gran, 32-bit
            GdtEntry::flat(0x92, 0xCF), // kernel data: present, ring0, read/write
            GdtEntry::flat(0xFA, 0xCF), // user code: present, ring3, exec/read
            GdtEntry::flat(0xF2, 0xCF), // user data: present, ring3, read/write
            GdtEntry::tss(tss_base, tss_limit),
        ],
    }
}

// `lgdt` keeps only a pointer to the table; the CPU dereferences it on
// every segment load for as long as the kernel runs, so it needs `'static`
// storage the same way `TSS` and `interrupts::IDT` get theirs, rather than
// a stack slot `init()` leaves behind on return.
lazy_static! {
    static ref GDT: Mutex<Gdt> = Mutex::new(build_gdt());
}

/// Load the GDT and TSS and reload every segment register to point at the
/// new kernel selectors.
///
/// # Safety
/// Must run exactly once, early in `kernel_main`, before any interrupt can
/// fire or any segment register is otherwise relied upon.
pub unsafe fn init() {
    let gdt = GDT.lock();
    let pointer = GdtPointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: &raw const *gdt as u32,
    };

    asm!("lgdt [{ptr}]", ptr = in(reg) &raw const pointer);
    reload_segments();
    asm!("ltr {sel:x}", sel = in(reg) TSS_SELECTOR);
}

unsafe fn reload_segments() {
    asm!(
        "push {code_sel}",
        "lea eax, [2f]",
        "push eax",
        "retf",
        "2:",
        "mov ax, {data_sel:x}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov ss, ax",
        code_sel = const KERNEL_CODE_SELECTOR as u32,
        data_sel = const KERNEL_DATA_SELECTOR,
        out("eax") _,
    );
}

/// Update the ring-0 stack pointer the CPU loads on a privilege-level
/// change, once per task switch (`original_source`'s `tss_set_stack`,
/// called from `sched_tick`).
pub fn set_kernel_stack(esp0: u32) {
    TSS.lock().esp0 = esp0;
}

/// Returns the user code segment selector (RPL 3).
#[must_use]
pub fn user_code_selector() -> u16 {
    USER_CODE_SELECTOR
}

/// Returns the user data segment selector (RPL 3).
#[must_use]
pub fn user_data_selector() -> u16 {
    USER_DATA_SELECTOR
}
