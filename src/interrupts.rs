//! Interrupt handling: IDT, ISR stubs and the handler registry.
//!
//! Grounded on the teacher's `interrupts.rs` for the `lazy_static!` table
//! idiom, PIC offsets and `InterruptIndex` enum, and on
//! `original_source/src/arch/x86/interrupts.c` for everything the
//! `x86_64::structures::idt::InterruptDescriptorTable` can't give us on a
//! 32-bit target: the raw gate layout, the 256-slot `handlers` registry and
//! the `next_frame_override` mechanism the scheduler uses to redirect an
//! `iret` onto a different task's frame.

use core::arch::{asm, global_asm};
use core::mem::size_of;

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;

use crate::gdt;

/// The offset for the Programmable Interrupt Controller (PIC) 1 (starting after interrupt table
/// max offset).
pub const PIC_1_OFFSET: u8 = 32;
/// The offset for the Programmable Interrupt Controller (PIC) 2.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Interrupt vector the syscall dispatcher listens on (`spec.md` §4.7).
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The Programmable Interrupt Controller (PIC) used for handling hardware interrupts.
pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
/// Enum for the interrupt indices.
pub enum InterruptIndex {
    /// Timer interrupt index.
    Timer = PIC_1_OFFSET,
    /// Keyboard interrupt index.
    Keyboard,
}

impl InterruptIndex {
    /// Returns the index as a `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the index as a `usize`.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

/// Saved CPU state at the moment an interrupt or exception landed, laid out
/// in exactly the order `isr_common_stub` (below) leaves it on the stack:
/// segment registers, then `pushad`'s block, then vector/error code, then
/// whatever the CPU itself pushed.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_kernel: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

type HandlerFn = fn(&mut InterruptFrame);

const HANDLER_SLOTS: usize = 256;

struct HandlerTable {
    handlers: [Option<HandlerFn>; HANDLER_SLOTS],
}

lazy_static! {
    static ref HANDLERS: Mutex<HandlerTable> = Mutex::new(HandlerTable {
        handlers: [None; HANDLER_SLOTS],
    });
}

/// Register a handler for interrupt vector `vector`. Replaces whatever was
/// previously installed, mirroring `original_source`'s
/// `register_interrupt_handler`.
pub fn register_interrupt_handler(vector: u8, handler: HandlerFn) {
    HANDLERS.lock().handlers[vector as usize] = Some(handler);
}

/// Vectors 0-19 are CPU exceptions; below this a missing handler is a
/// programming error serious enough to panic on, matching
/// `original_source`'s `if (int_no < 20) panic_with_frame(...)`.
const FIRST_NON_EXCEPTION_VECTOR: u32 = 20;

const EXCEPTION_MESSAGES: [&str; 20] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Into Detected Overflow",
    "Out of Bounds",
    "Invalid Opcode",
    "No Coprocessor",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Bad TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection Fault",
    "Page Fault",
    "Unknown Interrupt",
    "Coprocessor Fault",
    "Alignment Check",
    "Machine Check",
    "Reserved",
];

/// Human-readable name for a CPU exception vector, for panic messages.
#[must_use]
pub fn exception_message(vector: u32) -> &'static str {
    EXCEPTION_MESSAGES
        .get(vector as usize)
        .copied()
        .unwrap_or("Unknown Exception")
}

/// The scheduler's mechanism for redirecting the `iret` at the end of an
/// ISR onto a different task's frame, instead of resuming whatever was
/// interrupted. Set by `task::schedule_tick` from inside the timer
/// handler; consumed (and cleared) by `isr_dispatch` on every exit.
static NEXT_FRAME_OVERRIDE: Mutex<Option<u32>> = Mutex::new(None);

/// Request that the current ISR return into `frame` instead of the frame it
/// was entered with.
pub fn request_frame_switch(frame: *mut InterruptFrame) {
    *NEXT_FRAME_OVERRIDE.lock() = Some(frame as u32);
}

/// Called from `isr_common_stub` with a pointer to the just-saved register
/// frame. Returns the stack pointer `isr_common_stub` should restore from:
/// normally the same frame, or a different task's frame if the scheduler
/// requested a switch.
///
/// # Safety
/// Must only be called from `isr_common_stub` with a frame pointer it
/// actually owns.
#[no_mangle]
unsafe extern "C" fn isr_dispatch(frame: *mut InterruptFrame) -> u32 {
    let int_no = (*frame).int_no;

    let handler = HANDLERS.lock().handlers[int_no as usize];
    match handler {
        Some(handler) => handler(&mut *frame),
        None if int_no < FIRST_NON_EXCEPTION_VECTOR => {
            crate::panic::panic_with_frame(&*frame);
        }
        None => {}
    }

    if (PIC_1_OFFSET as u32..=(PIC_2_OFFSET as u32 + 7)).contains(&int_no) {
        PICS.lock().notify_end_of_interrupt(int_no as u8);
    }

    match NEXT_FRAME_OVERRIDE.lock().take() {
        Some(new_esp) => new_esp,
        None => frame as u32,
    }
}

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 }
    }

    fn gate(handler: u32, selector: u16, dpl: u8) -> Self {
        // 0x8E = present, ring0 interrupt gate; OR in the DPL bits (5-6) for
        // the one gate (syscall) user code is allowed to invoke directly.
        let type_attr = 0x8E | (dpl << 5);
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

struct Idt {
    entries: [IdtEntry; HANDLER_SLOTS],
}

lazy_static! {
    static ref IDT: Mutex<Idt> = Mutex::new(build_idt());
}

macro_rules! isr_addr {
    ($name:ident) => {{
        extern "C" {
            fn $name();
        }
        $name as u32
    }};
}

fn build_idt() -> Idt {
    let mut entries = [IdtEntry::missing(); HANDLER_SLOTS];

    macro_rules! set {
        ($vector:expr, $name:ident) => {
            entries[$vector] = IdtEntry::gate(isr_addr!($name), gdt::KERNEL_CODE_SELECTOR, 0);
        };
    }

    set!(0, isr0);
    set!(1, isr1);
    set!(2, isr2);
    set!(3, isr3);
    set!(4, isr4);
    set!(5, isr5);
    set!(6, isr6);
    set!(7, isr7);
    set!(8, isr8);
    set!(9, isr9);
    set!(10, isr10);
    set!(11, isr11);
    set!(12, isr12);
    set!(13, isr13);
    set!(14, isr14);
    set!(15, isr15);
    set!(16, isr16);
    set!(17, isr17);
    set!(18, isr18);
    set!(19, isr19);

    set!(32, irq0);
    set!(33, irq1);
    set!(34, irq2);
    set!(35, irq3);
    set!(36, irq4);
    set!(37, irq5);
    set!(38, irq6);
    set!(39, irq7);
    set!(40, irq8);
    set!(41, irq9);
    set!(42, irq10);
    set!(43, irq11);
    set!(44, irq12);
    set!(45, irq13);
    set!(46, irq14);
    set!(47, irq15);

    entries[0x80] = IdtEntry::gate(isr_addr!(isr128), gdt::KERNEL_CODE_SELECTOR, 3);

    Idt { entries }
}

/// Remap the PICs off their default (conflicting-with-exceptions) vectors,
/// install the IDT, and enable interrupts.
///
/// # Safety
/// Must run once, after `gdt::init`, with interrupts still disabled.
pub unsafe fn init() {
    let idt = &*IDT;
    let pointer = IdtPointer {
        limit: (size_of::<Idt>() - 1) as u16,
        base: &idt.lock().entries as *const _ as u32,
    };
    asm!("lidt [{ptr}]", ptr = in(reg) &raw const pointer);

    PICS.lock().initialize();
}

/// Enable maskable interrupts (`sti`).
///
/// # Safety
/// The IDT and PICs must already be initialized.
pub unsafe fn enable() {
    asm!("sti", options(nomem, nostack));
}

/// Disable maskable interrupts (`cli`).
///
/// # Safety
/// Caller is responsible for re-enabling them if needed.
pub unsafe fn disable() {
    asm!("cli", options(nomem, nostack));
}

macro_rules! isr_no_err {
    ($name:literal, $vector:literal) => {
        concat!(
            ".global ", $name, "\n",
            $name, ":\n",
            "    push 0\n",
            "    push ", $vector, "\n",
            "    jmp isr_common_stub\n",
        )
    };
}

macro_rules! isr_has_err {
    ($name:literal, $vector:literal) => {
        concat!(
            ".global ", $name, "\n",
            $name, ":\n",
            "    push ", $vector, "\n",
            "    jmp isr_common_stub\n",
        )
    };
}

global_asm!(
    ".section .text",
    isr_no_err!("isr0", 0),
    isr_no_err!("isr1", 1),
    isr_no_err!("isr2", 2),
    isr_no_err!("isr3", 3),
    isr_no_err!("isr4", 4),
    isr_no_err!("isr5", 5),
    isr_no_err!("isr6", 6),
    isr_no_err!("isr7", 7),
    isr_has_err!("isr8", 8),
    isr_no_err!("isr9", 9),
    isr_has_err!("isr10", 10),
    isr_has_err!("isr11", 11),
    isr_has_err!("isr12", 12),
    isr_has_err!("isr13", 13),
    isr_has_err!("isr14", 14),
    isr_no_err!("isr15", 15),
    isr_no_err!("isr16", 16),
    isr_no_err!("isr17", 17),
    isr_no_err!("isr18", 18),
    isr_no_err!("isr19", 19),
    isr_no_err!("irq0", 32),
    isr_no_err!("irq1", 33),
    isr_no_err!("irq2", 34),
    isr_no_err!("irq3", 35),
    isr_no_err!("irq4", 36),
    isr_no_err!("irq5", 37),
    isr_no_err!("irq6", 38),
    isr_no_err!("irq7", 39),
    isr_no_err!("irq8", 40),
    isr_no_err!("irq9", 41),
    isr_no_err!("irq10", 42),
    isr_no_err!("irq11", 43),
    isr_no_err!("irq12", 44),
    isr_no_err!("irq13", 45),
    isr_no_err!("irq14", 46),
    isr_no_err!("irq15", 47),
    isr_no_err!("isr128", 128),
    r#"
isr_common_stub:
    push ds
    push es
    push fs
    push gs
    pushad

    mov eax, esp
    push eax
    call isr_dispatch
    add esp, 4
    mov esp, eax

    popad
    pop gs
    pop fs
    pop es
    pop ds
    add esp, 8
    iretd
"#,
);
