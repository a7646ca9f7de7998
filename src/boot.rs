//! Multiboot v1 header and entry-point trampoline.
//!
//! Grounded on the teacher's `entry_point.rs` (the `_start` → `kernel_main`
//! naming split) but replacing its `bootloader`-crate `entry_point!` macro,
//! which only targets 64-bit long mode, with a hand-written multiboot v1
//! header and asm trampoline — the same shape `original_source`'s own
//! boot assembly takes before it lands in `kernel_main`.
//!
//! `linker.ld` pins `_start` as the ELF entry symbol (`ENTRY(_start)`), so
//! exactly one object linked into a given binary may define it. That rules
//! out emitting it unconditionally from this library: `pen_os`'s own
//! `main.rs` and every integration test under `tests/` link this crate, and
//! each needs its *own* entry glue calling its own top-level function. The
//! [`entry_point!`] macro is how each of them gets one without colliding.

/// The bootloader-observed magic value handed back in `eax` (`spec.md` §6).
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Expand, at the invoking crate's root, to the `.multiboot_header`
/// section, the `_start` trampoline, and an `extern "C"` wrapper that turns
/// the raw `(magic, mb_info_ptr)` pair `_start` receives off the stack into
/// a [`crate::multiboot::MultibootInfo`] and calls `$handler(magic,
/// mb_info)`. `$handler` must never return.
///
/// Invoke this exactly once, at the top level of a binary crate (never
/// from inside `pen_os` itself):
///
/// ```ignore
/// pen_os::entry_point!(my_kernel_main);
///
/// fn my_kernel_main(magic: u32, mb_info: pen_os::multiboot::MultibootInfo) -> ! {
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! entry_point {
    ($handler:path) => {
        const MULTIBOOT_MAGIC: u32 = 0x1BAD_B002;
        const MULTIBOOT_FLAGS: u32 = 0x0000_0003; // align modules on page boundaries + provide mem_*
        const MULTIBOOT_CHECKSUM: u32 = (0u32)
            .wrapping_sub(MULTIBOOT_MAGIC)
            .wrapping_sub(MULTIBOOT_FLAGS);

        core::arch::global_asm!(
            r#"
.section .multiboot_header
.align 4
    .long {magic}
    .long {flags}
    .long {checksum}

.section .text
.global _start
.type _start, @function
_start:
    mov esp, offset boot_stack_top
    push ebx            // multiboot info pointer
    push eax             // bootloader magic
    call {kernel_entry}
.hang:
    cli
    hlt
    jmp .hang

.section .bss
.align 16
boot_stack_bottom:
    .skip 4096 * 4
boot_stack_top:
"#,
            magic = const MULTIBOOT_MAGIC,
            flags = const MULTIBOOT_FLAGS,
            checksum = const MULTIBOOT_CHECKSUM,
            kernel_entry = sym kernel_entry,
        );

        /// Lands with the raw `(magic, mb_info_ptr)` pair still on the
        /// stack as pushed by `_start`; re-exposes them as Rust values and
        /// hands off to the configured handler.
        extern "C" fn kernel_entry(magic: u32, mb_info_ptr: *const u32) -> ! {
            // SAFETY: `mb_info_ptr` is the real multiboot info pointer
            // handed to `_start` by the bootloader.
            let mb_info = unsafe { $crate::multiboot::MultibootInfo::from_ptr(mb_info_ptr) };
            $handler(magic, mb_info)
        }
    };
}
