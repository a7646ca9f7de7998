//! Synthetic interrupt-frame construction for spawning kernel and user
//! tasks, and the trampoline every new task's frame first resumes into.
//!
//! The teacher's `userspace/process.rs` switches to ring 3 with a
//! dedicated naked `switch_to_user_mode` function that builds an `iretq`
//! frame on the current stack and never returns until `sys_exit` restores
//! a saved kernel RSP. That approach assumes one foreground process and
//! one kernel stack frame to unwind back into. `spec.md`'s scheduler
//! instead treats *every* task switch uniformly: a task starts, continues
//! or ends by having its `InterruptFrame` resumed through the shared
//! `isr_common_stub`/`iretd` exit path (`interrupts.rs`), whether it is
//! entering ring 0 or ring 3. So there is no analogue of
//! `switch_to_user_mode` here — `task::spawn_*` builds the frame directly,
//! the same way `original_source/src/sched/sched.c`'s `spawn_task` /
//! `sched_spawn_user` / `sched_spawn_elf` do, and the timer tick's normal
//! `iretd` performs the transition.

use crate::config::{KERNEL_STACK_SIZE, USER_STACK_SIZE};
use crate::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::interrupts::InterruptFrame;

/// `EFLAGS` with only the interrupt-enable bit set, the value every fresh
/// task frame starts with so its trampoline runs with interrupts on.
const EFLAGS_IF: u32 = 0x202;

/// Build the initial frame for a kernel task. `entry` is resumed directly:
/// `eip` is set to `entry`'s address and `eflags` has the interrupt-enable
/// bit pre-set, so the first `iretd` that loads this frame both enables
/// interrupts and jumps straight to `entry`, with no trampoline indirection
/// in between.
#[must_use]
pub fn kernel_frame(entry: extern "C" fn() -> !, stack_top: u32) -> InterruptFrame {
    InterruptFrame {
        edi: 0,
        esi: 0,
        ebp: stack_top,
        esp_kernel: stack_top,
        ebx: 0,
        edx: 0,
        ecx: 0,
        eax: 0,
        gs: KERNEL_DATA_SELECTOR as u32,
        fs: KERNEL_DATA_SELECTOR as u32,
        es: KERNEL_DATA_SELECTOR as u32,
        ds: KERNEL_DATA_SELECTOR as u32,
        int_no: 0,
        err_code: 0,
        eip: entry as usize as u32,
        cs: KERNEL_CODE_SELECTOR as u32,
        eflags: EFLAGS_IF,
        useresp: stack_top,
        ss: KERNEL_DATA_SELECTOR as u32,
    }
}

/// Build the initial frame for a ring-3 task resuming at `entry` with a
/// fresh top-of-stack `user_stack_top` in its own address space.
#[must_use]
pub fn user_frame(entry: u32, user_stack_top: u32) -> InterruptFrame {
    InterruptFrame {
        edi: 0,
        esi: 0,
        ebp: user_stack_top,
        esp_kernel: 0,
        ebx: 0,
        edx: 0,
        ecx: 0,
        eax: 0,
        gs: USER_DATA_SELECTOR as u32,
        fs: USER_DATA_SELECTOR as u32,
        es: USER_DATA_SELECTOR as u32,
        ds: USER_DATA_SELECTOR as u32,
        int_no: 0,
        err_code: 0,
        eip: entry,
        cs: USER_CODE_SELECTOR as u32,
        eflags: EFLAGS_IF,
        useresp: user_stack_top,
        ss: USER_DATA_SELECTOR as u32,
    }
}

/// Default kernel-task stack size, re-exported for `task::mod` so both
/// agree on allocation size without a second constant.
#[must_use]
pub const fn kernel_stack_size() -> usize {
    KERNEL_STACK_SIZE
}

/// Default user-task stack size.
#[must_use]
pub const fn user_stack_size() -> usize {
    USER_STACK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy_entry() -> ! {
        loop {}
    }

    #[test_case]
    fn kernel_frame_uses_kernel_selectors() {
        let frame = kernel_frame(dummy_entry, 0x1000);
        assert_eq!(frame.cs, KERNEL_CODE_SELECTOR as u32);
        assert_eq!(frame.ds, KERNEL_DATA_SELECTOR as u32);
        assert_eq!(frame.eflags & EFLAGS_IF, EFLAGS_IF);
    }

    #[test_case]
    fn user_frame_uses_user_selectors_and_entry() {
        let frame = user_frame(0x40_0000, 0x80_0000);
        assert_eq!(frame.cs, USER_CODE_SELECTOR as u32);
        assert_eq!(frame.ss, USER_DATA_SELECTOR as u32);
        assert_eq!(frame.eip, 0x40_0000);
        assert_eq!(frame.useresp, 0x80_0000);
    }
}
