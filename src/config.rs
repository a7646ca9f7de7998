//! Compile-time layout and tuning constants.
//!
//! Grouped in one place the way the teacher crate groups its heap constants
//! in `allocator.rs`; this is the kernel's only form of "configuration" since
//! there is no runtime config file in a freestanding 32-bit image.

/// Size of a physical frame / virtual page, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// Base of the higher half. Everything at or above this address is kernel.
pub const KERNEL_VIRT_BASE: u32 = 0xC000_0000;

/// First byte of the identity-mapped low 16 MiB region (spec.md §6).
pub const IDENTITY_MAP_LIMIT: u32 = 0x0100_0000;

/// Lower bound on the first frame the PMM will ever hand out: the 1 MiB
/// mark, so firmware and the early kernel image are never reclaimed even on
/// machines with a tiny usable region reported below it.
pub const MIN_USABLE_FRAME: u32 = 0x0010_0000;

/// Start of the kernel heap's virtual region.
pub const HEAP_START: u32 = 0xC100_0000;

/// Size of the kernel heap's virtual region (grows on demand up to this).
pub const HEAP_SIZE: u32 = 0x0100_0000;

/// Minimum leftover size (beyond the header) to justify splitting a block.
pub const HEAP_MIN_SPLIT: usize = 32;

/// Maximum number of task-table slots (`spec.md` §3 "Task").
pub const MAX_TASKS: usize = 32;

/// Size of each task's kernel stack, in bytes.
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE * 4;

/// Size of each task's user stack, in bytes.
pub const USER_STACK_SIZE: usize = PAGE_SIZE * 4;

/// Lowest valid user virtual address (`spec.md` §6).
pub const USER_SPACE_START: u32 = 0x0040_0000;

/// Highest valid user virtual address, exclusive (`spec.md` §6).
pub const USER_SPACE_END: u32 = 0xC000_0000;

/// Top of the user stack region for ELF-spawned tasks.
pub const ELF_USER_STACK_TOP: u32 = KERNEL_VIRT_BASE - PAGE_SIZE as u32;

/// Number of pages reserved for an ELF task's initial user stack.
pub const ELF_USER_STACK_PAGES: usize = 4;

/// Timer frequency, in Hz (`spec.md` GLOSSARY "Tick").
pub const TIMER_HZ: u32 = 100;

/// Page-sized swap slots available on the configured block device.
pub const SWAP_SLOT_COUNT: usize = 4096;

/// Sectors of the backing block device consumed by one swap slot (4 KiB / 512 B).
pub const SWAP_SECTORS_PER_SLOT: u32 = 8;

/// First sector of the swap region on the backing block device.
pub const SWAP_START_SECTOR: u64 = 409_600;

/// Maximum number of live shared-memory regions.
pub const SHM_MAX_REGIONS: usize = 128;

/// Bound on the eviction clock sweep before giving up (livelock guard).
pub const EVICTION_SCAN_LIMIT: usize = 4096;
