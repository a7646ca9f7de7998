//! Per-process page directories, mapping, and the page-fault handler that
//! drives swap eviction (`spec.md` §4.2).
//!
//! `original_source/src/mem/paging.c` builds exactly one static identity
//! map for the whole 4 GiB space and never touches CR3 again. `spec.md`
//! needs a directory per task (`paging_clone`), demand mapping/unmapping,
//! and CLOCK-driven eviction under memory pressure — all absent from the
//! original — so only its register-level mechanics (`invlpg`, the CR0/CR3
//! asm) are reused; the structure above them is new.

use core::arch::asm;

use crate::config::{IDENTITY_MAP_LIMIT, PAGE_SIZE};
use crate::memory::pmm::{self, PhysFrame};
use crate::memory::swap;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

const ENTRIES: usize = 1024;
const PAGE_PRESENT: u32 = 1 << 0;
const PAGE_RW: u32 = 1 << 1;
const PAGE_USER: u32 = 1 << 2;
/// Marks a present-but-swapped-out entry so the fault handler can tell "not
/// mapped" from "paged out" apart (bit 9, one of the three OS-available
/// bits every x86 PTE reserves).
const PAGE_SWAPPED: u32 = 1 << 9;
/// Standard x86 PTE Accessed bit, set by the CPU on every translation and
/// cleared by software; the CLOCK eviction sweep's only signal.
const PAGE_ACCESSED: u32 = 1 << 5;

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Table([u32; ENTRIES]);

impl Table {
    const fn empty() -> Self {
        Table([0; ENTRIES])
    }
}

/// Number of 4 MiB page tables the kernel heap's reserved virtual range
/// spans (`HEAP_SIZE` / 4 MiB).
const HEAP_DIR_SPAN: usize = (crate::config::HEAP_SIZE as usize).div_ceil(PAGE_SIZE * ENTRIES);

/// The kernel heap's page tables, shared by every address space: every
/// `AddressSpace` points its heap-range directory entries at these same
/// physical tables, so growing the heap is visible everywhere without
/// having to walk and patch every task's directory.
static mut HEAP_TABLES: [Table; HEAP_DIR_SPAN] = [Table::empty(); HEAP_DIR_SPAN];

fn heap_table_phys(slot: usize) -> u32 {
    // SAFETY: access is serialized by the heap allocator's own lock; the
    // table's address never changes once linked into the binary.
    unsafe { core::ptr::addr_of!(HEAP_TABLES[slot]) as u32 }
}

fn heap_dir_base() -> usize {
    crate::config::HEAP_START as usize >> 22
}

/// `(directory_index, raw_entry)` pairs every address space copies in at
/// creation time so the kernel heap is reachable regardless of which
/// task's directory is loaded.
fn heap_directory_template() -> [(usize, u32); HEAP_DIR_SPAN] {
    core::array::from_fn(|slot| (heap_dir_base() + slot, heap_table_phys(slot) | PAGE_PRESENT | PAGE_RW))
}

/// Map one heap page. Called only by `memory::heap`, which serializes
/// access via its own lock.
pub fn map_heap_page(virt: u32, frame: PhysFrame) {
    let slot = (virt as usize >> 22) - heap_dir_base();
    let page_index = ((virt >> 12) & 0x3FF) as usize;
    // SAFETY: `slot`/`page_index` are in range because callers only grow
    // within `HEAP_SIZE`, and access is serialized by the heap's lock.
    unsafe {
        HEAP_TABLES[slot].0[page_index] = (frame.start_address() & !0xFFF) | PAGE_PRESENT | PAGE_RW;
    }
}

/// Unmap one heap page (`memory::heap`'s tail-trim).
pub fn unmap_heap_page(virt: u32) {
    let slot = (virt as usize >> 22) - heap_dir_base();
    let page_index = ((virt >> 12) & 0x3FF) as usize;
    // SAFETY: see `map_heap_page`.
    unsafe {
        HEAP_TABLES[slot].0[page_index] = 0;
    }
}

/// One process address space: a page directory plus the page tables it
/// references. Built fresh per task by `new_with_identity_map`, the 32-bit
/// analogue of `sched_spawn_user`'s directory-clone step.
pub struct AddressSpace {
    directory: alloc::boxed::Box<Table>,
    tables: alloc::vec::Vec<Option<alloc::boxed::Box<Table>>>,
    /// `(dir_index, page_index)` hand for the CLOCK eviction sweep
    /// (`evict_one`), persisted across calls so repeated evictions don't
    /// keep rescanning the same early entries.
    clock_hand: (usize, usize),
}

impl AddressSpace {
    /// Build a fresh address space with the low `IDENTITY_MAP_LIMIT` bytes
    /// identity-mapped (kernel code/data/heap all live below this line),
    /// and nothing else present.
    #[must_use]
    pub fn new_with_identity_map() -> Self {
        let mut tables: alloc::vec::Vec<Option<alloc::boxed::Box<Table>>> =
            alloc::vec::Vec::with_capacity(ENTRIES);
        for _ in 0..ENTRIES {
            tables.push(None);
        }
        let identity_dirs = (IDENTITY_MAP_LIMIT as usize).div_ceil(PAGE_SIZE * ENTRIES);
        let mut space = AddressSpace {
            directory: alloc::boxed::Box::new(Table::empty()),
            tables,
            clock_hand: (identity_dirs, 0),
        };
        for dir_index in 0..identity_dirs {
            for page_index in 0..ENTRIES {
                let phys = (dir_index * ENTRIES + page_index) * PAGE_SIZE;
                if phys as u32 >= IDENTITY_MAP_LIMIT {
                    break;
                }
                space.raw_map(dir_index, page_index, phys as u32, PageFlags::PRESENT | PageFlags::WRITABLE);
            }
        }
        for (dir_index, raw_entry) in heap_directory_template() {
            space.directory.0[dir_index] = raw_entry;
            // `tables[dir_index]` stays `None`: this entry is owned by the
            // shared `HEAP_TABLES`, not by this address space.
        }
        space
    }

    fn ensure_table(&mut self, dir_index: usize) -> &mut Table {
        if self.tables[dir_index].is_none() {
            self.tables[dir_index] = Some(alloc::boxed::Box::new(Table::empty()));
            self.directory.0[dir_index] = PAGE_PRESENT | PAGE_RW | PAGE_USER;
        }
        self.tables[dir_index].as_mut().unwrap()
    }

    fn raw_map(&mut self, dir_index: usize, page_index: usize, phys: u32, flags: PageFlags) {
        let entry_flags = to_raw_flags(flags);
        let table = self.ensure_table(dir_index);
        table.0[page_index] = (phys & !0xFFF) | entry_flags;
    }

    /// Map `virt` to `phys` with `flags`. Overwrites any existing mapping.
    pub fn map(&mut self, virt: u32, phys: PhysFrame, flags: PageFlags) {
        let dir_index = (virt >> 22) as usize;
        let page_index = ((virt >> 12) & 0x3FF) as usize;
        self.raw_map(dir_index, page_index, phys.start_address(), flags);
    }

    /// Remove whatever mapping `virt` has, if any.
    pub fn unmap(&mut self, virt: u32) {
        let dir_index = (virt >> 22) as usize;
        let page_index = ((virt >> 12) & 0x3FF) as usize;
        if let Some(table) = self.tables[dir_index].as_mut() {
            table.0[page_index] = 0;
        }
    }

    /// Mark `virt`'s entry as swapped-out, recording the swap slot so a
    /// later fault can bring it back.
    pub fn mark_swapped(&mut self, virt: u32, slot: u32) {
        let dir_index = (virt >> 22) as usize;
        let page_index = ((virt >> 12) & 0x3FF) as usize;
        if let Some(table) = self.tables[dir_index].as_mut() {
            table.0[page_index] = (slot << 12) | PAGE_SWAPPED;
        }
    }

    /// Look up the raw page-table entry for `virt`, if the directory has a
    /// table covering it.
    #[must_use]
    pub fn entry(&self, virt: u32) -> Option<u32> {
        let dir_index = (virt >> 22) as usize;
        let page_index = ((virt >> 12) & 0x3FF) as usize;
        self.tables[dir_index].as_ref().map(|t| t.0[page_index])
    }

    #[must_use]
    pub fn translate(&self, virt: u32) -> Option<u32> {
        let entry = self.entry(virt)?;
        if entry & PAGE_PRESENT == 0 {
            return None;
        }
        Some((entry & !0xFFF) | (virt & 0xFFF))
    }

    /// Physical address of the page directory, for loading into CR3.
    #[must_use]
    pub fn directory_phys(&self) -> u32 {
        &*self.directory as *const Table as u32
    }

    /// Release every frame this address space's user half (dynamically
    /// mapped pages outside the identity range and the shared heap
    /// tables) owns back to the PMM. Called once, when a task's address
    /// space is torn down (`spec.md` §3 "Address space" lifecycle:
    /// "destroyed only when no task references it").
    pub fn free_user_frames(&mut self) {
        let identity_dirs = (IDENTITY_MAP_LIMIT as usize).div_ceil(PAGE_SIZE * ENTRIES);
        let heap_dir_start = heap_dir_base();

        for dir_index in identity_dirs..ENTRIES {
            if (heap_dir_start..heap_dir_start + HEAP_DIR_SPAN).contains(&dir_index) {
                continue;
            }
            let Some(table) = self.tables[dir_index].as_ref() else { continue };
            for page_index in 0..ENTRIES {
                let entry = table.0[page_index];
                if entry & PAGE_PRESENT == 0 {
                    continue;
                }
                pmm::free_frame(PhysFrame::containing_address(entry & !0xFFF));
            }
        }
    }

    /// Deep-copy every present user-half mapping (below the heap's
    /// directory span) into a fresh address space, allocating an
    /// independent physical frame per page and copying its contents; the
    /// kernel half (identity map + heap tables) is shared by reference,
    /// same as `new_with_identity_map` sets up. Grounded on `spec.md`
    /// §4.2's "Address space" clone semantics.
    #[must_use]
    pub fn clone_user_half(&self) -> Option<Self> {
        let mut clone = Self::new_with_identity_map();
        let heap_dir_start = heap_dir_base();

        for dir_index in 0..ENTRIES {
            if (heap_dir_start..heap_dir_start + HEAP_DIR_SPAN).contains(&dir_index) {
                continue;
            }
            let Some(table) = self.tables[dir_index].as_ref() else { continue };
            for page_index in 0..ENTRIES {
                let entry = table.0[page_index];
                if entry & PAGE_PRESENT == 0 {
                    continue;
                }
                let src_phys = entry & !0xFFF;
                let flags = entry & 0xFFF;
                let dst_frame = pmm::alloc_frame()?;
                // SAFETY: `src_phys` is a live mapped frame in `self`;
                // `dst_frame` was just allocated and is not aliased yet.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src_phys as *const u8,
                        dst_frame.start_address() as *mut u8,
                        PAGE_SIZE,
                    );
                }
                clone.raw_map(dir_index, page_index, dst_frame.start_address(), raw_flags_to_page(flags));
            }
        }
        Some(clone)
    }

    fn advance_hand(&mut self) {
        let (dir, page) = &mut self.clock_hand;
        *page += 1;
        if *page >= ENTRIES {
            *page = 0;
            *dir = (*dir + 1) % ENTRIES;
        }
    }

    /// CLOCK-style single-hand eviction sweep over present, user-accessible
    /// PTEs (`spec.md` §4.2 "Eviction"): a set Accessed bit is cleared and
    /// the hand advances; the first entry found with the bit already clear
    /// is the victim. Bounded by `EVICTION_SCAN_LIMIT` to prevent livelock
    /// when nothing is evictable. Returns `true` if a page was evicted and
    /// its frame freed back to the PMM.
    fn evict_one(&mut self) -> bool {
        let heap_dir_start = heap_dir_base();

        for _ in 0..crate::config::EVICTION_SCAN_LIMIT {
            let (dir_index, page_index) = self.clock_hand;
            self.advance_hand();

            if (heap_dir_start..heap_dir_start + HEAP_DIR_SPAN).contains(&dir_index) {
                continue;
            }
            let Some(table) = self.tables[dir_index].as_mut() else { continue };
            let entry = table.0[page_index];
            if entry & PAGE_PRESENT == 0 || entry & PAGE_USER == 0 {
                continue;
            }
            if entry & PAGE_ACCESSED != 0 {
                table.0[page_index] = entry & !PAGE_ACCESSED;
                continue;
            }

            let virt = ((dir_index as u32) << 22) | ((page_index as u32) << 12);
            let phys = PhysFrame::containing_address(entry & !0xFFF);
            let Some(slot) = swap::swap_out(phys) else { continue };
            self.mark_swapped(virt, slot);
            // SAFETY: `virt` belongs to this address space's directory,
            // which is the one currently loaded into CR3 when eviction runs
            // (only the active space is ever swept, per the Open Question
            // decision in `DESIGN.md`).
            unsafe { invlpg(virt) };
            pmm::free_frame(phys);
            return true;
        }
        false
    }
}

/// Allocate a frame, attempting one eviction pass against `space` if the
/// PMM reports exhaustion (`spec.md` §4.2 "Eviction": "retrying once").
fn alloc_frame_or_evict(space: &mut AddressSpace) -> Option<PhysFrame> {
    if let Some(frame) = pmm::alloc_frame() {
        return Some(frame);
    }
    if space.evict_one() {
        return pmm::alloc_frame();
    }
    None
}

fn raw_flags_to_page(raw: u32) -> PageFlags {
    let mut flags = PageFlags::empty();
    if raw & PAGE_PRESENT != 0 {
        flags |= PageFlags::PRESENT;
    }
    if raw & PAGE_RW != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if raw & PAGE_USER != 0 {
        flags |= PageFlags::USER;
    }
    flags
}

fn to_raw_flags(flags: PageFlags) -> u32 {
    let mut raw = 0;
    if flags.contains(PageFlags::PRESENT) {
        raw |= PAGE_PRESENT;
    }
    if flags.contains(PageFlags::WRITABLE) {
        raw |= PAGE_RW;
    }
    if flags.contains(PageFlags::USER) {
        raw |= PAGE_USER;
    }
    raw
}

static BOOT_SPACE: spin::Mutex<Option<AddressSpace>> = spin::Mutex::new(None);

/// Build the boot address space (identity map + shared heap tables), load
/// it into CR3 and flip `CR0.PG` on. The boot task (`task::current() ==
/// None`) runs in this space for the rest of its life, the 32-bit analogue
/// of `original_source`'s single static identity map.
///
/// # Safety
/// Must run exactly once, after `memory::pmm::init` and `memory::heap::init`
/// (building the directory allocates from the heap), and before any other
/// address space is switched to.
pub unsafe fn init() {
    let space = AddressSpace::new_with_identity_map();
    switch_directory(&space);
    *BOOT_SPACE.lock() = Some(space);
}

/// Load the boot address space into CR3. Used when a task that owns its
/// own directory is torn down while that directory may still be the one
/// loaded: there must be a valid directory in CR3 before its frames are
/// freed back to the PMM (`spec.md`:200(d), "destroy the currently active
/// address space").
///
/// # Safety
/// `init` must already have run.
pub unsafe fn switch_to_boot_space() {
    let boot = BOOT_SPACE.lock();
    if let Some(space) = boot.as_ref() {
        switch_directory(space);
    }
}

/// Run `f` against the currently active address space: the running task's,
/// if it has one, otherwise the boot space. Kernel tasks have no address
/// space of their own and fall back to the boot space too.
///
/// Interrupt handlers only ever run with interrupts disabled on this
/// single-core kernel, so a task's address space cannot be torn down while
/// its pointer is in use here.
pub fn with_current<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> R {
    match crate::task::current_address_space_ptr() {
        // SAFETY: see function doc comment.
        Some(ptr) => f(unsafe { &mut *ptr }),
        None => {
            let mut boot = BOOT_SPACE.lock();
            f(boot.as_mut().expect("boot space initialized before first fault"))
        }
    }
}

/// Page-fault handler registered on vector 14 (`spec.md` §4.2). Dispatches
/// into [`handle_page_fault`] against whichever address space is current.
pub fn page_fault_handler(frame: &mut crate::interrupts::InterruptFrame) {
    with_current(|space| handle_page_fault(frame, space));
}

/// Invalidate the TLB entry for `virt`.
///
/// # Safety
/// Must only be called with the directory currently loaded into CR3
/// actually owning `virt`'s mapping.
pub unsafe fn invlpg(virt: u32) {
    asm!("invlpg [{addr}]", addr = in(reg) virt, options(nostack, preserves_flags));
}

/// Load `space` into CR3 and enable paging if it wasn't already.
///
/// # Safety
/// `space` must outlive every subsequent access through this directory.
pub unsafe fn switch_directory(space: &AddressSpace) {
    let phys = space.directory_phys();
    let mut cr0: u32;
    asm!("mov cr3, {phys}", "mov {cr0}, cr0", phys = in(reg) phys, cr0 = out(reg) cr0, options(nostack));
    cr0 |= 0x8000_0000;
    asm!("mov cr0, {cr0}", cr0 = in(reg) cr0, options(nostack));
}

/// The page-fault handler (vector 14). Reads CR2 for the faulting address
/// and dispatches in the priority order `spec.md` §4.2 specifies:
///
/// 1. Swapped PTE: bring the page back in from the backing device.
/// 2. Not-present, user-mode access: demand-zero a fresh frame.
/// 3. Anything else is a genuine fault and panics via the shared
///    `panic::panic_with_frame` path, same as every other unhandled
///    exception.
pub fn handle_page_fault(frame: &mut crate::interrupts::InterruptFrame, current: &mut AddressSpace) {
    let cr2: u32;
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    let virt_page = cr2 & !0xFFF;
    const ERR_PRESENT: u32 = 1 << 0;
    const ERR_USER: u32 = 1 << 2;
    let user_mode_fault = frame.err_code & ERR_USER != 0;
    let not_present_fault = frame.err_code & ERR_PRESENT == 0;

    match current.entry(virt_page) {
        Some(entry) if entry & PAGE_SWAPPED != 0 => {
            let slot = entry >> 12;
            match alloc_frame_or_evict(current) {
                Some(frame_phys) => {
                    swap::swap_in(slot, frame_phys);
                    current.map(virt_page, frame_phys, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
                    // SAFETY: virt_page belongs to the currently loaded directory.
                    unsafe {
                        invlpg(virt_page);
                    }
                }
                None => crate::panic::panic_with_frame(frame),
            }
        }
        _ if not_present_fault && user_mode_fault => match alloc_frame_or_evict(current) {
            Some(frame_phys) => {
                // SAFETY: `frame_phys` was just allocated and is not yet
                // mapped anywhere else.
                unsafe {
                    core::ptr::write_bytes(frame_phys.start_address() as *mut u8, 0, PAGE_SIZE);
                }
                current.map(virt_page, frame_phys, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
                // SAFETY: virt_page belongs to the currently loaded directory.
                unsafe {
                    invlpg(virt_page);
                }
            }
            None => crate::panic::panic_with_frame(frame),
        },
        _ => crate::panic::panic_with_frame(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn identity_map_resolves_low_memory() {
        let space = AddressSpace::new_with_identity_map();
        assert_eq!(space.translate(0x1000), Some(0x1000));
    }

    #[test_case]
    fn map_and_unmap_round_trip() {
        let mut space = AddressSpace::new_with_identity_map();
        let frame = PhysFrame(5000);
        space.map(0x5000_0000, frame, PageFlags::PRESENT | PageFlags::WRITABLE);
        assert_eq!(space.translate(0x5000_0000), Some(frame.start_address()));
        space.unmap(0x5000_0000);
        assert_eq!(space.translate(0x5000_0000), None);
    }

    #[test_case]
    fn clone_user_half_copies_independent_frames() {
        let mut space = AddressSpace::new_with_identity_map();
        let frame = pmm::alloc_frame().expect("frame available");
        space.map(0x4000_0000, frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
        // SAFETY: frame was just mapped writable in `space`.
        unsafe {
            core::ptr::write_bytes(frame.start_address() as *mut u8, 0xAB, 1);
        }

        let clone = space.clone_user_half().expect("clone succeeds");
        let clone_phys = clone.translate(0x4000_0000).expect("clone has the mapping");
        assert_ne!(clone_phys & !0xFFF, frame.start_address());
        // SAFETY: clone_phys is a live frame identity-mapped below IDENTITY_MAP_LIMIT.
        let byte = unsafe { core::ptr::read(clone_phys as *const u8) };
        assert_eq!(byte, 0xAB);
    }

    #[test_case]
    fn mark_swapped_clears_present_bit() {
        let mut space = AddressSpace::new_with_identity_map();
        let frame = PhysFrame(42);
        space.map(0x6000_0000, frame, PageFlags::PRESENT | PageFlags::WRITABLE);
        space.mark_swapped(0x6000_0000, 7);
        assert_eq!(space.translate(0x6000_0000), None);
        assert_eq!(space.entry(0x6000_0000).unwrap() >> 12, 7);
    }
}
