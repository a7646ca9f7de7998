//! Multiboot v1 info structure (`spec.md` §6, boot info).
//!
//! The corpus has no crate for this — the 64-bit examples either hand a
//! pre-parsed `BootInfo` from the `bootloader` crate (not usable on a 32-bit
//! protected-mode target) or parse multiboot2 (a different, larger struct).
//! This is a minimal hand-rolled reader of the fields the kernel actually
//! consumes: basic memory sizes and the memory map.

use core::marker::PhantomData;

bitflags::bitflags! {
    /// Which optional fields of `MultibootInfoRaw` the bootloader filled in.
    #[derive(Clone, Copy, Debug)]
    pub struct InfoFlags: u32 {
        const MEM_BASIC = 1 << 0;
        const BOOT_DEVICE = 1 << 1;
        const CMDLINE = 1 << 2;
        const MODS = 1 << 3;
        const AOUT_SYMS = 1 << 4;
        const ELF_SHDR = 1 << 5;
        const MEM_MAP = 1 << 6;
        const DRIVES = 1 << 7;
        const CONFIG_TABLE = 1 << 8;
        const BOOTLOADER_NAME = 1 << 9;
        const APM_TABLE = 1 << 10;
        const VBE = 1 << 11;
        const FRAMEBUFFER = 1 << 12;
    }
}

/// The raw struct GRUB (or any multiboot v1 loader) leaves at `ebx`.
#[repr(C)]
pub struct MultibootInfoRaw {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
    drives_length: u32,
    drives_addr: u32,
    config_table: u32,
    boot_loader_name: u32,
    apm_table: u32,
    vbe_control_info: u32,
    vbe_mode_info: u32,
    vbe_mode: u16,
    vbe_interface_seg: u16,
    vbe_interface_off: u16,
    vbe_interface_len: u16,
}

/// A type-checked handle to the multiboot info block passed by the loader.
///
/// Wraps the raw pointer so the rest of the kernel never deals with the
/// struct's partially-valid-depending-on-`flags` layout directly.
pub struct MultibootInfo {
    raw: *const MultibootInfoRaw,
    _not_send: PhantomData<*const ()>,
}

impl MultibootInfo {
    /// # Safety
    /// `ptr` must point at a valid multiboot v1 info struct for the
    /// lifetime of the returned value, as handed to `_start` in `ebx`.
    pub unsafe fn from_ptr(ptr: *const u32) -> Self {
        MultibootInfo {
            raw: ptr.cast(),
            _not_send: PhantomData,
        }
    }

    fn flags(&self) -> InfoFlags {
        InfoFlags::from_bits_truncate(unsafe { (*self.raw).flags })
    }

    /// Basic memory size fields (KiB below 1 MiB, KiB above 1 MiB). Present
    /// on every sane multiboot loader; `None` only if the loader lied about
    /// `MEM_BASIC` in its flags.
    pub fn basic_memory_kib(&self) -> Option<(u32, u32)> {
        if !self.flags().contains(InfoFlags::MEM_BASIC) {
            return None;
        }
        let raw = unsafe { &*self.raw };
        Some((raw.mem_lower, raw.mem_upper))
    }

    /// Iterate the BIOS memory map, if the loader provided one.
    pub fn memory_map(&self) -> Option<MemoryMapIter> {
        if !self.flags().contains(InfoFlags::MEM_MAP) {
            return None;
        }
        let raw = unsafe { &*self.raw };
        Some(MemoryMapIter {
            cursor: raw.mmap_addr as usize,
            end: (raw.mmap_addr + raw.mmap_length) as usize,
        })
    }
}

/// One entry of the BIOS-provided memory map (`spec.md` §6, Memory region).
#[derive(Clone, Copy, Debug)]
pub struct MemoryMapEntry {
    pub base_addr: u64,
    pub length: u64,
    pub region_type: MemoryRegionType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRegionType {
    Usable,
    Reserved,
}

impl MemoryRegionType {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => MemoryRegionType::Usable,
            _ => MemoryRegionType::Reserved,
        }
    }
}

#[repr(C, packed)]
struct RawMmapEntry {
    size: u32,
    base_addr: u64,
    length: u64,
    region_type: u32,
}

pub struct MemoryMapIter {
    cursor: usize,
    end: usize,
}

impl Iterator for MemoryMapIter {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<MemoryMapEntry> {
        if self.cursor >= self.end {
            return None;
        }
        let entry_ptr = self.cursor as *const RawMmapEntry;
        let entry = unsafe { core::ptr::read_unaligned(entry_ptr) };
        // The `size` field does not include itself; the next entry starts
        // `size + 4` bytes after this one's start.
        self.cursor += entry.size as usize + core::mem::size_of::<u32>();
        Some(MemoryMapEntry {
            base_addr: entry.base_addr,
            length: entry.length,
            region_type: MemoryRegionType::from_raw(entry.region_type),
        })
    }
}
