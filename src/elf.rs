//! ELF32 validation and `PT_LOAD` segment mapping (`spec.md` §4.3, "ELF
//! image").
//!
//! Grounded on `original_source/src/fs/elf.c`'s `elf_validate`/`elf_load`:
//! same header checks and `PT_LOAD` walk. Two bugs are not carried over:
//! the original sizes a loaded file with `strlen`, which truncates at the
//! first zero byte in a binary image, so `load` here takes an explicit
//! `&[u8]` with a real length; and it maps each page at
//! `paging_virt_to_phys(kmalloc(0x1000))`, treating a *kernel heap
//! pointer* as if it were a physical address, which is only ever true by
//! accident of the original's identity-mapped layout — this allocates one
//! real frame per page from the PMM and maps that instead.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::memory::paging::{AddressSpace, PageFlags};
use crate::memory::pmm::{self, PhysFrame};

/// Resolves a path to the bytes of an ELF image. Filesystem lookup is out
/// of scope (`spec.md` §1 Non-goals); this is the narrow interface a
/// concrete filesystem or in-memory image table plugs into, the same way
/// `original_source/src/fs/fs.c`'s `fs_find` is the one thing
/// `elf_load` depends on outside of ELF parsing itself.
pub trait ImageSource: Send {
    fn resolve(&self, path: &str) -> Option<Vec<u8>>;
}

static IMAGE_SOURCE: Mutex<Option<Box<dyn ImageSource>>> = Mutex::new(None);

/// Install the resolver `EXEC`/`spawn_elf` use to turn a path into bytes.
pub fn set_image_source(source: Box<dyn ImageSource>) {
    *IMAGE_SOURCE.lock() = Some(source);
}

/// Look up `path` through the installed [`ImageSource`], if any.
#[must_use]
pub fn resolve_image(path: &str) -> Option<Vec<u8>> {
    IMAGE_SOURCE.lock().as_ref()?.resolve(path)
}

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooSmall,
    BadMagic,
    NotElfClass32,
    NotLittleEndian,
    NotExecutable,
    NotX86,
    PhdrOutOfBounds,
    OutOfMemory,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Elf32Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

/// Check the ELF32/EM_386/ET_EXEC header fields `original_source` checks,
/// in the same order so the first failure reported matches.
pub fn validate(data: &[u8]) -> Result<(), ElfError> {
    if data.len() < core::mem::size_of::<Elf32Ehdr>() {
        return Err(ElfError::TooSmall);
    }
    if data[0] != 0x7F || data[1] != b'E' || data[2] != b'L' || data[3] != b'F' {
        return Err(ElfError::BadMagic);
    }
    if data[EI_CLASS] != ELFCLASS32 {
        return Err(ElfError::NotElfClass32);
    }
    if data[EI_DATA] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    // SAFETY: length checked above, and the struct is packed so reading
    // through an unaligned pointer into it is sound.
    let ehdr = unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<Elf32Ehdr>()) };
    if ehdr.e_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    if ehdr.e_machine != EM_386 {
        return Err(ElfError::NotX86);
    }
    Ok(())
}

/// One loaded segment's frames, tracked so a task's address space can be
/// torn down cleanly — unlike `elf_unload`, which the original left as a
/// stub.
pub struct LoadedSegment {
    pub frames: Vec<PhysFrame>,
}

pub struct LoadedImage {
    pub entry_point: u32,
    pub segments: Vec<LoadedSegment>,
}

/// Validate `data` and map its `PT_LOAD` segments into `space`, copying
/// file bytes in and zeroing the BSS tail of each segment.
///
/// # Errors
/// Any `ElfError` from [`validate`], `PhdrOutOfBounds` if the program
/// header table runs past the end of `data`, or `OutOfMemory` if a frame
/// cannot be allocated for a segment page.
pub fn load(data: &[u8], space: &mut AddressSpace) -> Result<LoadedImage, ElfError> {
    validate(data)?;
    // SAFETY: `validate` checked `data` is at least one header long.
    let ehdr = unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<Elf32Ehdr>()) };

    let phdr_size = core::mem::size_of::<Elf32Phdr>();
    let phdr_table_end = ehdr.e_phoff as usize + phdr_size * ehdr.e_phnum as usize;
    if phdr_table_end > data.len() {
        return Err(ElfError::PhdrOutOfBounds);
    }

    let mut segments = Vec::new();
    for i in 0..ehdr.e_phnum as usize {
        let offset = ehdr.e_phoff as usize + i * phdr_size;
        // SAFETY: bounds checked above; the struct is packed.
        let phdr = unsafe { core::ptr::read_unaligned(data[offset..].as_ptr().cast::<Elf32Phdr>()) };
        if phdr.p_type != PT_LOAD {
            continue;
        }
        segments.push(load_segment(data, &phdr, space)?);
    }

    Ok(LoadedImage { entry_point: ehdr.e_entry, segments })
}

fn load_segment(data: &[u8], phdr: &Elf32Phdr, space: &mut AddressSpace) -> Result<LoadedSegment, ElfError> {
    let page_base = phdr.p_vaddr & !0xFFF;
    let num_pages = (phdr.p_memsz as usize).div_ceil(PAGE_SIZE).max(1);

    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if phdr.p_flags & PF_W != 0 {
        flags |= PageFlags::WRITABLE;
    }

    let mut frames = Vec::with_capacity(num_pages);
    for page in 0..num_pages {
        let frame = pmm::alloc_frame().ok_or_else(|| {
            for f in &frames {
                pmm::free_frame(*f);
            }
            ElfError::OutOfMemory
        })?;
        space.map(page_base + (page * PAGE_SIZE) as u32, frame, flags);
        frames.push(frame);

        // SAFETY: `frame` was just mapped writable for this copy/zero and
        // belongs to no one else yet; we restore the caller's requested
        // flags afterward if it should have been read-only.
        let dst = frame.start_address() as *mut u8;
        unsafe {
            core::ptr::write_bytes(dst, 0, PAGE_SIZE);
        }
    }

    if phdr.p_filesz > 0 {
        let src = &data[phdr.p_offset as usize..(phdr.p_offset + phdr.p_filesz) as usize];
        let page_offset_in_segment = (phdr.p_vaddr - page_base) as usize;

        // `frames` are allocated one at a time from the PMM and are not
        // necessarily physically contiguous, so each page's share of `src`
        // is copied into that page's own frame rather than through one
        // pointer derived from `frames[0]`.
        for (page_index, frame) in frames.iter().enumerate() {
            let page_voff_start = page_index * PAGE_SIZE;
            let page_voff_end = page_voff_start + PAGE_SIZE;
            let seg_start = page_offset_in_segment;
            let seg_end = page_offset_in_segment + src.len();

            let overlap_start = page_voff_start.max(seg_start);
            let overlap_end = page_voff_end.min(seg_end);
            if overlap_start >= overlap_end {
                continue;
            }

            let src_range = (overlap_start - seg_start)..(overlap_end - seg_start);
            let dst_offset = overlap_start - page_voff_start;

            // SAFETY: `frame` was just allocated and zeroed above for this
            // copy; `dst_offset + src_range.len()` never exceeds `PAGE_SIZE`.
            unsafe {
                let dst = (frame.start_address() as usize + dst_offset) as *mut u8;
                core::ptr::copy_nonoverlapping(src[src_range].as_ptr(), dst, overlap_end - overlap_start);
            }
        }
    }

    Ok(LoadedSegment { frames })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn make_header(e_type: u16, e_machine: u16, phnum: u16, phoff: u32) -> Vec<u8> {
        let mut buf = vec![0u8; core::mem::size_of::<Elf32Ehdr>()];
        buf[0] = 0x7F;
        buf[1] = b'E';
        buf[2] = b'L';
        buf[3] = b'F';
        buf[EI_CLASS] = ELFCLASS32;
        buf[EI_DATA] = ELFDATA2LSB;
        let ehdr = Elf32Ehdr {
            e_ident: buf[..16].try_into().unwrap(),
            e_type,
            e_machine,
            e_version: 1,
            e_entry: 0x1000,
            e_phoff: phoff,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: core::mem::size_of::<Elf32Ehdr>() as u16,
            e_phentsize: core::mem::size_of::<Elf32Phdr>() as u16,
            e_phnum: phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        // SAFETY: `buf` is exactly `size_of::<Elf32Ehdr>()` bytes.
        unsafe {
            core::ptr::write_unaligned(buf.as_mut_ptr().cast::<Elf32Ehdr>(), ehdr);
        }
        buf
    }

    #[test_case]
    fn too_small_is_rejected() {
        assert_eq!(validate(&[0u8; 4]), Err(ElfError::TooSmall));
    }

    #[test_case]
    fn bad_magic_is_rejected() {
        let mut buf = make_header(ET_EXEC, EM_386, 0, 0);
        buf[0] = 0;
        assert_eq!(validate(&buf), Err(ElfError::BadMagic));
    }

    #[test_case]
    fn non_executable_type_is_rejected() {
        let buf = make_header(1, EM_386, 0, 0);
        assert_eq!(validate(&buf), Err(ElfError::NotExecutable));
    }

    #[test_case]
    fn wrong_machine_is_rejected() {
        let buf = make_header(ET_EXEC, 0x3E, 0, 0);
        assert_eq!(validate(&buf), Err(ElfError::NotX86));
    }

    #[test_case]
    fn valid_header_with_no_segments_loads_empty() {
        let buf = make_header(ET_EXEC, EM_386, 0, core::mem::size_of::<Elf32Ehdr>() as u32);
        let mut space = AddressSpace::new_with_identity_map();
        let image = load(&buf, &mut space).expect("loads");
        assert_eq!(image.entry_point, 0x1000);
        assert!(image.segments.is_empty());
    }

    #[test_case]
    fn phdr_table_past_end_of_file_is_rejected() {
        let buf = make_header(ET_EXEC, EM_386, 1, 1_000_000);
        let mut space = AddressSpace::new_with_identity_map();
        assert_eq!(load(&buf, &mut space).unwrap_err(), ElfError::PhdrOutOfBounds);
    }
}
