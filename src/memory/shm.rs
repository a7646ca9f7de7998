//! Shared memory regions keyed by id (`spec.md` §4.1, "Shared memory
//! region").
//!
//! Grounded on `original_source/src/mem/shm.c`: `SHM_MAX_REGIONS`,
//! `SHM_CREAT`/`SHM_EXCL` semantics, the `0xA0000000 + id*0x100000`
//! attach-address default. The original stores its page list by
//! "`kmalloc`'ing an array and stashing the pointer in `phys_start`" (its
//! own comment calls this a hack); here each region just owns a real
//! `Vec<PhysFrame>`, and `detach` actually releases frames on the last
//! reference instead of being a no-op stub.

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{PAGE_SIZE, SHM_MAX_REGIONS};
use crate::memory::paging::{AddressSpace, PageFlags};
use crate::memory::pmm::{self, PhysFrame};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct ShmFlags: u32 {
        const CREAT = 0x01;
        const EXCL = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    AlreadyExists,
    NotFound,
    OutOfRegions,
    OutOfMemory,
}

struct ShmRegion {
    id: u32,
    key: u32,
    size: usize,
    pages: Vec<PhysFrame>,
    owner_pid: u32,
    ref_count: u32,
}

struct ShmTable {
    regions: Vec<ShmRegion>,
    next_id: u32,
}

impl ShmTable {
    const fn new() -> Self {
        ShmTable { regions: Vec::new(), next_id: 1 }
    }

    fn find_by_key(&self, key: u32) -> Option<usize> {
        self.regions.iter().position(|r| r.key == key)
    }

    fn find_by_id(&self, id: u32) -> Option<usize> {
        self.regions.iter().position(|r| r.id == id)
    }
}

static TABLE: Mutex<ShmTable> = Mutex::new(ShmTable::new());

/// Find-or-create a shared-memory region identified by `key`.
///
/// # Errors
/// `AlreadyExists` if `CREAT|EXCL` is set and `key` is already registered;
/// `NotFound` if `CREAT` is not set and `key` has no region;
/// `OutOfRegions`/`OutOfMemory` if the table or backing frames are
/// exhausted.
pub fn shm_get(key: u32, size: usize, flags: ShmFlags, owner_pid: u32) -> Result<u32, ShmError> {
    let mut table = TABLE.lock();

    if let Some(index) = table.find_by_key(key) {
        if flags.contains(ShmFlags::CREAT) && flags.contains(ShmFlags::EXCL) {
            return Err(ShmError::AlreadyExists);
        }
        return Ok(table.regions[index].id);
    }

    if !flags.contains(ShmFlags::CREAT) {
        return Err(ShmError::NotFound);
    }
    if table.regions.len() >= SHM_MAX_REGIONS {
        return Err(ShmError::OutOfRegions);
    }

    let pages_needed = size.div_ceil(PAGE_SIZE);
    let mut pages = Vec::with_capacity(pages_needed);
    for _ in 0..pages_needed {
        match pmm::alloc_frame() {
            Some(frame) => pages.push(frame),
            None => {
                for frame in pages {
                    pmm::free_frame(frame);
                }
                return Err(ShmError::OutOfMemory);
            }
        }
    }

    let id = table.next_id;
    table.next_id += 1;
    table.regions.push(ShmRegion { id, key, size, pages, owner_pid, ref_count: 0 });
    Ok(id)
}

/// Map region `id`'s pages into `space` at `addr_hint`, or at
/// `0xA000_0000 + id * 0x10_0000` if no hint is given.
///
/// # Errors
/// `NotFound` if `id` does not name a live region.
pub fn shm_attach(id: u32, addr_hint: Option<u32>, space: &mut AddressSpace) -> Result<u32, ShmError> {
    let mut table = TABLE.lock();
    let index = table.find_by_id(id).ok_or(ShmError::NotFound)?;
    let region = &mut table.regions[index];

    let base = addr_hint.unwrap_or(0xA000_0000 + id * 0x10_0000);
    for (i, frame) in region.pages.iter().enumerate() {
        space.map(
            base + (i * PAGE_SIZE) as u32,
            *frame,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        );
    }
    region.ref_count += 1;
    Ok(base)
}

/// Unmap region `id` from `space`. On the last reference, the region's
/// frames are released back to the PMM and the region is removed from the
/// table — unlike the original, which never implemented this.
///
/// # Errors
/// `NotFound` if `id` does not name a live region.
pub fn shm_detach(id: u32, addr: u32, space: &mut AddressSpace) -> Result<(), ShmError> {
    let mut table = TABLE.lock();
    let index = table.find_by_id(id).ok_or(ShmError::NotFound)?;
    let region = &mut table.regions[index];

    for i in 0..region.pages.len() {
        space.unmap(addr + (i * PAGE_SIZE) as u32);
    }
    region.ref_count = region.ref_count.saturating_sub(1);
    if region.ref_count == 0 {
        for frame in table.regions.remove(index).pages {
            pmm::free_frame(frame);
        }
    }
    Ok(())
}

/// Number of live regions (for diagnostics/tests).
#[must_use]
pub fn region_count() -> usize {
    TABLE.lock().regions.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn creat_excl_rejects_duplicate_key() {
        let key = 0xBEEF_0001;
        let first = shm_get(key, PAGE_SIZE, ShmFlags::CREAT, 1);
        assert!(first.is_ok());
        let second = shm_get(key, PAGE_SIZE, ShmFlags::CREAT | ShmFlags::EXCL, 1);
        assert_eq!(second, Err(ShmError::AlreadyExists));
    }

    #[test_case]
    fn lookup_without_creat_on_missing_key_is_not_found() {
        let result = shm_get(0xBEEF_0002, PAGE_SIZE, ShmFlags::empty(), 1);
        assert_eq!(result, Err(ShmError::NotFound));
    }

    #[test_case]
    fn detach_releases_frames_on_last_reference() {
        let key = 0xBEEF_0003;
        let id = shm_get(key, PAGE_SIZE, ShmFlags::CREAT, 1).expect("region created");
        let mut space = AddressSpace::new_with_identity_map();
        let addr = shm_attach(id, None, &mut space).expect("attach succeeds");
        let before = region_count();
        shm_detach(id, addr, &mut space).expect("detach succeeds");
        assert_eq!(region_count(), before - 1);
    }
}
