//! Swap: moves evicted pages to and from a block device.
//!
//! Grounded on `original_source/src/mem/swap.c`'s `swap_bitmap`,
//! `find_free_slot`/`mark_slot`, and `swap_out`/`swap_in`/`swap_free`, with
//! the AHCI-specific `swap_port` lookup replaced by the generic
//! `block::BlockDevice` trait (AHCI itself is out of scope, `spec.md` §9
//! Non-goals).

use alloc::boxed::Box;

use spin::Mutex;

use crate::block::BlockDevice;
use crate::config::{PAGE_SIZE, SWAP_SECTORS_PER_SLOT, SWAP_SLOT_COUNT, SWAP_START_SECTOR};
use crate::memory::pmm::PhysFrame;

struct SwapBitmap {
    bits: [u32; SWAP_SLOT_COUNT / 32],
    hint: usize,
}

impl SwapBitmap {
    const fn empty() -> Self {
        SwapBitmap { bits: [0; SWAP_SLOT_COUNT / 32], hint: 0 }
    }

    fn is_used(&self, slot: usize) -> bool {
        self.bits[slot / 32] & (1 << (slot % 32)) != 0
    }

    fn set_used(&mut self, slot: usize) {
        self.bits[slot / 32] |= 1 << (slot % 32);
    }

    fn set_free(&mut self, slot: usize) {
        self.bits[slot / 32] &= !(1 << (slot % 32));
    }

    fn find_free_slot(&mut self) -> Option<usize> {
        for offset in 0..SWAP_SLOT_COUNT {
            let slot = (self.hint + offset) % SWAP_SLOT_COUNT;
            if !self.is_used(slot) {
                self.hint = slot + 1;
                return Some(slot);
            }
        }
        None
    }
}

static BITMAP: Mutex<SwapBitmap> = Mutex::new(SwapBitmap::empty());
static DEVICE: Mutex<Option<Box<dyn BlockDevice>>> = Mutex::new(None);

/// Attach the block device swap will read/write through. Without one,
/// `swap_out` always fails (`spec.md` §4.1's "no swap device" edge case).
pub fn set_device(device: Box<dyn BlockDevice>) {
    *DEVICE.lock() = Some(device);
}

fn slot_lba(slot: usize) -> u64 {
    SWAP_START_SECTOR + slot as u64 * u64::from(SWAP_SECTORS_PER_SLOT)
}

/// Write the page at `frame` out to a free swap slot and return its slot
/// index, or `None` if swap is full or no device is attached.
pub fn swap_out(frame: PhysFrame) -> Option<u32> {
    let slot = BITMAP.lock().find_free_slot()?;
    let mut guard = DEVICE.lock();
    let device = guard.as_mut()?;

    // SAFETY: `frame` is a physical frame the caller owns exclusively for
    // the duration of this call, and it is identity-mapped below the
    // kernel's own heap range.
    let page = unsafe {
        core::slice::from_raw_parts(frame.start_address() as *const u8, PAGE_SIZE)
    };
    if device.write(slot_lba(slot), page).is_err() {
        return None;
    }
    BITMAP.lock().set_used(slot);
    Some(slot as u32)
}

/// Read the page stored in `slot` back into `frame` and release the slot.
pub fn swap_in(slot: u32, frame: PhysFrame) {
    let mut guard = DEVICE.lock();
    let Some(device) = guard.as_mut() else { return };

    // SAFETY: `frame` was just allocated by the caller and is exclusively
    // owned for the duration of this call.
    let page = unsafe {
        core::slice::from_raw_parts_mut(frame.start_address() as *mut u8, PAGE_SIZE)
    };
    let _ = device.read(slot_lba(slot as usize), page);
    swap_free(slot);
}

/// Release a swap slot without reading it back (e.g. the owning task
/// exited before the page was faulted back in).
pub fn swap_free(slot: u32) {
    BITMAP.lock().set_free(slot as usize);
}

/// Number of swap slots still unused.
#[must_use]
pub fn available_slots() -> usize {
    let bitmap = BITMAP.lock();
    (0..SWAP_SLOT_COUNT).filter(|&slot| !bitmap.is_used(slot)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;

    #[test_case]
    fn find_free_slot_is_idempotent_after_free() {
        let mut bitmap = SwapBitmap::empty();
        let slot = bitmap.find_free_slot().expect("slot available");
        bitmap.set_used(slot);
        bitmap.set_free(slot);
        assert!(!bitmap.is_used(slot));
    }

    #[test_case]
    fn swap_out_without_device_returns_none() {
        *DEVICE.lock() = None;
        let frame = PhysFrame(16);
        assert!(swap_out(frame).is_none());
    }

    #[test_case]
    fn swap_device_can_be_attached() {
        set_device(alloc::boxed::Box::new(MemoryBlockDevice::new(
            SWAP_SECTORS_PER_SLOT as u64 * 8,
            512,
        )));
        assert!(DEVICE.lock().is_some());
    }
}
