//! Physical frame allocator.
//!
//! `original_source/src/mem/pmm.c` is a bump allocator that never frees
//! (`pmm_free_frame` is a stubbed-out `// TODO`). `spec.md` §4.1 requires
//! idempotent free and an allocation hint that rotates across the bitmap,
//! so this is a real bitmap allocator seeded from the same inputs
//! (`mem_lower`/`mem_upper`, the multiboot memory map) `pmm_init` reads.

use spin::Mutex;

use crate::config::{MIN_USABLE_FRAME, PAGE_SIZE};
use crate::multiboot::{MemoryRegionType, MultibootInfo};

/// A physical page-frame number, in units of `PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(pub u32);

impl PhysFrame {
    #[must_use]
    pub const fn containing_address(addr: u32) -> Self {
        PhysFrame(addr / PAGE_SIZE as u32)
    }

    #[must_use]
    pub const fn start_address(self) -> u32 {
        self.0 * PAGE_SIZE as u32
    }
}

const MAX_FRAMES: usize = 1 << 20; // covers up to 4 GiB of physical memory
const BITMAP_WORDS: usize = MAX_FRAMES / 32;

struct FrameBitmap {
    bits: [u32; BITMAP_WORDS],
    total_frames: usize,
    free_frames: usize,
    /// Rotating search hint (`spec.md` §4.1): each allocation resumes the
    /// scan where the last one left off instead of always starting at 0,
    /// spreading wear and avoiding repeatedly rescanning a packed low
    /// region.
    hint: usize,
}

impl FrameBitmap {
    const fn empty() -> Self {
        FrameBitmap { bits: [0; BITMAP_WORDS], total_frames: 0, free_frames: 0, hint: 0 }
    }

    fn is_free(&self, frame: usize) -> bool {
        self.bits[frame / 32] & (1 << (frame % 32)) == 0
    }

    fn set_used(&mut self, frame: usize) {
        self.bits[frame / 32] |= 1 << (frame % 32);
    }

    fn set_free(&mut self, frame: usize) {
        self.bits[frame / 32] &= !(1 << (frame % 32));
    }

    fn mark_usable(&mut self, frame: usize) {
        if frame >= self.total_frames {
            self.total_frames = frame + 1;
        }
        if !self.is_free(frame) {
            return;
        }
        // `mark_usable` is only ever called during init, over disjoint
        // regions, so every frame starts reserved (bit set) and this is the
        // first time it's cleared.
        self.free_frames += 1;
    }

    fn alloc(&mut self) -> Option<PhysFrame> {
        if self.total_frames == 0 {
            return None;
        }
        for offset in 0..self.total_frames {
            let frame = (self.hint + offset) % self.total_frames;
            if frame < MIN_USABLE_FRAME as usize / PAGE_SIZE {
                continue;
            }
            if self.is_free(frame) {
                self.set_used(frame);
                self.free_frames -= 1;
                self.hint = frame + 1;
                return Some(PhysFrame(frame as u32));
            }
        }
        None
    }

    fn free(&mut self, frame: PhysFrame) {
        let index = frame.0 as usize;
        if index >= self.total_frames {
            return;
        }
        // Idempotent: freeing an already-free frame is a no-op rather than
        // double-counting `free_frames` (`spec.md` §4.1 edge case).
        if self.is_free(index) {
            return;
        }
        self.set_free(index);
        self.free_frames += 1;
    }
}

static BITMAP: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::empty());

/// Every frame starts reserved until `init` marks the usable ranges free;
/// this must run before `init` completes.
fn reserve_all(bitmap: &mut FrameBitmap, frame_count: usize) {
    for frame in 0..frame_count.min(MAX_FRAMES) {
        bitmap.set_used(frame);
    }
}

/// Walk the multiboot memory map (falling back to `mem_lower`/`mem_upper`
/// if the loader provided no map) and mark every usable frame at or above
/// `MIN_USABLE_FRAME` as free.
pub fn init(info: &MultibootInfo) {
    let mut bitmap = BITMAP.lock();

    let total_bytes = match info.memory_map() {
        Some(map) => map.map(|e| e.base_addr + e.length).max().unwrap_or(0),
        None => {
            let (lower_kib, upper_kib) = info.basic_memory_kib().unwrap_or((0, 0));
            (u64::from(lower_kib) + u64::from(upper_kib)) * 1024
        }
    };
    let frame_count = (total_bytes / PAGE_SIZE as u64) as usize;
    reserve_all(&mut bitmap, frame_count);

    if let Some(map) = info.memory_map() {
        for entry in map {
            if entry.region_type != MemoryRegionType::Usable {
                continue;
            }
            let start = entry.base_addr.max(u64::from(MIN_USABLE_FRAME)) / u64::from(PAGE_SIZE as u32);
            let end = (entry.base_addr + entry.length) / u64::from(PAGE_SIZE as u32);
            for frame in start..end {
                bitmap.mark_usable(frame as usize);
            }
        }
    } else {
        let start = MIN_USABLE_FRAME as usize / PAGE_SIZE;
        for frame in start..frame_count {
            bitmap.mark_usable(frame);
        }
    }
}

/// Allocate one physical frame, or `None` if memory is exhausted.
pub fn alloc_frame() -> Option<PhysFrame> {
    BITMAP.lock().alloc()
}

/// Release `frame` back to the pool. Freeing an already-free frame is a
/// silent no-op (`spec.md` §4.1).
pub fn free_frame(frame: PhysFrame) {
    BITMAP.lock().free(frame);
}

/// Number of frames currently available for allocation.
#[must_use]
pub fn free_frame_count() -> usize {
    BITMAP.lock().free_frames
}

/// Total usable physical memory tracked by the allocator, in bytes
/// (`spec.md` PMM contract: `total_memory() -> bytes`).
#[must_use]
pub fn total_memory() -> usize {
    BITMAP.lock().total_frames * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_bitmap() -> FrameBitmap {
        let mut bitmap = FrameBitmap::empty();
        reserve_all(&mut bitmap, 64);
        for frame in 16..64 {
            bitmap.mark_usable(frame);
        }
        bitmap
    }

    #[test_case]
    fn alloc_then_free_is_reusable() {
        let mut bitmap = fresh_bitmap();
        let before = bitmap.free_frames;
        let frame = bitmap.alloc().expect("frame available");
        assert_eq!(bitmap.free_frames, before - 1);
        bitmap.free(frame);
        assert_eq!(bitmap.free_frames, before);
    }

    #[test_case]
    fn free_is_idempotent() {
        let mut bitmap = fresh_bitmap();
        let frame = bitmap.alloc().expect("frame available");
        bitmap.free(frame);
        let after_first_free = bitmap.free_frames;
        bitmap.free(frame);
        assert_eq!(bitmap.free_frames, after_first_free);
    }

    #[test_case]
    fn never_hands_out_frame_below_min_usable() {
        let mut bitmap = FrameBitmap::empty();
        reserve_all(&mut bitmap, 64);
        for frame in 0..64 {
            bitmap.mark_usable(frame);
        }
        for _ in 0..64 {
            if let Some(frame) = bitmap.alloc() {
                assert!(frame.0 as usize >= MIN_USABLE_FRAME as usize / PAGE_SIZE);
            }
        }
    }

    #[test_case]
    fn hint_rotates_instead_of_always_starting_at_zero() {
        let mut bitmap = fresh_bitmap();
        let first = bitmap.alloc().expect("frame available");
        let second = bitmap.alloc().expect("frame available");
        assert!(second.0 > first.0);
    }
}
