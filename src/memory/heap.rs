//! Kernel heap: a segregated free-list allocator with split-on-alloc,
//! coalesce-on-free, and tail trimming (`spec.md` §4.1).
//!
//! Closely grounded on `original_source/src/mem/heap.c`: the same
//! `heap_block_t{next,prev,size,free}` inline header, first-fit scan,
//! `MIN_SPLIT` threshold, and `heap_trim` tail-shrink. Exposed as the
//! crate's `#[global_allocator]` the way the teacher's `allocator.rs` wires
//! `LockedHeap` in, but backed by this allocator instead of
//! `linked_list_allocator`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Mutex;

use crate::config::{HEAP_MIN_SPLIT, HEAP_SIZE, HEAP_START, PAGE_SIZE};
use crate::memory::paging;
use crate::memory::pmm;

#[repr(C)]
struct BlockHeader {
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
    size: usize,
    free: bool,
}

const BLOCK_OVERHEAD: usize = core::mem::size_of::<BlockHeader>();

struct Heap {
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
    bump: usize,
    mapped_end: usize,
    allocated_bytes: usize,
}

// SAFETY: the heap is only ever touched through `ALLOCATOR`'s `Mutex`.
unsafe impl Send for Heap {}

impl Heap {
    const fn uninit() -> Self {
        Heap { head: core::ptr::null_mut(), tail: core::ptr::null_mut(), bump: 0, mapped_end: 0, allocated_bytes: 0 }
    }

    fn align_up(value: usize, align: usize) -> usize {
        (value + align - 1) & !(align - 1)
    }

    /// Map one more page at the current bump pointer, extending the
    /// mapped heap region. Returns `false` if the kernel heap's reserved
    /// virtual range or physical memory is exhausted.
    fn map_new_page(&mut self) -> bool {
        if self.mapped_end - HEAP_START as usize >= HEAP_SIZE as usize {
            return false;
        }
        let Some(frame) = pmm::alloc_frame() else { return false };
        paging::map_heap_page(self.mapped_end as u32, frame);
        // SAFETY: every address space maps the heap's page tables at the
        // same entries, so this is valid under whichever is loaded.
        unsafe {
            paging::invlpg(self.mapped_end as u32);
        }
        self.mapped_end += PAGE_SIZE;
        true
    }

    fn ensure_space(&mut self, needed_end: usize) -> bool {
        while self.mapped_end < needed_end {
            if !self.map_new_page() {
                return false;
            }
        }
        true
    }

    /// # Safety
    /// `block` must be a valid, currently-unlinked `BlockHeader` appended
    /// to the heap's bump region.
    unsafe fn request_block(&mut self, size: usize) -> Option<*mut BlockHeader> {
        let block_addr = self.bump;
        let needed_end = Self::align_up(block_addr + BLOCK_OVERHEAD + size, PAGE_SIZE);
        if !self.ensure_space(needed_end) {
            return None;
        }
        let block = block_addr as *mut BlockHeader;
        block.write(BlockHeader { next: core::ptr::null_mut(), prev: self.tail, size, free: false });
        if !self.tail.is_null() {
            (*self.tail).next = block;
        }
        self.tail = block;
        if self.head.is_null() {
            self.head = block;
        }
        self.bump = block_addr + BLOCK_OVERHEAD + size;
        Some(block)
    }

    /// # Safety
    /// `block` must point at a free block large enough for `size` plus one
    /// more header past the split threshold.
    unsafe fn maybe_split(&mut self, block: *mut BlockHeader, size: usize) {
        let remaining = (*block).size - size;
        if remaining <= BLOCK_OVERHEAD + HEAP_MIN_SPLIT {
            return;
        }
        let new_block_addr = (block as usize) + BLOCK_OVERHEAD + size;
        let new_block = new_block_addr as *mut BlockHeader;
        new_block.write(BlockHeader {
            next: (*block).next,
            prev: block,
            size: remaining - BLOCK_OVERHEAD,
            free: true,
        });
        if !(*block).next.is_null() {
            (*(*block).next).prev = new_block;
        } else {
            self.tail = new_block;
        }
        (*block).next = new_block;
        (*block).size = size;
    }

    /// # Safety
    /// Caller must hold the heap lock for the duration.
    unsafe fn coalesce(&mut self, block: *mut BlockHeader) -> *mut BlockHeader {
        let mut block = block;
        if !(*block).next.is_null() && (*(*block).next).free {
            let next = (*block).next;
            (*block).size += BLOCK_OVERHEAD + (*next).size;
            (*block).next = (*next).next;
            if !(*block).next.is_null() {
                (*(*block).next).prev = block;
            } else {
                self.tail = block;
            }
        }
        if !(*block).prev.is_null() && (*(*block).prev).free {
            let prev = (*block).prev;
            (*prev).size += BLOCK_OVERHEAD + (*block).size;
            (*prev).next = (*block).next;
            if !(*prev).next.is_null() {
                (*(*prev).next).prev = prev;
            } else {
                self.tail = prev;
            }
            block = prev;
        }
        block
    }

    /// Shrink the bump pointer while a run of free blocks sits at the tail,
    /// unmapping and releasing whole pages above the new bump.
    fn trim(&mut self) {
        while !self.tail.is_null() {
            // SAFETY: `tail` is a live block owned by this heap.
            let tail_free = unsafe { (*self.tail).free };
            if !tail_free {
                break;
            }
            // SAFETY: same as above.
            let (prev, block_start) = unsafe { ((*self.tail).prev, self.tail as usize) };
            self.bump = block_start;
            self.tail = prev;
            if prev.is_null() {
                self.head = core::ptr::null_mut();
            } else {
                // SAFETY: `prev` is a live block.
                unsafe { (*prev).next = core::ptr::null_mut() };
            }
        }
        let new_mapped_end = Self::align_up(self.bump, PAGE_SIZE);
        while self.mapped_end > new_mapped_end {
            self.mapped_end -= PAGE_SIZE;
            paging::unmap_heap_page(self.mapped_end as u32);
            pmm::free_frame(pmm::PhysFrame::containing_address(self.mapped_end as u32));
        }
    }

    /// # Safety
    /// Must run with the heap lock held.
    unsafe fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let size = Self::align_up(layout.size().max(1), layout.align().max(core::mem::size_of::<usize>()));

        let mut cursor = self.head;
        while !cursor.is_null() {
            if (*cursor).free && (*cursor).size >= size {
                (*cursor).free = false;
                self.maybe_split(cursor, size);
                self.allocated_bytes += (*cursor).size;
                return (cursor as *mut u8).add(BLOCK_OVERHEAD);
            }
            cursor = (*cursor).next;
        }

        match self.request_block(size) {
            Some(block) => {
                self.allocated_bytes += (*block).size;
                (block as *mut u8).add(BLOCK_OVERHEAD)
            }
            None => core::ptr::null_mut(),
        }
    }

    /// # Safety
    /// `ptr` must be a pointer previously returned by `alloc` on this heap,
    /// not yet freed.
    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        let block = (ptr as *mut BlockHeader).sub(1);
        if (*block).free {
            crate::println!("heap: double free of block at {:#010x}, ignoring", ptr as usize);
            return;
        }
        self.allocated_bytes -= (*block).size;
        (*block).free = true;
        let merged = self.coalesce(block);
        let _ = merged;
        self.trim();
    }

    fn bytes_in_use(&self) -> usize {
        self.allocated_bytes
    }

    fn bytes_free(&self) -> usize {
        self.mapped_end.saturating_sub(HEAP_START as usize) - self.allocated_bytes
    }
}

struct LockedHeap {
    inner: Mutex<Heap>,
}

impl LockedHeap {
    const fn empty() -> Self {
        LockedHeap { inner: Mutex::new(Heap::uninit()) }
    }
}

// SAFETY: `GlobalAlloc` requires thread-safety; this kernel is single-core
// with interrupts providing the only concurrency, and all access goes
// through `inner`'s spinlock.
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.inner.lock().dealloc(ptr);
    }
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the heap's bump pointer; the backing pages are mapped
/// lazily by the first allocation.
pub fn init() {
    let mut heap = ALLOCATOR.inner.lock();
    heap.bump = HEAP_START as usize;
    heap.mapped_end = HEAP_START as usize;
}

/// Bytes currently handed out to live allocations.
#[must_use]
pub fn bytes_in_use() -> usize {
    ALLOCATOR.inner.lock().bytes_in_use()
}

/// Bytes mapped into the heap region but not currently allocated.
#[must_use]
pub fn bytes_free() -> usize {
    ALLOCATOR.inner.lock().bytes_free()
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap exhausted: requested {} bytes", layout.size());
}

/// A handle type kept only so other modules can talk about "a heap
/// pointer" without exposing `BlockHeader`.
pub type HeapPtr = NonNull<u8>;

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[test_case]
    fn simple_allocation_round_trips() {
        let heap_value = Box::new(41);
        assert_eq!(*heap_value, 41);
    }

    #[test_case]
    fn large_vec_allocation() {
        let n = 1000;
        let mut vec = Vec::new();
        for i in 0..n {
            vec.push(i);
        }
        assert_eq!(vec.iter().sum::<u64>(), (n - 1) * n / 2);
    }

    #[test_case]
    fn many_boxes_dont_leak() {
        for i in 0..HEAP_SIZE_PROBE {
            let x = Box::new(i);
            assert_eq!(*x, i);
        }
    }

    const HEAP_SIZE_PROBE: u64 = 1000;
}
