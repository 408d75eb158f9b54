//! Physical page allocator (§4.A).
//!
//! A single intrusive free list: a free frame's first machine word is the
//! address of the next free frame. No size classes, no coalescing -- every
//! frame is the same 4 KiB unit. This is a deliberate simplification of the
//! rest of this codebase's NUMA/bitmap+buddy frame allocator: that design
//! solves a multi-zone, multi-socket allocation problem this kernel core
//! does not have.

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::layout::PAGE_SIZE,
};

/// A free frame, linked through its own first word.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Intrusive free-list allocator over a physically contiguous frame pool.
pub struct FreeListAllocator {
    head: *mut FreeNode,
    free_count: usize,
    total_count: usize,
}

// SAFETY: the allocator is only ever reached through `FRAME_ALLOCATOR`'s
// `spin::Mutex`, which provides the required external synchronization for
// the raw pointer it carries.
unsafe impl Send for FreeListAllocator {}

impl FreeListAllocator {
    const fn empty() -> Self {
        Self {
            head: core::ptr::null_mut(),
            free_count: 0,
            total_count: 0,
        }
    }

    /// Seed the free list with every page-aligned frame in
    /// `[start, end)`. Called once during boot.
    ///
    /// # Safety
    /// `[start, end)` must be physical memory not otherwise in use -- not
    /// mapped by any live PTE, not claimed by the kernel image or the
    /// kernel heap.
    pub unsafe fn init(&mut self, start: usize, end: usize) {
        debug_assert!(crate::mm::layout::is_page_aligned(start));
        let mut addr = start;
        while addr + PAGE_SIZE <= end {
            // SAFETY: caller guarantees `addr` is free physical memory; it
            // is page-aligned and large enough to host a `FreeNode`.
            unsafe { self.free_raw(addr) };
            addr += PAGE_SIZE;
        }
    }

    /// Push one frame onto the free list without zeroing. Used both by
    /// `init` and by `free_page`.
    unsafe fn free_raw(&mut self, addr: usize) {
        let node = addr as *mut FreeNode;
        // SAFETY: caller guarantees `addr` is a writable, page-aligned,
        // otherwise-unused frame.
        unsafe {
            (*node).next = self.head;
        }
        self.head = node;
        self.free_count += 1;
        self.total_count += 1;
    }

    /// Detach the head of the free list, zero it, and return its address.
    pub fn alloc_page(&mut self) -> KernelResult<usize> {
        if self.head.is_null() {
            return Err(KernelError::OutOfMemory);
        }
        let node = self.head;
        // SAFETY: `node` was pushed by `free_raw`, which only ever writes
        // a single in-bounds `FreeNode` at the front of a list of frames
        // this allocator privately owns.
        let next = unsafe { (*node).next };
        self.head = next;
        self.free_count -= 1;

        let addr = node as usize;
        // SAFETY: `addr` is a whole physical frame this allocator owns
        // exclusively until returned from this function.
        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0, PAGE_SIZE);
        }
        Ok(addr)
    }

    /// Push `addr` back onto the free list.
    ///
    /// # Safety
    /// `addr` must be a page-aligned frame this allocator previously handed
    /// out via `alloc_page`, not currently reachable from any valid PTE.
    pub unsafe fn free_page(&mut self, addr: usize) {
        debug_assert!(crate::mm::layout::is_page_aligned(addr));
        // SAFETY: delegated to caller's contract above.
        unsafe { self.free_raw(addr) };
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }
}

pub static FRAME_ALLOCATOR: Mutex<FreeListAllocator> = Mutex::new(FreeListAllocator::empty());

/// Seed the global allocator. Called once from boot.
///
/// # Safety
/// See [`FreeListAllocator::init`].
pub unsafe fn init(start: usize, end: usize) {
    // SAFETY: delegated to caller.
    unsafe { FRAME_ALLOCATOR.lock().init(start, end) };
}

/// Allocate one zeroed physical frame, flushing the TLB afterward so a
/// stale translation in another address space cannot observe the old
/// owner's data at the same address (§4.A).
pub fn alloc_page() -> KernelResult<usize> {
    let addr = FRAME_ALLOCATOR.lock().alloc_page()?;
    crate::arch::riscv64::sfence_vma();
    Ok(addr)
}

/// Return a frame to the free list, flushing the TLB afterward.
///
/// # Safety
/// See [`FreeListAllocator::free_page`].
pub unsafe fn free_page(addr: usize) {
    // SAFETY: delegated to caller.
    unsafe { FRAME_ALLOCATOR.lock().free_page(addr) };
    crate::arch::riscv64::sfence_vma();
}
