//! Kernel heap.
//!
//! Ambient allocator for everything the kernel core needs `alloc` for
//! (process table entries, VirtIO bounce-buffer bookkeeping, filesystem
//! file-table state): a single `linked_list_allocator::LockedHeap` over a
//! static backing region, installed as the `#[global_allocator]` in
//! `lib.rs`. This kernel core has no per-size-class/per-CPU allocation
//! pressure, so the rest of this codebase's slab allocator is more
//! machinery than this has a use for.

const HEAP_SIZE: usize = 4 * 1024 * 1024;

static mut HEAP_MEMORY: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Hand the backing region to `allocator`. Called once from boot, before
/// anything touches `alloc`.
///
/// # Safety
/// Must be called exactly once, before any allocation is attempted.
pub unsafe fn init(allocator: &linked_list_allocator::LockedHeap) {
    // SAFETY: `HEAP_MEMORY` is a private static the rest of the kernel
    // never references directly; caller guarantees single-initialization.
    let start = unsafe { core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8 };
    // SAFETY: `start` is valid for `HEAP_SIZE` bytes and not aliased by
    // any other live reference.
    unsafe { allocator.lock().init(start, HEAP_SIZE) };
    log::info!("kernel heap initialized: {HEAP_SIZE} bytes");
}
