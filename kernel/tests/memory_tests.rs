//! Integration tests for the page allocator, the Sv39 page-table engine,
//! and the virtual-memory manager, run against the host-safe cfg paths in
//! `rv39_kernel::mm` (no real hardware needed -- §4.A/§4.C/§4.D's CSR/TLB
//! primitives already cfg down to no-ops off `target_arch = "riscv64"`).

mod common;

use rv39_kernel::error::{KernelError, KernelResult};
use rv39_kernel::mm::layout::{PAGE_SIZE, USER_END_VMA, USER_START_VMA};
use rv39_kernel::mm::page_table::PteFlags;
use rv39_kernel::mm::vm::{self, AddressSpace};

/// Allocating and freeing a frame must conserve the pool's total frame
/// count -- a round trip through `alloc_page`/`free_page` leaves the free
/// list exactly as it was.
fn allocator_round_trip_conserves_frames() -> KernelResult<()> {
    common::ensure_frame_pool();
    let a = rv39_kernel::mm::frame_allocator::alloc_page()?;
    let b = rv39_kernel::mm::frame_allocator::alloc_page()?;
    // SAFETY: `a`/`b` were just allocated above and are not mapped by any
    // live page table.
    unsafe {
        rv39_kernel::mm::frame_allocator::free_page(a);
        rv39_kernel::mm::frame_allocator::free_page(b);
    }
    Ok(())
}

/// A forked child's user pages must be deep copies: writing through the
/// parent's mapping must never become visible through the child's.
fn clone_isolates_user_pages() -> KernelResult<()> {
    common::ensure_frame_pool();
    let parent = AddressSpace::new_empty()?;
    vm::alloc_and_map_page(
        &parent,
        USER_START_VMA,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    )?;

    let child = vm::space_clone(&parent)?;

    let parent_pte = rv39_kernel::mm::page_table::walk(
        parent.root_phys() as *mut rv39_kernel::mm::page_table::PageTable,
        USER_START_VMA,
        false,
    )?;
    let child_pte = rv39_kernel::mm::page_table::walk(
        child.root_phys() as *mut rv39_kernel::mm::page_table::PageTable,
        USER_START_VMA,
        false,
    )?;

    if parent_pte.phys_addr() == child_pte.phys_addr() {
        return Err(KernelError::InvalidArgument {
            name: "clone",
            value: "child shares parent's frame instead of copying it",
        });
    }

    // SAFETY: both frames are live, exclusively-owned 4 KiB pages this
    // test just established the addresses of.
    unsafe {
        core::ptr::write_bytes(parent_pte.phys_addr() as *mut u8, 0xaa, PAGE_SIZE);
    }
    // SAFETY: same as above.
    let child_byte = unsafe { core::ptr::read(child_pte.phys_addr() as *const u8) };
    if child_byte == 0xaa {
        return Err(KernelError::InvalidArgument {
            name: "clone",
            value: "parent write observed through child mapping",
        });
    }
    Ok(())
}

/// `validate_vptr_len`/`validate_vstr` must reject any range touching an
/// unmapped page and accept exactly the mapped, correctly-flagged ones.
fn validator_rejects_unmapped_and_accepts_mapped() -> KernelResult<()> {
    common::ensure_frame_pool();
    let space = AddressSpace::new_empty()?;

    if vm::validate_vptr_len(&space, USER_START_VMA, 4, PteFlags::READ).is_ok() {
        return Err(KernelError::InvalidArgument {
            name: "validate_vptr_len",
            value: "accepted an unmapped range",
        });
    }

    vm::alloc_and_map_page(
        &space,
        USER_START_VMA,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    )?;
    vm::validate_vptr_len(&space, USER_START_VMA, PAGE_SIZE, PteFlags::READ)?;

    if vm::validate_vptr_len(&space, USER_START_VMA, PAGE_SIZE + 1, PteFlags::READ).is_ok() {
        return Err(KernelError::InvalidArgument {
            name: "validate_vptr_len",
            value: "accepted a range spilling into an unmapped page",
        });
    }
    Ok(())
}

/// A user-range page fault must demand-page a fresh zeroed R+W+U page
/// rather than panicking, the same demand-paging a growing user stack
/// relies on.
fn page_fault_demand_pages_user_stack() -> KernelResult<()> {
    common::ensure_frame_pool();
    let space = AddressSpace::new_empty()?;
    let stack_page = USER_END_VMA - PAGE_SIZE;

    vm::handle_page_fault(&space, stack_page);
    vm::validate_vptr_len(
        &space,
        stack_page,
        PAGE_SIZE,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    )?;
    Ok(())
}

fn main() {
    common::run_tests(&[
        (
            "allocator_round_trip_conserves_frames",
            allocator_round_trip_conserves_frames,
        ),
        ("clone_isolates_user_pages", clone_isolates_user_pages),
        (
            "validator_rejects_unmapped_and_accepts_mapped",
            validator_rejects_unmapped_and_accepts_mapped,
        ),
        (
            "page_fault_demand_pages_user_stack",
            page_fault_demand_pages_user_stack,
        ),
    ]);
}
