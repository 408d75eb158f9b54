//! End-to-end scenarios composing more than one subsystem together.
//! `fork`/`exec`'s own literal scenarios live in `process_tests.rs` and the
//! mount/open/read scenario lives in `filesystem_tests.rs`; what's left
//! here is string/pointer validation at a page boundary, a generic I/O
//! write/read round trip across a block boundary, demand-paged stack
//! growth, and one composition of the ELF loader with the VM validator.

mod common;

use std::sync::Arc;

use rv39_kernel::error::{KernelError, KernelResult};
use rv39_kernel::io::{IoDevice, MemoryIo};
use rv39_kernel::mm::layout::{PAGE_SIZE, USER_STACK_VMA};
use rv39_kernel::mm::page_table::PteFlags;
use rv39_kernel::mm::vm::{self, AddressSpace};

/// A NUL-terminated string that fills a page except for its final byte
/// must validate with the expected length; the same bytes with no NUL
/// anywhere in the page, and the following page unmapped, must fail
/// instead of reading off the end of the mapping.
fn validate_vstr_respects_page_boundary() -> KernelResult<()> {
    common::ensure_frame_pool();
    let space = AddressSpace::new_empty()?;
    let base = rv39_kernel::mm::layout::USER_START_VMA;
    vm::alloc_and_map_page(&space, base, PteFlags::READ | PteFlags::WRITE | PteFlags::USER)?;

    let pte = rv39_kernel::mm::page_table::walk(
        space.root_phys() as *mut rv39_kernel::mm::page_table::PageTable,
        base,
        false,
    )?;
    let phys = pte.phys_addr();

    // SAFETY: `phys` is the frame just mapped above, exclusively owned by
    // this test.
    let page = unsafe { core::slice::from_raw_parts_mut(phys as *mut u8, PAGE_SIZE) };
    page[..PAGE_SIZE - 1].fill(b'A');
    page[PAGE_SIZE - 1] = 0;

    let len = vm::validate_vstr(&space, base, PteFlags::READ)?;
    if len != PAGE_SIZE - 1 {
        return Err(KernelError::InvalidArgument {
            name: "validate_vstr",
            value: "did not report the string length up to the terminator",
        });
    }

    // SAFETY: same frame, still exclusively owned.
    let page = unsafe { core::slice::from_raw_parts_mut(phys as *mut u8, PAGE_SIZE) };
    page.fill(b'A');
    match vm::validate_vstr(&space, base, PteFlags::READ) {
        Err(KernelError::AccessDenied { .. }) => Ok(()),
        Err(e) => Err(e),
        Ok(_) => Err(KernelError::InvalidArgument {
            name: "validate_vstr",
            value: "accepted an unterminated string spilling into an unmapped page",
        }),
    }
}

/// A write spanning a block boundary must be observable, byte for byte,
/// through a subsequent read -- the same contract `VirtioBlkDevice`'s
/// chunked read/write loop (exercised directly in `virtio_tests.rs`)
/// exists to uphold for any caller, regardless of where the transfer
/// starts relative to a block.
fn write_read_round_trips_across_a_block_boundary() -> KernelResult<()> {
    let io = MemoryIo::new(vec![0u8; 1024]);
    let pattern: Vec<u8> = (0..530).map(|i| (i % 251) as u8).collect();

    let written = io.write(&pattern)?;
    if written != pattern.len() {
        return Err(KernelError::Io {
            detail: "short write",
        });
    }
    io.seek(0)?;
    let mut readback = vec![0u8; pattern.len()];
    let read = io.read(&mut readback)?;
    if read != pattern.len() || readback != pattern {
        return Err(KernelError::Io {
            detail: "read did not observe the bytes just written across the boundary",
        });
    }
    Ok(())
}

/// A fault in the top page of the user stack region must be resolved by
/// mapping a fresh R+W+U page, and a second access to the same page must
/// not need to fault again -- the mapping installed the first time is
/// still there.
fn stack_fault_resolves_and_is_stable() -> KernelResult<()> {
    common::ensure_frame_pool();
    let space = AddressSpace::new_empty()?;
    let stack_page = USER_STACK_VMA - PAGE_SIZE;

    vm::handle_page_fault(&space, stack_page);
    vm::validate_vptr_len(
        &space,
        stack_page,
        PAGE_SIZE,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    )?;
    // A second validate against the same, already-mapped page must keep
    // succeeding without another fault being needed.
    vm::validate_vptr_len(
        &space,
        stack_page,
        PAGE_SIZE,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    )?;
    Ok(())
}

/// Loading a valid ELF image must leave its code segment readable and
/// executable (but not writable) by the validator -- the loader and the
/// VM manager's flag bookkeeping agreeing with each other end to end.
fn loaded_elf_segment_is_exec_only() -> KernelResult<()> {
    common::ensure_frame_pool();
    let code = [0x13, 0x00, 0x00, 0x00]; // addi x0, x0, 0
    let image = common::build_elf_image(&code, PAGE_SIZE);
    let io: rv39_kernel::io::IoHandle = Arc::new(MemoryIo::new(image));

    let space = AddressSpace::new_empty()?;
    let entry = rv39_kernel::elf::load(&space, &io)?;
    if entry != rv39_kernel::mm::layout::USER_START_VMA {
        return Err(KernelError::InvalidArgument {
            name: "elf::load",
            value: "entry point did not match the program header's vaddr",
        });
    }

    vm::validate_vptr_len(&space, entry, code.len(), PteFlags::EXEC)?;
    if vm::validate_vptr_len(&space, entry, code.len(), PteFlags::WRITE).is_ok() {
        return Err(KernelError::InvalidArgument {
            name: "elf::load",
            value: "a read+exec-only segment validated as writable",
        });
    }
    Ok(())
}

fn main() {
    common::run_tests(&[
        (
            "validate_vstr_respects_page_boundary",
            validate_vstr_respects_page_boundary,
        ),
        (
            "write_read_round_trips_across_a_block_boundary",
            write_read_round_trips_across_a_block_boundary,
        ),
        (
            "stack_fault_resolves_and_is_stable",
            stack_fault_resolves_and_is_stable,
        ),
        (
            "loaded_elf_segment_is_exec_only",
            loaded_elf_segment_is_exec_only,
        ),
    ]);
}
