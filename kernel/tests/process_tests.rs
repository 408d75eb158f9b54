//! Integration tests for the process manager (§4.H), driven against the
//! mock scheduler collaborator since no real thread scheduler is in scope.

mod common;

use std::sync::Arc;

use rv39_kernel::error::{errno, KernelError, KernelResult};
use rv39_kernel::io::{IoHandle, MemoryIo};
use rv39_kernel::mm::vm::{self, AddressSpace};
use rv39_kernel::process;
use rv39_kernel::syscall::TrapFrame;

/// Bring up process 0 as the boot thread, owning a fresh address space
/// installed as the kernel's own main mtag.
fn boot_process_zero() -> KernelResult<()> {
    common::install_mock_scheduler();
    let main_space = AddressSpace::new_empty()?;
    vm::set_main_mtag(main_space.satp());
    process::procmgr_init();
    Ok(())
}

/// Forking a process with an open file in `iotab[1]` must hand the child
/// a new pid greater than the parent's, and the child must see the same
/// open file through a cloned handle, not a fresh or absent one.
fn fork_shares_iotab_and_returns_child_pid() -> KernelResult<()> {
    boot_process_zero()?;

    let file: IoHandle = Arc::new(MemoryIo::new(vec![1, 2, 3]));
    process::with_process(0, |p| p.install(1, file))??;

    let trap_frame = TrapFrame::default();
    let child_pid = process::fork(0, &trap_frame)?;
    if child_pid <= 0 {
        return Err(KernelError::InvalidArgument {
            name: "fork",
            value: "child pid was not positive",
        });
    }

    process::with_process(child_pid, |p| p.iotab_get(1).map(|_| ()))??;
    Ok(())
}

/// Loading an ELF image with an unsupported `e_ident[5]` (endianness) must
/// fail with the bad-format errno and never reach the scheduler's
/// `thread_jump_to_user` (which the mock scheduler cannot service).
fn exec_rejects_malformed_elf() -> KernelResult<()> {
    boot_process_zero()?;

    let bad_elf = common::build_bad_endian_elf_image();
    let handle: IoHandle = Arc::new(MemoryIo::new(bad_elf));
    let result = process::exec(0, &handle);
    if result != -errno::EBADFMT {
        return Err(KernelError::InvalidArgument {
            name: "exec",
            value: "did not reject a malformed ELF image with EBADFMT",
        });
    }
    Ok(())
}

/// A successful `exec` must reuse the process's existing root table frame
/// rather than leaking it: after a second `exec` reclaims the first
/// image's user mapping, the frame allocator's free count must be back at
/// its pre-exec baseline (the second call's image is deliberately
/// malformed so it fails validation before allocating anything new,
/// isolating the reclaim's effect from a second load's cost).
fn exec_reclaims_previous_image_without_leaking_root() -> KernelResult<()> {
    boot_process_zero()?;

    let baseline = rv39_kernel::mm::frame_allocator::FRAME_ALLOCATOR
        .lock()
        .free_count();

    let code = [0x13, 0x00, 0x00, 0x00]; // addi x0, x0, 0
    let good_image = common::build_elf_image(&code, rv39_kernel::mm::layout::PAGE_SIZE);
    let good_handle: IoHandle = Arc::new(MemoryIo::new(good_image));
    // `exec`'s success path jumps to user mode via the mock scheduler's
    // `thread_jump_to_user`, which panics rather than returning -- this is
    // the only way to observe a successful load's frame cost from here.
    let jumped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        process::exec(0, &good_handle)
    }));
    if jumped.is_ok() {
        return Err(KernelError::InvalidArgument {
            name: "exec",
            value: "returned instead of jumping to user mode on success",
        });
    }

    let bad_handle: IoHandle = Arc::new(MemoryIo::new(common::build_bad_endian_elf_image()));
    let result = process::exec(0, &bad_handle);
    if result != -errno::EBADFMT {
        return Err(KernelError::InvalidArgument {
            name: "exec",
            value: "did not reject the second, malformed image",
        });
    }

    let after = rv39_kernel::mm::frame_allocator::FRAME_ALLOCATOR
        .lock()
        .free_count();
    if after != baseline {
        return Err(KernelError::InvalidArgument {
            name: "exec",
            value: "free frame count did not return to baseline after reclaiming",
        });
    }
    Ok(())
}

fn main() {
    common::run_tests(&[
        (
            "fork_shares_iotab_and_returns_child_pid",
            fork_shares_iotab_and_returns_child_pid,
        ),
        ("exec_rejects_malformed_elf", exec_rejects_malformed_elf),
        (
            "exec_reclaims_previous_image_without_leaking_root",
            exec_reclaims_previous_image_without_leaking_root,
        ),
    ]);
}
