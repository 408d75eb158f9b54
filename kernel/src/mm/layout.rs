//! Address-space layout constants.
//!
//! These are compile-time parameters of the kernel core, not a runtime
//! config surface -- the kernel boots from ROM with no command line, so
//! layout is fixed at build time the same way the rest of this lineage
//! keeps its boot parameters as `pub const` items.

/// Page size for every mapping this kernel makes at the leaf level.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Identity-mapped MMIO + kernel-global gigarange, two 1 GiB pages.
pub const MMIO_AND_KERNEL_GLOBAL_END: usize = 0x8000_0000;

/// Top of physical RAM on the target machine (128 MiB `virt` layout).
pub const RAM_END: usize = 0x8800_0000;

/// Start of the per-process user region. Matches the donor's companion
/// test-binary load address.
pub const USER_START_VMA: usize = 0x8010_0000;

/// End of the per-process user region (exclusive).
pub const USER_END_VMA: usize = 0x8020_0000;

/// Top of the user stack; the stack grows down from here and is
/// demand-paged by the same fault handler that grows heap/BSS.
pub const USER_STACK_VMA: usize = USER_END_VMA;

/// Maximum number of open I/O handles per process.
pub const PROCESS_IOMAX: usize = 8;

/// Maximum number of live processes.
pub const NPROC: usize = 16;

/// Maximum number of directory entries in the boot block / maximum number
/// of distinct files the flat filesystem can name.
pub const MAXFL: usize = 63;

/// Maximum number of simultaneously open files across all processes.
pub const MAXFLOPEN: usize = 32;

/// Round `addr` down to the nearest page boundary.
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to the nearest page boundary.
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
