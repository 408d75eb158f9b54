//! Memory management: page allocator, Sv39 page tables, the
//! virtual-memory manager built on top, and the kernel heap.

pub mod frame_allocator;
pub mod heap;
pub mod layout;
pub mod page_table;
pub mod vm;

use layout::{MMIO_AND_KERNEL_GLOBAL_END, RAM_END};
use page_table::PteFlags;
use vm::AddressSpace;

extern "C" {
    /// Linker-provided end of the kernel's loaded sections; anything from
    /// here to `RAM_END` is free physical memory.
    static __kernel_end: u8;
    /// Start of the `.text` section, mapped R+X.
    static __text_start: u8;
    static __text_end: u8;
    /// Start/end of `.rodata`, mapped R only.
    static __rodata_start: u8;
    static __rodata_end: u8;
}

/// Run the boot mapping procedure (§4.C) and seed the frame allocator
/// with everything past the kernel image. Returns the kernel's own
/// [`AddressSpace`]; the caller installs it via `satp`.
///
/// # Safety
/// Must run exactly once, early in boot, before the frame allocator or
/// any address space operation is used.
pub unsafe fn init() -> AddressSpace {
    // SAFETY: these symbols are defined by the linker script and are
    // valid for the lifetime of the kernel.
    let kernel_end = unsafe { core::ptr::addr_of!(__kernel_end) as usize };
    let text_start = unsafe { core::ptr::addr_of!(__text_start) as usize };
    let text_end = unsafe { core::ptr::addr_of!(__text_end) as usize };
    let rodata_start = unsafe { core::ptr::addr_of!(__rodata_start) as usize };
    let rodata_end = unsafe { core::ptr::addr_of!(__rodata_end) as usize };

    // SAFETY: memory from the page past the kernel image to RAM_END is
    // not otherwise claimed at this point in boot.
    unsafe {
        frame_allocator::init(
            layout::page_align_up(kernel_end),
            layout::page_align_down(RAM_END),
        );
    }

    let space = AddressSpace::new_empty().expect("no frames left to build the boot page table");
    let root = space.root_phys() as *mut page_table::PageTable;

    // Two 1 GiB identity MMIO leaves, VPN2 = 0, 1.
    page_table::map_gigapage(root, 0x0000_0000, 0x0000_0000, PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL);
    page_table::map_gigapage(
        root,
        0x4000_0000,
        0x4000_0000,
        PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL,
    );

    // Per-page mapping of the first 2 MiB of RAM: kernel sections get
    // their natural permissions, the rest is R+W for early boot data.
    let ram_base = MMIO_AND_KERNEL_GLOBAL_END;
    let first_region_end = ram_base + 2 * 1024 * 1024;
    let mut addr = ram_base;
    while addr < first_region_end {
        let flags = if addr >= text_start && addr < text_end {
            PteFlags::READ | PteFlags::EXEC | PteFlags::GLOBAL
        } else if addr >= rodata_start && addr < rodata_end {
            PteFlags::READ | PteFlags::GLOBAL
        } else {
            PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL
        };
        page_table::map_page(root, addr, addr, flags)
            .expect("boot mapping of the first 2 MiB of RAM failed");
        addr += layout::PAGE_SIZE;
    }

    // Remaining RAM as 2 MiB global superpages.
    let mut addr = first_region_end;
    while addr < RAM_END {
        page_table::map_superpage(root, addr, addr, PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL)
            .expect("boot mapping of remaining RAM failed");
        addr += 2 * 1024 * 1024;
    }

    vm::set_main_mtag(space.satp());
    // SAFETY: `space`'s root maps the code currently executing (identity
    // mapped) and everything it is about to jump to.
    unsafe { crate::arch::riscv64::write_satp(space.satp()) };

    space
}
