//! Virtual-memory manager operations (§4.D).
//!
//! Everything here operates on an [`AddressSpace`]: a root Sv39 table plus
//! the `satp` value that names it. `space_clone` walks the tree
//! recursively rather than the three-level description in §4.D spells out
//! literally -- the boot mapping's "kernel gigarange" entries and a
//! process's own user pages can share an interior table (the first 2 MiB
//! of RAM holds both the kernel image and the user region), so cloning has
//! to decide per leaf, at whatever depth, whether it is shared kernel
//! state (alias) or private user state (copy). A leaf without `USER` set
//! is aliased; a leaf with `USER` set gets a fresh frame and a byte copy.
//! This generalizes the spec's flat description without contradicting it.

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        frame_allocator,
        layout::{is_page_aligned, PAGE_SIZE, USER_END_VMA, USER_START_VMA},
        page_table::{self, make_satp, PageTable, PteFlags},
    },
};

/// One process's (or the kernel's own) Sv39 address space.
pub struct AddressSpace {
    root: *mut PageTable,
    satp: u64,
}

// SAFETY: `root` is a kernel-owned physical frame; `AddressSpace` values
// are only ever touched under whatever lock the owning process table
// already holds.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Wrap an already-built root table (used once, for the boot mapping).
    pub fn from_root(root_phys: usize) -> Self {
        Self {
            root: root_phys as *mut PageTable,
            satp: make_satp(root_phys),
        }
    }

    /// Allocate a fresh, empty root table.
    pub fn new_empty() -> KernelResult<Self> {
        let root_phys = frame_allocator::alloc_page()?;
        Ok(Self::from_root(root_phys))
    }

    pub fn satp(&self) -> u64 {
        self.satp
    }

    pub fn root_phys(&self) -> usize {
        self.root as usize
    }

    fn root_table(&self) -> &mut PageTable {
        // SAFETY: `self.root` was allocated by `new_empty`/`from_root` and
        // lives as long as `self`.
        unsafe { &mut *self.root }
    }
}

lazy_static::lazy_static! {
    static ref MAIN_MTAG: spin::Mutex<Option<u64>> = spin::Mutex::new(None);
}

/// Record the kernel's own boot address space as the space every process
/// returns to on `space_reclaim`.
pub fn set_main_mtag(satp: u64) {
    *MAIN_MTAG.lock() = Some(satp);
}

/// The kernel's own mtag, installed by `space_reclaim`.
///
/// # Panics
/// Panics if called before `set_main_mtag` -- the main address space not
/// existing yet breaks a kernel invariant this function cannot recover
/// from.
pub fn main_mtag() -> u64 {
    MAIN_MTAG
        .lock()
        .expect("main address space not initialized")
}

/// Allocate a frame and install it at `vma` with `flags`. `vma` must be
/// page-aligned.
pub fn alloc_and_map_page(space: &AddressSpace, vma: usize, flags: PteFlags) -> KernelResult<()> {
    if !is_page_aligned(vma) {
        return Err(KernelError::InvalidArgument {
            name: "vma",
            value: "not page-aligned",
        });
    }
    let frame = frame_allocator::alloc_page()?;
    page_table::map_page(space.root, vma, frame, flags)
}

/// `alloc_and_map_page` repeated over `n` consecutive pages starting at
/// `vma`.
pub fn alloc_and_map_range(
    space: &AddressSpace,
    vma: usize,
    n: usize,
    flags: PteFlags,
) -> KernelResult<()> {
    for i in 0..n {
        alloc_and_map_page(space, vma + i * PAGE_SIZE, flags)?;
    }
    Ok(())
}

/// Rewrite the flag bits of the leaf mapping `vp`, preserving the PPN, and
/// flush the TLB.
pub fn set_page_flags(space: &AddressSpace, vp: usize, flags: PteFlags) -> KernelResult<()> {
    let pte = page_table::walk(space.root, vp, false)?;
    if !pte.is_valid() {
        return Err(KernelError::NoEntry { name: "vp" });
    }
    let phys = pte.phys_addr();
    pte.set_flags_preserving_ppn(phys, flags);
    crate::arch::riscv64::sfence_vma();
    Ok(())
}

/// `set_page_flags` repeated over `n` consecutive pages.
pub fn set_range_flags(
    space: &AddressSpace,
    vp: usize,
    n: usize,
    flags: PteFlags,
) -> KernelResult<()> {
    for i in 0..n {
        set_page_flags(space, vp + i * PAGE_SIZE, flags)?;
    }
    Ok(())
}

/// Walk every page in the user region, freeing and unmapping any valid,
/// user-accessible leaf.
pub fn unmap_and_free_user(space: &AddressSpace) {
    let mut vma = USER_START_VMA;
    while vma < USER_END_VMA {
        if let Ok(pte) = page_table::walk(space.root, vma, false) {
            if pte.is_valid() && pte.flags().contains(PteFlags::USER) {
                let phys = pte.phys_addr();
                // SAFETY: `phys` was handed out to this address space by
                // the frame allocator and is being unmapped right now, so
                // no other valid PTE can still reference it.
                unsafe { frame_allocator::free_page(phys) };
                let _ = page_table::unmap_page(space.root, vma);
            }
        }
        vma += PAGE_SIZE;
    }
}

/// Tear down the user portion of `space` and switch back to the kernel's
/// own address space.
pub fn space_reclaim(space: &AddressSpace) {
    unmap_and_free_user(space);
    // SAFETY: the main mtag maps the code that is about to keep running.
    unsafe { crate::arch::riscv64::write_satp(main_mtag()) };
}

/// Build a child address space: alias every kernel-global leaf, deep-copy
/// every user leaf into a freshly allocated frame.
pub fn space_clone(space: &AddressSpace) -> KernelResult<AddressSpace> {
    let child = AddressSpace::new_empty()?;
    clone_subtree(space.root_table(), child.root_table(), 2)?;
    Ok(child)
}

fn clone_subtree(parent: &mut PageTable, child: &mut PageTable, level: usize) -> KernelResult<()> {
    for index in 0..512 {
        let parent_entry = *parent.entry(index);
        if !parent_entry.is_valid() {
            continue;
        }
        if parent_entry.is_leaf() {
            if parent_entry.flags().contains(PteFlags::USER) {
                let frame = frame_allocator::alloc_page()?;
                let parent_phys = parent_entry.phys_addr();
                // SAFETY: both ranges are whole, distinct 4 KiB physical
                // frames: `parent_phys` is a live user frame of the
                // parent, `frame` was just allocated and zeroed.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        parent_phys as *const u8,
                        frame as *mut u8,
                        PAGE_SIZE,
                    );
                }
                child
                    .entry_mut(index)
                    .set_flags_preserving_ppn(frame, parent_entry.flags());
            } else {
                *child.entry_mut(index) = parent_entry;
            }
        } else if level == 0 {
            return Err(KernelError::InvalidArgument {
                name: "page table",
                value: "leaf flag missing on level-0 entry",
            });
        } else {
            let child_frame = frame_allocator::alloc_page()?;
            child
                .entry_mut(index)
                .set_flags_preserving_ppn(child_frame, PteFlags::VALID | PteFlags::GLOBAL);
            let parent_sub = PageTable::zeroed_at(parent_entry.phys_addr());
            let child_sub = PageTable::zeroed_at(child_frame);
            clone_subtree(parent_sub, child_sub, level - 1)?;
        }
    }
    Ok(())
}

/// Require a valid leaf with all of `flags` set for every page covering
/// `[vp, vp + len)`.
pub fn validate_vptr_len(
    space: &AddressSpace,
    vp: usize,
    len: usize,
    flags: PteFlags,
) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let first_page = vp & !(PAGE_SIZE - 1);
    let last_page = (vp + len - 1) & !(PAGE_SIZE - 1);
    let mut page = first_page;
    loop {
        let pte = page_table::walk(space.root, page, false)
            .map_err(|_| KernelError::AccessDenied { addr: page })?;
        if !pte.is_valid() || !pte.flags().contains(flags) {
            return Err(KernelError::AccessDenied { addr: page });
        }
        if page == last_page {
            break;
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// As `validate_vptr_len`, but for a NUL-terminated string of unknown
/// length: walk one byte at a time, re-validating the containing page
/// each time it changes, until a NUL is found.
pub fn validate_vstr(space: &AddressSpace, vp: usize, flags: PteFlags) -> KernelResult<usize> {
    let mut addr = vp;
    let mut current_page = usize::MAX;
    let mut len = 0;
    loop {
        let page = addr & !(PAGE_SIZE - 1);
        if page != current_page {
            let pte = page_table::walk(space.root, page, false)
                .map_err(|_| KernelError::AccessDenied { addr })?;
            if !pte.is_valid() || !pte.flags().contains(flags) {
                return Err(KernelError::AccessDenied { addr });
            }
            current_page = page;
        }
        let pte = page_table::walk(space.root, page, false)
            .map_err(|_| KernelError::AccessDenied { addr })?;
        let phys = pte.phys_addr() + (addr & (PAGE_SIZE - 1));
        // SAFETY: `phys` was just validated above as backed by a leaf with
        // the requested permissions.
        let byte = unsafe { core::ptr::read(phys as *const u8) };
        if byte == 0 {
            return Ok(len);
        }
        len += 1;
        addr += 1;
    }
}

/// Resolve a fault at `vp`: inside the user region, map a fresh zeroed
/// R+W+U page (on-demand stack/BSS growth); outside it, a fault is a
/// kernel invariant violation.
pub fn handle_page_fault(space: &AddressSpace, vp: usize) {
    let page = vp & !(PAGE_SIZE - 1);
    if page >= USER_START_VMA && page < USER_END_VMA {
        alloc_and_map_page(space, page, PteFlags::READ | PteFlags::WRITE | PteFlags::USER)
            .expect("user page fault handler could not map a fresh page");
    } else {
        panic!("page fault outside user range at {vp:#x}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator::test_support::ensure_pool;

    #[test]
    fn validate_vptr_len_accepts_empty_range() {
        ensure_pool();
        let space = AddressSpace::new_empty().unwrap();
        assert!(validate_vptr_len(&space, 0x1000, 0, PteFlags::READ).is_ok());
    }

    #[test]
    fn validate_vptr_len_rejects_unmapped() {
        ensure_pool();
        let space = AddressSpace::new_empty().unwrap();
        assert!(validate_vptr_len(&space, USER_START_VMA, 4, PteFlags::READ).is_err());
    }

    #[test]
    fn alloc_and_map_then_validate_succeeds() {
        ensure_pool();
        let space = AddressSpace::new_empty().unwrap();
        alloc_and_map_page(
            &space,
            USER_START_VMA,
            PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
        )
        .unwrap();
        assert!(validate_vptr_len(&space, USER_START_VMA, PAGE_SIZE, PteFlags::READ).is_ok());
    }
}
