//! Sv39 page table engine (§4.C).
//!
//! Three levels (VPN2/VPN1/VPN0, 9 bits each), one leaf size (4 KiB) for
//! user mappings and 2 MiB superpages for the kernel's own gigarange. This
//! replaces the rest of this codebase's 4-level x86-style `PageMapper`:
//! Sv39 only has three levels, and this kernel core only ever walks one
//! page table format.

use bitflags::bitflags;

use crate::{
    error::{KernelError, KernelResult},
    mm::{frame_allocator, layout::PAGE_SIZE},
};

bitflags! {
    /// Sv39 PTE flag bits, §4.C.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

const PPN_SHIFT: u64 = 10;
const PPN_MASK: u64 = 0x000F_FFFF_FFFF_FC00;
const VPN_BITS: usize = 9;
const VPN_MASK: usize = (1 << VPN_BITS) - 1;

/// The SATP MODE field value selecting Sv39.
const SATP_MODE_SV39: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// A leaf entry has at least one of R/W/X set; a valid, non-leaf entry
    /// points at the next table level.
    pub fn is_leaf(&self) -> bool {
        self.is_valid()
            && self.0 & (PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC).bits() != 0
    }

    pub fn ppn(&self) -> u64 {
        (self.0 & PPN_MASK) >> PPN_SHIFT
    }

    pub fn phys_addr(&self) -> usize {
        (self.ppn() << 12) as usize
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn set(&mut self, phys: usize, flags: PteFlags) {
        let ppn = (phys as u64) >> 12;
        self.0 = (ppn << PPN_SHIFT) | flags.bits();
    }

    /// Rewrite the flag bits while keeping the current PPN, for
    /// `set_page_flags`/`space_clone`.
    pub fn set_flags_preserving_ppn(&mut self, phys: usize, flags: PteFlags) {
        self.set(phys, flags);
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// One page-table level: 512 eight-byte entries filling exactly one page.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    pub fn zeroed_at(phys: usize) -> &'static mut PageTable {
        // SAFETY: `phys` is a whole, exclusively-owned physical frame
        // handed out by the frame allocator, already zeroed by
        // `alloc_page`, and large enough for a `PageTable` (exactly one
        // page thanks to `repr(C, align(4096))`).
        unsafe { &mut *(phys as *mut PageTable) }
    }

    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// VPN2/VPN1/VPN0 decomposition of a 39-bit virtual address.
#[derive(Debug, Clone, Copy)]
pub struct VirtAddrParts {
    pub vpn: [usize; 3],
    pub offset: usize,
}

impl VirtAddrParts {
    pub fn decompose(vma: usize) -> Self {
        Self {
            vpn: [
                (vma >> 12) & VPN_MASK,
                (vma >> 21) & VPN_MASK,
                (vma >> 30) & VPN_MASK,
            ],
            offset: vma & (PAGE_SIZE - 1),
        }
    }
}

/// Walk `root` for `vma`, returning the level-0 (leaf) PTE. When `create`
/// is set, missing intermediate tables are allocated and linked in; when
/// clear, a missing intermediate table is reported as
/// [`KernelError::NoEntry`].
pub fn walk(
    root: *mut PageTable,
    vma: usize,
    create: bool,
) -> KernelResult<&'static mut PageTableEntry> {
    let parts = VirtAddrParts::decompose(vma);
    // SAFETY: `root` is the live root table of an address space the
    // caller holds a reference to; it outlives this walk.
    let mut table = unsafe { &mut *root };

    for level in (1..=2).rev() {
        let entry = table.entry_mut(parts.vpn[level]);
        if !entry.is_valid() {
            if !create {
                return Err(KernelError::NoEntry {
                    name: "page table level",
                });
            }
            let frame = frame_allocator::alloc_page()?;
            entry.set(frame, PteFlags::VALID | PteFlags::GLOBAL);
        } else if entry.is_leaf() {
            // A superpage occupies this slot; no further descent is
            // possible.
            return Err(KernelError::InvalidArgument {
                name: "vma",
                value: "covered by a superpage",
            });
        }
        table = PageTable::zeroed_at(entry.phys_addr());
    }

    Ok(table.entry_mut(parts.vpn[0]))
}

/// Map one 4 KiB page, allocating intermediate tables as needed. Leaves
/// are always created with A and D set: this kernel core has no
/// access-bit fault path, so pretending the hardware already set them
/// keeps every other component's invariants (§4.C) simple.
pub fn map_page(root: *mut PageTable, vma: usize, phys: usize, flags: PteFlags) -> KernelResult<()> {
    let pte = walk(root, vma, true)?;
    if pte.is_valid() {
        return Err(KernelError::InvalidArgument {
            name: "vma",
            value: "already mapped",
        });
    }
    pte.set(
        phys,
        flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
    );
    crate::arch::riscv64::sfence_vma();
    Ok(())
}

/// Map a 2 MiB region at level 1 directly (used for the kernel's own
/// gigarange, never for user mappings).
pub fn map_superpage(
    root: *mut PageTable,
    vma: usize,
    phys: usize,
    flags: PteFlags,
) -> KernelResult<()> {
    let parts = VirtAddrParts::decompose(vma);
    // SAFETY: `root` is the live root table of an address space the
    // caller holds a reference to.
    let l2 = unsafe { &mut *root };
    let entry = l2.entry_mut(parts.vpn[2]);
    if !entry.is_valid() {
        let frame = frame_allocator::alloc_page()?;
        entry.set(frame, PteFlags::VALID | PteFlags::GLOBAL);
    } else if entry.is_leaf() {
        return Err(KernelError::InvalidArgument {
            name: "vma",
            value: "level-2 slot already a superpage",
        });
    }
    let l1 = PageTable::zeroed_at(entry.phys_addr());
    let leaf = l1.entry_mut(parts.vpn[1]);
    if leaf.is_valid() {
        return Err(KernelError::InvalidArgument {
            name: "vma",
            value: "already mapped",
        });
    }
    leaf.set(
        phys,
        flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
    );
    crate::arch::riscv64::sfence_vma();
    Ok(())
}

/// Map a full 1 GiB identity region at level 2 directly (used for the two
/// MMIO gigapages during boot mapping).
pub fn map_gigapage(root: *mut PageTable, vma: usize, phys: usize, flags: PteFlags) {
    let parts = VirtAddrParts::decompose(vma);
    // SAFETY: `root` is the live root table being constructed during boot
    // and not yet installed into `satp`.
    let l2 = unsafe { &mut *root };
    l2.entry_mut(parts.vpn[2]).set(
        phys,
        flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
    );
}

/// Unmap the leaf PTE for `vma` and return the physical frame it pointed
/// at, without freeing it -- callers decide whether to recycle the frame.
pub fn unmap_page(root: *mut PageTable, vma: usize) -> KernelResult<usize> {
    let pte = walk(root, vma, false)?;
    if !pte.is_valid() {
        return Err(KernelError::NoEntry { name: "vma" });
    }
    let phys = pte.phys_addr();
    pte.clear();
    crate::arch::riscv64::sfence_vma();
    Ok(phys)
}

/// Build the `satp` value selecting Sv39 mode, no ASID, and `root` as the
/// root page table's physical frame.
pub fn make_satp(root_phys: usize) -> u64 {
    (SATP_MODE_SV39 << 60) | ((root_phys as u64) >> 12)
}

/// Recover the root page table's physical frame from a `satp` value
/// built by `make_satp`.
pub fn satp_root_phys(satp: u64) -> usize {
    ((satp & ((1u64 << 44) - 1)) << 12) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompose_recovers_page_offset() {
        let parts = VirtAddrParts::decompose(0x8010_1234);
        assert_eq!(parts.offset, 0x234);
    }

    #[test]
    fn satp_encodes_sv39_mode() {
        let satp = make_satp(0x8000_1000);
        assert_eq!(satp >> 60, SATP_MODE_SV39);
        assert_eq!((satp & 0x0FFF_FFFF_FFFF) << 12, 0x8000_1000);
    }

    #[test]
    fn pte_round_trips_phys_and_flags() {
        let mut pte = PageTableEntry::empty();
        pte.set(0x8020_3000, PteFlags::VALID | PteFlags::READ | PteFlags::WRITE);
        assert_eq!(pte.phys_addr(), 0x8020_3000);
        assert!(pte.flags().contains(PteFlags::READ));
        assert!(pte.is_leaf());
    }
}
