//! ELF64 RV64 loader (§4.G).
//!
//! Loads one `ET_EXEC` image into a caller-supplied [`AddressSpace`]. Every
//! `PT_LOAD` segment is mapped R+W+U first so its file contents can be
//! copied and its BSS tail zeroed through the identity-mapped physical
//! range, then rewritten to its final permissions -- a segment is never
//! executable and writable from the moment its frames exist.

use core::mem;

use crate::error::{KernelError, KernelResult};
use crate::io::IoHandle;
use crate::mm::layout::{page_align_down, page_align_up, PAGE_SIZE, USER_END_VMA, USER_START_VMA};
use crate::mm::page_table::PteFlags;
use crate::mm::vm::{self, AddressSpace};

const EI_MAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS64: u8 = 2;
const EI_DATA_LSB: u8 = 1;
const EI_VERSION_CURRENT: u8 = 1;
const EI_OSABI_NONE: u8 = 0;

const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

fn bad(detail: &'static str) -> KernelError {
    KernelError::BadFormat { detail }
}

fn read_at(io: &IoHandle, offset: usize, buf: &mut [u8]) -> KernelResult<()> {
    io.seek(offset)?;
    let n = io.read(buf)?;
    if n != buf.len() {
        return Err(KernelError::Io {
            detail: "short read loading ELF image",
        });
    }
    Ok(())
}

fn validate_header(io: &IoHandle) -> KernelResult<Elf64Header> {
    let mut raw = [0u8; mem::size_of::<Elf64Header>()];
    read_at(io, 0, &mut raw)?;
    // SAFETY: `Elf64Header` is `repr(C)` with only integer fields, and
    // `raw` is exactly its size.
    let header: Elf64Header = unsafe { core::ptr::read(raw.as_ptr() as *const Elf64Header) };

    if header.e_ident[0..4] != EI_MAG {
        return Err(bad("bad ELF magic"));
    }
    if header.e_ident[4] != EI_CLASS64 {
        return Err(bad("not a 64-bit ELF"));
    }
    if header.e_ident[5] != EI_DATA_LSB {
        return Err(bad("not little-endian"));
    }
    if header.e_ident[6] != EI_VERSION_CURRENT {
        return Err(bad("bad ELF identification version"));
    }
    if header.e_ident[7] != EI_OSABI_NONE {
        return Err(bad("unsupported OS/ABI"));
    }
    if header.e_machine != EM_RISCV {
        return Err(bad("not a RISC-V executable"));
    }
    if header.e_type != ET_EXEC {
        return Err(bad("not an ET_EXEC image"));
    }
    Ok(header)
}

fn segment_flags(p_flags: u32) -> PteFlags {
    let mut flags = PteFlags::USER;
    if p_flags & PF_R != 0 {
        flags |= PteFlags::READ;
    }
    if p_flags & PF_W != 0 {
        flags |= PteFlags::WRITE;
    }
    if p_flags & PF_X != 0 {
        flags |= PteFlags::EXEC;
    }
    flags
}

fn load_segment(
    space: &AddressSpace,
    io: &IoHandle,
    ph: &Elf64ProgramHeader,
) -> KernelResult<()> {
    if ph.p_filesz > ph.p_memsz {
        return Err(bad("segment file size exceeds memory size"));
    }

    let vaddr = ph.p_vaddr as usize;
    let memsz = ph.p_memsz as usize;
    let filesz = ph.p_filesz as usize;

    let seg_start = vaddr;
    let seg_end = vaddr.checked_add(memsz).ok_or_else(|| bad("segment overflows address space"))?;
    if seg_start < USER_START_VMA || seg_end > USER_END_VMA {
        return Err(bad("PT_LOAD segment outside user region"));
    }

    let page_start = page_align_down(vaddr);
    let page_end = page_align_up(seg_end);
    let num_pages = (page_end - page_start) / PAGE_SIZE;

    // Map R+W+U first so the identity-mapped physical range backing
    // every page can be written to during load, regardless of the
    // segment's final permissions.
    vm::alloc_and_map_range(
        space,
        page_start,
        num_pages,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    )?;

    let mut remaining = filesz;
    let mut file_off = ph.p_offset as usize;
    let mut dest = vaddr;
    while remaining > 0 {
        let page = page_align_down(dest);
        let pte = crate::mm::page_table::walk(
            space.root_phys() as *mut crate::mm::page_table::PageTable,
            page,
            false,
        )?;
        let phys_page = pte.phys_addr();
        let page_off = dest - page;
        let chunk = (PAGE_SIZE - page_off).min(remaining);
        let phys = phys_page + page_off;
        // SAFETY: `page` was just mapped above and RAM is identity
        // mapped, so `page..page+PAGE_SIZE` is valid kernel-accessible
        // memory.
        let buf = unsafe { core::slice::from_raw_parts_mut(phys as *mut u8, chunk) };
        read_at(io, file_off, buf)?;
        dest += chunk;
        file_off += chunk;
        remaining -= chunk;
    }

    if memsz > filesz {
        let zero_start = vaddr + filesz;
        let zero_len = seg_end - zero_start;
        let mut done = 0;
        while done < zero_len {
            let at = zero_start + done;
            let page = page_align_down(at);
            let pte = crate::mm::page_table::walk(
                space.root_phys() as *mut crate::mm::page_table::PageTable,
                page,
                false,
            )?;
            let page_off = at - page;
            let chunk = (PAGE_SIZE - page_off).min(zero_len - done);
            let phys = pte.phys_addr() + page_off;
            // SAFETY: same mapped, identity-backed range as above.
            unsafe { core::ptr::write_bytes(phys as *mut u8, 0, chunk) };
            done += chunk;
        }
    }

    vm::set_range_flags(space, page_start, num_pages, segment_flags(ph.p_flags))?;
    Ok(())
}

/// Map an ELF image's PT_LOAD segments into `space` and return its entry
/// point. `space` is mapped into as-is -- the caller owns its lifetime and
/// is expected to have already reclaimed any previous user mappings, so
/// the process's root table frame is reused across `exec` rather than
/// replaced.
pub fn load(space: &AddressSpace, io: &IoHandle) -> KernelResult<usize> {
    let header = validate_header(io)?;
    if header.e_phoff == 0 || header.e_phnum == 0 {
        return Err(bad("no program headers"));
    }

    let ph_size = header.e_phentsize as usize;
    for i in 0..header.e_phnum as usize {
        let mut raw = [0u8; mem::size_of::<Elf64ProgramHeader>()];
        let off = header.e_phoff as usize + i * ph_size;
        read_at(io, off, &mut raw)?;
        // SAFETY: `Elf64ProgramHeader` is `repr(C)` with only integer
        // fields, and `raw` is exactly its size.
        let ph: Elf64ProgramHeader =
            unsafe { core::ptr::read(raw.as_ptr() as *const Elf64ProgramHeader) };
        if ph.p_type != PT_LOAD {
            continue;
        }
        load_segment(space, io, &ph)?;
    }

    Ok(header.e_entry as usize)
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::io::MemoryIo;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    /// One PT_LOAD segment: `code` at `USER_START_VMA`, R+X, with a BSS
    /// tail bringing the segment up to `memsz` bytes.
    fn build_image(code: &[u8], memsz: usize) -> IoHandle {
        let ehsize = mem::size_of::<Elf64Header>();
        let phsize = mem::size_of::<Elf64ProgramHeader>();
        let phoff = ehsize;
        let data_off = phoff + phsize;

        let mut image = alloc::vec![0u8; data_off + code.len()];

        let mut e_ident = [0u8; 16];
        e_ident[0..4].copy_from_slice(&EI_MAG);
        e_ident[4] = EI_CLASS64;
        e_ident[5] = EI_DATA_LSB;
        e_ident[6] = EI_VERSION_CURRENT;
        e_ident[7] = EI_OSABI_NONE;

        let header = Elf64Header {
            e_ident,
            e_type: ET_EXEC,
            e_machine: EM_RISCV,
            e_version: 1,
            e_entry: USER_START_VMA as u64,
            e_phoff: phoff as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: phsize as u16,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        // SAFETY: writing a `repr(C)` struct's bytes into a same-sized
        // buffer slot.
        unsafe {
            core::ptr::copy_nonoverlapping(
                &header as *const _ as *const u8,
                image.as_mut_ptr(),
                ehsize,
            );
        }

        let ph = Elf64ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: data_off as u64,
            p_vaddr: USER_START_VMA as u64,
            p_paddr: USER_START_VMA as u64,
            p_filesz: code.len() as u64,
            p_memsz: memsz as u64,
            p_align: PAGE_SIZE as u64,
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                &ph as *const _ as *const u8,
                image.as_mut_ptr().add(phoff),
                phsize,
            );
        }

        image[data_off..data_off + code.len()].copy_from_slice(code);
        Arc::new(MemoryIo::new(image))
    }

    #[test]
    fn rejects_bad_magic() {
        crate::mm::frame_allocator::test_support::ensure_pool();
        let mut bytes = Vec::new();
        bytes.resize(mem::size_of::<Elf64Header>(), 0u8);
        let io = Arc::new(MemoryIo::new(bytes));
        let space = AddressSpace::new_empty().unwrap();
        assert!(matches!(load(&space, &io), Err(KernelError::BadFormat { .. })));
    }

    #[test]
    fn loads_segment_and_zeroes_bss() {
        crate::mm::frame_allocator::test_support::ensure_pool();
        let code = [0x13, 0x00, 0x00, 0x00]; // addi x0, x0, 0 (nop)
        let io = build_image(&code, PAGE_SIZE);
        let space = AddressSpace::new_empty().unwrap();
        let entry = load(&space, &io).unwrap();
        assert_eq!(entry, USER_START_VMA);

        vm::validate_vptr_len(&space, USER_START_VMA, code.len(), PteFlags::EXEC).unwrap();
    }
}
