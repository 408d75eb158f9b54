//! Single in-flight virtqueue (§4.E, §9).
//!
//! This kernel core never has more than one VirtIO request outstanding
//! per device -- the device's own sleep-lock serializes every request --
//! so the split virtqueue degenerates to a 1-slot avail ring, a 1-slot
//! used ring, and a fixed 4-descriptor indirect chain. The donor layout
//! overlapped these in one struct via union fillers; here they are plain
//! fields of one `repr(C)` block, no overlap, no union.

use crate::arch::barriers::memory_fence;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator;
use crate::mm::layout::PAGE_SIZE;

pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;
pub const DESC_F_INDIRECT: u16 = 4;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvail1 {
    flags: u16,
    idx: u16,
    ring: [u16; 1],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed1 {
    flags: u16,
    idx: u16,
    ring: [VirtqUsedElem; 1],
}

/// Request header carried by the indirect chain's first descriptor;
/// `sector` is always in 512-byte units regardless of the device's
/// negotiated `blksz` (§6).
#[repr(C)]
struct ReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// One outer descriptor (queue size 1, always `INDIRECT`), the 3-entry
/// indirect table it points at (header, data, status), the matching
/// 1-slot avail/used rings, and the embedded header + status byte the
/// indirect chain's descriptors address (§4.E step 5).
#[repr(C, align(4096))]
struct QueueMem {
    desc: [VirtqDesc; 1],
    indirect: [VirtqDesc; 3],
    avail: VirtqAvail1,
    used: VirtqUsed1,
    header: ReqHeader,
    status: u8,
}

/// A device's single virtqueue plus its data bounce buffer. Allocated
/// once at attach time and never freed -- the device it belongs to lives
/// for the rest of the kernel's run.
pub struct Virtqueue {
    mem: *mut QueueMem,
    mem_phys: usize,
    data_phys: usize,
    data_cap: usize,
    last_used_idx: u16,
}

// SAFETY: `mem`/`data_phys` address frames this queue owns exclusively
// for its whole lifetime. Every method call is serialized externally by
// the owning device's sleep-lock (§4.E), so no two threads ever touch
// the pointee concurrently.
unsafe impl Send for Virtqueue {}
// SAFETY: same reasoning as the `Send` impl above.
unsafe impl Sync for Virtqueue {}

impl Virtqueue {
    /// Allocate the queue's frame and a same-size data bounce buffer
    /// (capped at one page), and wire up the fixed 4-descriptor indirect
    /// chain (§4.E step 5).
    pub fn new(data_cap: usize) -> KernelResult<Self> {
        if data_cap == 0 || data_cap > PAGE_SIZE {
            return Err(KernelError::InvalidArgument {
                name: "data_cap",
                value: "must be 1..=PAGE_SIZE",
            });
        }

        let mem_phys = frame_allocator::alloc_page()?;
        let data_phys = match frame_allocator::alloc_page() {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: `mem_phys` was allocated immediately above and
                // has not been published anywhere else yet.
                unsafe { frame_allocator::free_page(mem_phys) };
                return Err(e);
            }
        };

        let mem = mem_phys as *mut QueueMem;
        // SAFETY: `mem` is a freshly zeroed, exclusively owned page-sized
        // frame, at least `size_of::<QueueMem>()` bytes.
        let queue = unsafe { &mut *mem };

        let indirect_phys = mem_phys + core::mem::offset_of!(QueueMem, indirect);
        queue.desc[0] = VirtqDesc {
            addr: indirect_phys as u64,
            len: (3 * core::mem::size_of::<VirtqDesc>()) as u32,
            flags: DESC_F_INDIRECT,
            next: 0,
        };

        let header_phys = mem_phys + core::mem::offset_of!(QueueMem, header);
        let status_phys = mem_phys + core::mem::offset_of!(QueueMem, status);
        queue.indirect[0] = VirtqDesc {
            addr: header_phys as u64,
            len: core::mem::size_of::<ReqHeader>() as u32,
            flags: DESC_F_NEXT,
            next: 1,
        };
        queue.indirect[1] = VirtqDesc {
            addr: data_phys as u64,
            len: data_cap as u32,
            flags: DESC_F_NEXT,
            next: 2,
        };
        queue.indirect[2] = VirtqDesc {
            addr: status_phys as u64,
            len: 1,
            flags: DESC_F_WRITE,
            next: 0,
        };

        Ok(Self {
            mem,
            mem_phys,
            data_phys,
            data_cap,
            last_used_idx: 0,
        })
    }

    fn queue_mem(&self) -> &mut QueueMem {
        // SAFETY: exclusively owned by this queue; callers are always
        // serialized by the owning device's sleep-lock.
        unsafe { &mut *self.mem }
    }

    pub fn phys_desc(&self) -> u64 {
        self.mem_phys as u64
    }

    pub fn phys_avail(&self) -> u64 {
        (self.mem_phys + core::mem::offset_of!(QueueMem, avail)) as u64
    }

    pub fn phys_used(&self) -> u64 {
        (self.mem_phys + core::mem::offset_of!(QueueMem, used)) as u64
    }

    /// Copy `buf` into the data bounce buffer ahead of a write request.
    pub fn write_data(&self, buf: &[u8]) {
        debug_assert!(buf.len() <= self.data_cap);
        // SAFETY: `data_phys` is identity-mapped, exclusively owned by
        // this queue, and at least `data_cap` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), self.data_phys as *mut u8, buf.len())
        };
    }

    /// Copy out of the data bounce buffer after a read request completes.
    pub fn read_data(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() <= self.data_cap);
        // SAFETY: same as `write_data`.
        unsafe {
            core::ptr::copy_nonoverlapping(self.data_phys as *const u8, buf.as_mut_ptr(), buf.len())
        };
    }

    /// Fill in the header, flip the data descriptor's direction for
    /// `type_`, and publish the chain to the avail ring with a full
    /// memory fence ahead of the index bump (§4.E request protocol).
    /// Does not notify the device -- the caller owns the notify/wait
    /// sequence.
    pub fn post(&mut self, type_: u32, sector: u64, len: u32) {
        debug_assert!(len as usize <= self.data_cap);
        let mem = self.queue_mem();
        mem.header.type_ = type_;
        mem.header.reserved = 0;
        mem.header.sector = sector;
        mem.indirect[1].len = len;
        mem.indirect[1].flags = DESC_F_NEXT | if type_ == VIRTIO_BLK_T_IN { DESC_F_WRITE } else { 0 };

        mem.avail.ring[0] = 0;
        memory_fence();
        mem.avail.idx = mem.avail.idx.wrapping_add(1);
    }

    /// Whether the device has advanced the used index past our last
    /// observed completion -- the condition the wait idiom polls (§5).
    pub fn has_completed(&self) -> bool {
        memory_fence();
        self.queue_mem().used.idx != self.last_used_idx
    }

    /// Consume the completion and return the request's status byte.
    pub fn take_status(&mut self) -> u8 {
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        self.queue_mem().status
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;

    /// Seed the global frame allocator once with leaked host memory so
    /// `Virtqueue::new` has real frames to hand out. Leaking (rather than
    /// freeing at the end of the test) avoids a dangling free-list entry
    /// once later tests keep drawing from the same pool.
    fn ensure_test_allocator() {
        static INIT: spin::Once<()> = spin::Once::new();
        INIT.call_once(|| {
            let pages = 64;
            let backing: &'static mut [u8] =
                alloc::vec![0u8; pages * PAGE_SIZE + PAGE_SIZE].leak();
            let base = backing.as_mut_ptr() as usize;
            let start = crate::mm::layout::page_align_up(base);
            // SAFETY: `backing` is leaked for the life of the test binary
            // and not otherwise in use.
            unsafe {
                frame_allocator::FRAME_ALLOCATOR
                    .lock()
                    .init(start, start + pages * PAGE_SIZE)
            };
        });
    }

    #[test]
    fn post_flips_data_direction_for_read_vs_write() {
        ensure_test_allocator();
        let mut vq = Virtqueue::new(512).expect("alloc");
        vq.post(VIRTIO_BLK_T_IN, 3, 512);
        assert_eq!(vq.queue_mem().indirect[1].flags & DESC_F_WRITE, DESC_F_WRITE);
        vq.post(VIRTIO_BLK_T_OUT, 3, 512);
        assert_eq!(vq.queue_mem().indirect[1].flags & DESC_F_WRITE, 0);
    }

    #[test]
    fn avail_idx_advances_once_per_post() {
        ensure_test_allocator();
        let mut vq = Virtqueue::new(512).expect("alloc");
        vq.post(VIRTIO_BLK_T_IN, 0, 512);
        assert_eq!(vq.queue_mem().avail.idx, 1);
        vq.post(VIRTIO_BLK_T_IN, 1, 512);
        assert_eq!(vq.queue_mem().avail.idx, 2);
    }

    #[test]
    fn data_round_trips_through_bounce_buffer() {
        ensure_test_allocator();
        let vq = Virtqueue::new(512).expect("alloc");
        let input = [7u8; 512];
        vq.write_data(&input);
        let mut out = [0u8; 512];
        vq.read_data(&mut out);
        assert_eq!(out, input);
    }
}
