//! VirtIO block driver (§4.E).
//!
//! One instance slot per probed MMIO window, attached once at boot.
//! Every `open` of the same instance hands back a clone of the same
//! `Arc<VirtioBlkDevice>` -- `Arc`'s strong count already is the open
//! refcount (§4.J), so unlike the source this has no manual counter to
//! double-increment (§9).
//!
//! Only one request is ever in flight per device: `read`/`write` acquire
//! `lock` for their whole operation, so the virtqueue, the bounce buffer,
//! and `bufblkno` never see concurrent access.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::drivers::virtio::mmio::{self, VirtioMmioRegs};
use crate::drivers::virtio::queue::{
    Virtqueue, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use crate::error::{KernelError, KernelResult};
use crate::io::{IoCtl, IoDevice, IoHandle};
use crate::sched::{self, ConditionVariable};
use crate::sync::sleeplock::SleepLock;

/// Priority the ISR would be registered at under a real interrupt
/// controller (§4.E step 6). No such controller is in scope here (§1);
/// [`handle_interrupt`] is the function a trap path would call instead.
pub const VIOBLK_IRQ_PRIO: u32 = 1;

const FALLBACK_BLOCK_SIZE: usize = 512;
const SECTOR_SIZE: u64 = 512;
const DEVICE_NAME: &[u8] = b"blk";

/// One attached virtio-blk instance.
pub struct VirtioBlkDevice {
    regs: VirtioMmioRegs,
    instno: usize,
    readonly: bool,
    blksz: usize,
    size: u64,
    vq: core::cell::UnsafeCell<Virtqueue>,
    bufblkno: AtomicU64,
    pos: AtomicUsize,
    used_updated: ConditionVariable,
    lock: SleepLock,
}

const NO_CACHED_BLOCK: u64 = u64::MAX;

// SAFETY: `vq` is the only field not independently synchronized, and
// every method that touches it (`fill_cache`, `writeback`, `submit`,
// `read`, `write`) is only ever called while the caller holds `lock`
// (acquired at the top of `read`/`write`), which serializes access the
// same way the source's per-device sleep-lock does (§4.E).
unsafe impl Sync for VirtioBlkDevice {}

impl VirtioBlkDevice {
    /// Run the attach sequence (§4.E steps 1-6): negotiate features,
    /// read device geometry out of config space, build the virtqueue,
    /// hand its physical addresses to the device, and raise `DRIVER_OK`.
    fn attach(regs: VirtioMmioRegs, instno: usize) -> KernelResult<Arc<Self>> {
        let accepted = regs.negotiate()?;

        let blksz = if accepted & mmio::features::BLK_SIZE != 0 {
            let reported = regs.config_block_size() as usize;
            if reported == 0 { FALLBACK_BLOCK_SIZE } else { reported }
        } else {
            FALLBACK_BLOCK_SIZE
        };

        let capacity_sectors = regs.capacity_sectors();
        let size = capacity_sectors * SECTOR_SIZE;

        if regs.queue0_num_max() == 0 {
            return Err(KernelError::NoDevice {
                name: "virtio-blk queue 0",
            });
        }

        let vq = Virtqueue::new(blksz)?;
        regs.set_queue0(vq.phys_desc(), vq.phys_avail(), vq.phys_used());
        regs.set_driver_ok();

        log::info!(
            "virtio-blk[{instno}]: attached, {size} bytes, blksz={blksz}"
        );

        let id_base = 0x7669_6f00u64 + instno as u64; // "vio" + instance, two condvars apart
        Ok(Arc::new(Self {
            regs,
            instno,
            readonly: false,
            blksz,
            size,
            vq: core::cell::UnsafeCell::new(vq),
            bufblkno: AtomicU64::new(NO_CACHED_BLOCK),
            pos: AtomicUsize::new(0),
            used_updated: ConditionVariable::new(id_base),
            lock: SleepLock::new(id_base + 1),
        }))
    }

    fn vq(&self) -> &mut Virtqueue {
        // SAFETY: see the `Sync` impl's safety comment -- callers always
        // hold `lock` while this is live.
        unsafe { &mut *self.vq.get() }
    }

    fn sector_of(&self, block_num: u64) -> u64 {
        block_num * (self.blksz as u64 / SECTOR_SIZE)
    }

    fn status_to_result(status: u8) -> KernelResult<()> {
        match status {
            VIRTIO_BLK_S_OK => Ok(()),
            VIRTIO_BLK_S_UNSUPP => Err(KernelError::Unsupported {
                operation: "virtio-blk request type",
            }),
            // VIRTIO_BLK_S_IOERR and any other value are both I/O
            // failures as far as a caller is concerned (§6).
            _ => Err(KernelError::Io {
                detail: "virtio-blk request failed",
            }),
        }
    }

    /// Post one request, notify the device, and block on `used_updated`
    /// until the completion shows up in the used ring (§4.E request
    /// protocol, §5 wait idiom).
    fn submit(&self, type_: u32, block_num: u64) -> u8 {
        let vq = self.vq();
        vq.post(type_, self.sector_of(block_num), self.blksz as u32);
        crate::arch::barriers::memory_fence();
        self.regs.notify_queue0();

        let was_enabled = sched::scheduler().intr_disable();
        while !vq.has_completed() {
            sched::scheduler().condition_wait(&self.used_updated);
        }
        sched::scheduler().intr_restore(was_enabled);

        vq.take_status()
    }

    /// Ensure the bounce buffer holds `block_num`'s contents, issuing a
    /// read only if it doesn't already.
    fn fill_cache(&self, block_num: u64) -> KernelResult<()> {
        if self.bufblkno.load(Ordering::Acquire) == block_num {
            return Ok(());
        }
        let status = self.submit(VIRTIO_BLK_T_IN, block_num);
        Self::status_to_result(status)?;
        self.bufblkno.store(block_num, Ordering::Release);
        Ok(())
    }

    fn writeback(&self, block_num: u64) -> KernelResult<()> {
        let status = self.submit(VIRTIO_BLK_T_OUT, block_num);
        Self::status_to_result(status)?;
        self.bufblkno.store(block_num, Ordering::Release);
        Ok(())
    }

    /// Read `interrupt_status`; broadcast `used_updated` on a used-ring
    /// notify, re-negotiate on a config change, and ack whatever bits
    /// were seen by writing them back to `interrupt_ack` (§4.E ISR).
    pub fn handle_interrupt(&self) {
        const USED_NOTIFY: u32 = 1 << 0;
        const CONFIG_CHANGE: u32 = 1 << 1;

        let bits = self.regs.interrupt_status();
        if bits & USED_NOTIFY != 0 {
            sched::scheduler().condition_broadcast(&self.used_updated);
        }
        if bits & CONFIG_CHANGE != 0 {
            let _ = self.regs.negotiate();
        }
        self.regs.ack_interrupt(bits);
    }
}

impl IoDevice for VirtioBlkDevice {
    /// Split the transfer into a head-partial, zero or more full blocks,
    /// and a tail-partial, serving each from the bounce buffer (§4.E
    /// request protocol, §8 property 5).
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let _guard = self.lock.lock();
        let start = self.pos.load(Ordering::Relaxed) as u64;
        let n = (buf.len() as u64).min(self.size.saturating_sub(start)) as usize;

        let mut done = 0usize;
        let mut pos = start;
        while done < n {
            let block_num = pos / self.blksz as u64;
            let offset = (pos % self.blksz as u64) as usize;
            let chunk = (self.blksz - offset).min(n - done);

            self.fill_cache(block_num)?;
            let mut block = vec![0u8; self.blksz];
            self.vq().read_data(&mut block);
            buf[done..done + chunk].copy_from_slice(&block[offset..offset + chunk]);

            done += chunk;
            pos += chunk as u64;
        }
        self.pos.store(pos as usize, Ordering::Relaxed);
        Ok(done)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let _guard = self.lock.lock();
        if self.readonly {
            return Err(KernelError::AccessDenied { addr: 0 });
        }

        let start = self.pos.load(Ordering::Relaxed) as u64;
        let n = buf.len();

        let mut done = 0usize;
        let mut pos = start;
        while done < n {
            let block_num = pos / self.blksz as u64;
            let offset = (pos % self.blksz as u64) as usize;
            let chunk = (self.blksz - offset).min(n - done);
            let full_block = offset == 0 && chunk == self.blksz;

            let mut block = vec![0u8; self.blksz];
            if full_block {
                block[..chunk].copy_from_slice(&buf[done..done + chunk]);
            } else {
                // Partial block: read-modify-write (§4.E request protocol).
                self.fill_cache(block_num)?;
                self.vq().read_data(&mut block);
                block[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
            }
            self.vq().write_data(&block);
            self.writeback(block_num)?;

            done += chunk;
            pos += chunk as u64;
        }
        self.pos.store(pos as usize, Ordering::Relaxed);
        Ok(done)
    }

    fn ctl(&self, cmd: IoCtl, arg: usize) -> KernelResult<usize> {
        match cmd {
            IoCtl::GetLen => Ok(self.size as usize),
            IoCtl::GetPos => Ok(self.pos.load(Ordering::Relaxed)),
            IoCtl::SetPos => {
                self.pos.store(arg, Ordering::Relaxed);
                Ok(0)
            }
            IoCtl::GetBlkSz => Ok(self.blksz),
        }
    }
}

const MAX_INSTANCES: usize = mmio::DEFAULT_BASES.len();

static DEVICES: [spin::Once<Arc<VirtioBlkDevice>>; MAX_INSTANCES] =
    [const { spin::Once::new() }; MAX_INSTANCES];

/// Probe every known MMIO window and attach whatever answers as a block
/// device. Called once during boot; a window that doesn't probe or
/// fails to negotiate is skipped, not fatal.
pub fn init() {
    for (instno, &base) in mmio::DEFAULT_BASES.iter().enumerate() {
        let Some(regs) = VirtioMmioRegs::probe(base) else {
            continue;
        };
        match VirtioBlkDevice::attach(regs, instno) {
            Ok(device) => {
                DEVICES[instno].call_once(|| device);
            }
            Err(e) => log::warn!("virtio-blk[{instno}]: attach failed: {e:?}"),
        }
    }
}

/// `DEVOPEN` handler for the `"blk"` device class: instance `instno`
/// must already be attached. Every open shares the one `Arc` -- cloning
/// it is the entire refcount bump (§9: the source's double-increment
/// bug has no analogue here).
pub fn open(name: &[u8], instno: usize) -> KernelResult<IoHandle> {
    if name != DEVICE_NAME {
        return Err(KernelError::NoDevice {
            name: "unknown device class",
        });
    }
    let slot = DEVICES.get(instno).ok_or(KernelError::NoDevice {
        name: "virtio-blk instance out of range",
    })?;
    let device = slot.get().ok_or(KernelError::NoDevice {
        name: "virtio-blk instance not attached",
    })?;
    Ok(Arc::clone(device) as IoHandle)
}
