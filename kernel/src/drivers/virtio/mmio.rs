//! VirtIO-MMIO (modern, non-legacy) register transport (§4.E, §6).
//!
//! The only transport this kernel core speaks: the legacy PCI transport
//! and every device class besides block (console, network, GPU, ...)
//! are out of scope (§1). QEMU's `virt` machine exposes each virtio
//! device at a fixed 0x1000-byte-stride MMIO window; this module probes
//! that fixed set of windows rather than walking a device tree.

use crate::arch::barriers::memory_fence;
use crate::error::{KernelError, KernelResult};

/// MMIO windows QEMU's `virt` machine places virtio-mmio devices at.
pub const DEFAULT_BASES: [usize; 8] = [
    0x1000_1000,
    0x1000_2000,
    0x1000_3000,
    0x1000_4000,
    0x1000_5000,
    0x1000_6000,
    0x1000_7000,
    0x1000_8000,
];

/// Device ID of a block device (§6: "device ID 2 = block").
pub const VIRTIO_ID_BLOCK: u32 = 2;

const MAGIC_VALUE: u32 = 0x7472_6976; // "virt", little-endian

mod reg {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_AVAIL_LOW: usize = 0x090;
    pub const QUEUE_AVAIL_HIGH: usize = 0x094;
    pub const QUEUE_USED_LOW: usize = 0x0a0;
    pub const QUEUE_USED_HIGH: usize = 0x0a4;
    pub const CONFIG: usize = 0x100;
}

pub mod status {
    pub const ACKNOWLEDGE: u32 = 1;
    pub const DRIVER: u32 = 2;
    pub const DRIVER_OK: u32 = 4;
    pub const FEATURES_OK: u32 = 8;
    pub const FAILED: u32 = 128;
}

/// Feature bits this driver negotiates (§4.E step 3). `RING_RESET` and
/// `INDIRECT_DESC` are required; a device that doesn't offer both fails
/// attach. `BLK_SIZE`/`TOPOLOGY` are requested opportunistically --
/// refusal just means falling back to a 512-byte `blksz`.
pub mod features {
    pub const RING_RESET: u64 = 1 << 40;
    pub const INDIRECT_DESC: u64 = 1 << 28;
    pub const BLK_SIZE: u64 = 1 << 6;
    pub const TOPOLOGY: u64 = 1 << 10;
}

/// virtio-blk config-space field offsets (relative to `reg::CONFIG`):
/// `capacity` is always in 512-byte sectors, `blk_size` only valid when
/// `BLK_SIZE` was accepted.
mod blk_config {
    pub const CAPACITY: usize = 0x00;
    pub const BLK_SIZE: usize = 0x08;
}

/// One probed virtio-mmio register window, not yet attached.
pub struct VirtioMmioRegs {
    base: usize,
}

impl VirtioMmioRegs {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `base` is an identity-mapped MMIO window whose span
        // covers every offset this module reads (verified by `probe`).
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: same as `read32`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) };
    }

    /// Probe `base` for a virtio-mmio block device (§4.E step 1): the
    /// magic value and device id must match, and the device must be
    /// reporting the non-legacy (version >= 2) register layout this
    /// module assumes.
    pub fn probe(base: usize) -> Option<Self> {
        let regs = Self { base };
        if regs.read32(reg::MAGIC) != MAGIC_VALUE {
            return None;
        }
        if regs.read32(reg::VERSION) < 2 {
            return None;
        }
        if regs.read32(reg::DEVICE_ID) != VIRTIO_ID_BLOCK {
            return None;
        }
        Some(regs)
    }

    fn set_status(&self, bits: u32) {
        let current = self.read32(reg::STATUS);
        self.write32(reg::STATUS, current | bits);
    }

    fn set_failed(&self) {
        self.set_status(status::FAILED);
    }

    /// The 64-bit device-feature bitmap, read through the two 32-bit
    /// feature-select windows.
    fn device_features(&self) -> u64 {
        self.write32(reg::DEVICE_FEATURES_SEL, 0);
        let low = self.read32(reg::DEVICE_FEATURES) as u64;
        self.write32(reg::DEVICE_FEATURES_SEL, 1);
        let high = self.read32(reg::DEVICE_FEATURES) as u64;
        low | (high << 32)
    }

    fn set_driver_features(&self, accepted: u64) {
        self.write32(reg::DRIVER_FEATURES_SEL, 0);
        self.write32(reg::DRIVER_FEATURES, accepted as u32);
        self.write32(reg::DRIVER_FEATURES_SEL, 1);
        self.write32(reg::DRIVER_FEATURES, (accepted >> 32) as u32);
    }

    /// Run the attach sequence through feature negotiation (§4.E steps
    /// 1-3), returning the accepted feature bitmap. Fails the device and
    /// returns an error if either required bit is missing or the device
    /// refuses `FEATURES_OK`.
    pub fn negotiate(&self) -> KernelResult<u64> {
        self.write32(reg::STATUS, 0);
        self.set_status(status::ACKNOWLEDGE);
        self.set_status(status::DRIVER);
        memory_fence();

        let offered = self.device_features();
        let required = features::RING_RESET | features::INDIRECT_DESC;
        if offered & required != required {
            self.set_failed();
            return Err(KernelError::Unsupported {
                operation: "virtio-blk missing RING_RESET/INDIRECT_DESC",
            });
        }

        let requested = features::BLK_SIZE | features::TOPOLOGY;
        let accepted = required | (offered & requested);
        self.set_driver_features(accepted);
        self.set_status(status::FEATURES_OK);
        memory_fence();
        if self.read32(reg::STATUS) & status::FEATURES_OK == 0 {
            self.set_failed();
            return Err(KernelError::Unsupported {
                operation: "virtio-blk FEATURES_OK rejected",
            });
        }
        Ok(accepted)
    }

    /// Queue 0's maximum supported size, queried before deciding whether
    /// the device can host a 1-entry queue.
    pub fn queue0_num_max(&self) -> u32 {
        self.write32(reg::QUEUE_SEL, 0);
        self.read32(reg::QUEUE_NUM_MAX)
    }

    /// Size queue 0 to one entry and hand the device its physical
    /// addresses (§4.E step 6).
    pub fn set_queue0(&self, desc: u64, avail: u64, used: u64) {
        self.write32(reg::QUEUE_SEL, 0);
        self.write32(reg::QUEUE_NUM, 1);
        self.write32(reg::QUEUE_DESC_LOW, desc as u32);
        self.write32(reg::QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.write32(reg::QUEUE_AVAIL_LOW, avail as u32);
        self.write32(reg::QUEUE_AVAIL_HIGH, (avail >> 32) as u32);
        self.write32(reg::QUEUE_USED_LOW, used as u32);
        self.write32(reg::QUEUE_USED_HIGH, (used >> 32) as u32);
        self.write32(reg::QUEUE_READY, 1);
    }

    pub fn set_driver_ok(&self) {
        self.set_status(status::DRIVER_OK);
    }

    pub fn notify_queue0(&self) {
        self.write32(reg::QUEUE_NOTIFY, 0);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read32(reg::INTERRUPT_STATUS)
    }

    pub fn ack_interrupt(&self, bits: u32) {
        self.write32(reg::INTERRUPT_ACK, bits);
    }

    pub fn capacity_sectors(&self) -> u64 {
        let low = self.read32(reg::CONFIG + blk_config::CAPACITY) as u64;
        let high = self.read32(reg::CONFIG + blk_config::CAPACITY + 4) as u64;
        low | (high << 32)
    }

    pub fn config_block_size(&self) -> u32 {
        self.read32(reg::CONFIG + blk_config::BLK_SIZE)
    }
}
