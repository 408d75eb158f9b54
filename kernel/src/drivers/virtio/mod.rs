//! VirtIO subsystem (§4.E, §6).
//!
//! One transport (MMIO, non-legacy) and one device class (block). The
//! rest of this codebase's PCI transport and other virtio device
//! classes (net, gpu, ...) are out of scope (§1).

pub mod blk;
pub mod mmio;
pub mod queue;
