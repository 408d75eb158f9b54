//! Device drivers.
//!
//! One device class is in scope: VirtIO block (§1, §4.E). Everything
//! else the rest of this codebase carries -- network, USB, GPU, PCI,
//! console, ... -- sits outside this kernel core's boundary.

pub mod virtio;

/// Probe for and attach every virtio-blk instance this kernel boots
/// with.
pub fn init() {
    virtio::blk::init();
}
