//! Timebase access via the `time` CSR.
//!
//! QEMU's `virt` machine clocks the `time` CSR at a fixed 10 MHz; this
//! kernel core has no timer-interrupt-driven scheduler (§1), so the only
//! use of this is wall-clock timestamps for logging and tests.

const TIMEBASE_HZ: u64 = 10_000_000;

/// Raw `time` CSR value.
#[cfg(target_arch = "riscv64")]
pub fn get_ticks() -> u64 {
    let time: u64;
    // SAFETY: `rdtime` is a pure, unprivileged register read.
    unsafe { core::arch::asm!("rdtime {}", out(reg) time) };
    time
}

/// Host builds have no `time` CSR; a monotonically increasing counter
/// stands in so callers (logging, benchmarks) still see distinct,
/// non-decreasing values under test.
#[cfg(not(target_arch = "riscv64"))]
pub fn get_ticks() -> u64 {
    use core::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Milliseconds since boot, derived from the `time` CSR.
pub fn get_timestamp_ms() -> u64 {
    get_ticks() / (TIMEBASE_HZ / 1000)
}
