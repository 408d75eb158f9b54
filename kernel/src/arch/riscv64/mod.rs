//! RISC-V 64 (Sv39) architecture support.
//!
//! Every CSR/TLB/WFI primitive here is real inline assembly on
//! `target_arch = "riscv64"` and a host-safe stand-in otherwise, so the
//! core algorithms that call through this module (frame allocator, page
//! table, VM manager) build and unit-test on the host development target
//! as well as on bare metal.

#[cfg(target_arch = "riscv64")]
pub mod boot;

pub fn init() {}

#[cfg(target_arch = "riscv64")]
pub fn halt() -> ! {
    loop {
        // SAFETY: `wfi` just idles the hart until the next interrupt; no
        // memory-safety precondition.
        unsafe { core::arch::asm!("wfi") };
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[allow(dead_code)]
#[cfg(target_arch = "riscv64")]
pub fn enable_interrupts() {
    // SAFETY: setting sstatus.SIE is always sound; it only affects whether
    // pending S-mode interrupts are taken.
    unsafe {
        core::arch::asm!("csrsi sstatus, 2");
    }
}

#[allow(dead_code)]
#[cfg(not(target_arch = "riscv64"))]
pub fn enable_interrupts() {}

/// Disable S-mode interrupts, restoring the previous state when the
/// returned guard drops.
#[allow(dead_code)]
#[cfg(target_arch = "riscv64")]
pub fn disable_interrupts() -> impl Drop {
    struct InterruptGuard {
        was_enabled: bool,
    }

    impl Drop for InterruptGuard {
        fn drop(&mut self) {
            if self.was_enabled {
                // SAFETY: same as `enable_interrupts`.
                unsafe {
                    core::arch::asm!("csrsi sstatus, 2");
                }
            }
        }
    }

    let mut sstatus: usize;
    // SAFETY: reading sstatus then clearing SIE is a pure CSR read-modify,
    // no side effects beyond interrupt maskability.
    unsafe {
        core::arch::asm!("csrr {}, sstatus", out(reg) sstatus);
        core::arch::asm!("csrci sstatus, 2");
    }
    InterruptGuard {
        was_enabled: (sstatus & 0x2) != 0,
    }
}

#[allow(dead_code)]
#[cfg(not(target_arch = "riscv64"))]
pub fn disable_interrupts() -> impl Drop {
    struct NoopGuard;
    impl Drop for NoopGuard {
        fn drop(&mut self) {}
    }
    NoopGuard
}

#[allow(dead_code)]
#[cfg(target_arch = "riscv64")]
pub fn idle() {
    // SAFETY: see `halt`.
    unsafe { core::arch::asm!("wfi") };
}

#[allow(dead_code)]
#[cfg(not(target_arch = "riscv64"))]
pub fn idle() {
    core::hint::spin_loop();
}

/// Flush the entire TLB. Used after any PTE mutation and after a page is
/// recycled by the frame allocator, so a stale translation can never alias
/// a frame's new owner.
#[cfg(target_arch = "riscv64")]
pub fn sfence_vma() {
    // SAFETY: `sfence.vma` with no operands flushes all ASIDs/addresses;
    // it has no memory-safety precondition beyond being run in S-mode.
    unsafe { core::arch::asm!("sfence.vma", options(nostack)) };
}

#[cfg(not(target_arch = "riscv64"))]
pub fn sfence_vma() {}

/// Read the current `satp` CSR.
#[cfg(target_arch = "riscv64")]
pub fn read_satp() -> u64 {
    let satp: u64;
    // SAFETY: `csrr` is a pure register read.
    unsafe { core::arch::asm!("csrr {}, satp", out(reg) satp) };
    satp
}

#[cfg(not(target_arch = "riscv64"))]
pub fn read_satp() -> u64 {
    0
}

/// Write `satp` and fence the TLB so the new root table takes effect for
/// subsequent instructions.
///
/// # Safety
/// `satp` must encode a root page table that maps the code currently
/// executing and will go on executing after the switch.
#[cfg(target_arch = "riscv64")]
pub unsafe fn write_satp(satp: u64) {
    // SAFETY: delegated to caller.
    unsafe { core::arch::asm!("csrw satp, {}", in(reg) satp) };
    sfence_vma();
}

/// # Safety
/// Same contract as the `target_arch = "riscv64"` version; host builds have
/// no MMU to switch, so this is a no-op kept only so callers link.
#[cfg(not(target_arch = "riscv64"))]
pub unsafe fn write_satp(_satp: u64) {}

pub fn serial_init() -> crate::serial::Uart16550Compat {
    // QEMU virt machine places 16550 UART at 0x10000000
    let mut uart = crate::serial::Uart16550Compat::new(0x1000_0000);
    uart.init();
    uart
}
