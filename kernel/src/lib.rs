//! Library crate for the RV64 Sv39 supervisor-mode kernel core.
//!
//! Exports the subsystems `main.rs` drives at boot and that the
//! integration tests under `tests/` exercise directly.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare-metal targets use the kernel heap over `linked_list_allocator`; the
// host target (used for `cargo test` on the development machine) delegates
// to the system allocator so `Vec`/`String`/`Arc` work the same way in
// unit tests as they do on real hardware.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the kernel heap's backing region to the global allocator. Must be
/// called once, early in boot, before anything allocates.
///
/// # Safety
/// Must be called at most once, before any other thread could be
/// allocating concurrently.
#[cfg(target_os = "none")]
pub unsafe fn init_heap() {
    // SAFETY: delegated to caller.
    unsafe { mm::heap::init(&ALLOCATOR) };
}

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod print;
pub mod serial;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod io;
pub mod log_service;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;

mod test_framework;
#[cfg(test)]
pub use test_framework::test_runner;
pub use test_framework::{
    cycles_to_ns, exit_qemu, read_timestamp, test_panic_handler, BenchmarkRunner, QemuExitCode,
    Testable,
};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}
