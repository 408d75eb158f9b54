#![no_std]
#![no_main]

use core::panic::PanicInfo;

use rv39_kernel::{arch, drivers, log_service, mm, println, process};

#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    log_service::log_init();
    println!("rv39-kernel v{}", env!("CARGO_PKG_VERSION"));
    println!("arch: riscv64 (Sv39)");

    // SAFETY: this is the first and only call, before anything allocates.
    unsafe { rv39_kernel::init_heap() };

    // SAFETY: this is the first and only call, before any other code
    // touches the frame allocator or an address space.
    let _kernel_space = unsafe { mm::init() };
    log::info!("boot: memory management initialized");

    drivers::init();
    log::info!("boot: drivers probed");

    process::procmgr_init();
    log::info!("boot: process 0 installed");

    // Handing off to a runnable thread requires a `SchedulerOps`
    // collaborator (`sched::set_scheduler`), which lives outside this
    // kernel core (§1). There being none wired up here, boot stops after
    // bringing every in-scope subsystem up.
    log::info!("boot: complete, no scheduler collaborator installed -- halting");
    arch::halt();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::halt();
}
