//! 16550-compatible UART the `virt` machine places at a fixed MMIO window.
//!
//! This is the console every [`crate::print`] macro and panic message goes
//! through; there is no other serial transport in scope (§1).

use core::fmt;

const THR: usize = 0x00; // Transmitter Holding Register
const LSR: usize = 0x05; // Line Status Register
const LSR_THRE: u8 = 1 << 5; // Transmitter Holding Register Empty

/// QEMU `virt` places the 16550 at this fixed MMIO address.
const UART_BASE: usize = 0x1000_0000;

pub struct Uart16550Compat {
    base_addr: usize,
}

impl Uart16550Compat {
    pub const fn new(base_addr: usize) -> Self {
        Self { base_addr }
    }

    pub fn init(&mut self) {
        // QEMU's `virt` machine boots the UART already configured for 8N1;
        // nothing to program here.
    }

    #[cfg(target_arch = "riscv64")]
    pub fn write_bytes(&self, bytes: &[u8]) {
        for &byte in bytes {
            // SAFETY: `base_addr` is the identity-mapped UART MMIO window
            // (mapped R+W during the boot mapping procedure); polling LSR
            // before writing THR is the standard 16550 handshake.
            unsafe {
                while core::ptr::read_volatile((self.base_addr + LSR) as *const u8) & LSR_THRE
                    == 0
                {
                    core::hint::spin_loop();
                }
                core::ptr::write_volatile((self.base_addr + THR) as *mut u8, byte);
            }
        }
    }

    /// Host builds have no UART MMIO window to dereference; print to the
    /// process's own stdout instead so logging is still visible under
    /// `cargo test`.
    #[cfg(not(target_arch = "riscv64"))]
    pub fn write_bytes(&self, bytes: &[u8]) {
        extern crate std;
        use std::io::Write;
        let _ = std::io::stdout().write_all(bytes);
    }
}

impl fmt::Write for Uart16550Compat {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

pub type SerialPort = Uart16550Compat;

pub fn create_serial_port() -> SerialPort {
    let mut uart = Uart16550Compat::new(UART_BASE);
    uart.init();
    uart
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;
    create_serial_port().write_fmt(args).unwrap();
}
