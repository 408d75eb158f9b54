//! Architecture support.
//!
//! RV64 Sv39 is the only target this kernel core runs on (§1); there is no
//! per-arch dispatch left to do here.

pub mod barriers;
pub mod riscv64;
pub mod timer;

pub use riscv64::*;
