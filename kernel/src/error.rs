//! Kernel error types
//!
//! A single [`KernelError`] enum is the currency of every fallible core
//! operation. [`KernelError::errno`] performs the one authorized conversion
//! from a typed error into the negated integer that crosses the syscall
//! boundary (see `syscall`); nothing else in the kernel does that mapping.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A supplied argument was malformed (bad flags, zero-length range, etc).
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// The resource is already in use by another request (one VirtIO request
    /// in flight per device).
    Busy { resource: &'static str },
    /// The operation or feature bit is not supported by this build.
    Unsupported { operation: &'static str },
    /// No such device (wrong device id, instance out of range).
    NoDevice { name: &'static str },
    /// I/O failure: short read/write, device status != OK.
    Io { detail: &'static str },
    /// Malformed on-disk/wire format (bad ELF header, bad FS magic, file
    /// not found, open-file table exhausted).
    BadFormat { detail: &'static str },
    /// Name lookup failure distinct from a malformed structure.
    NoEntry { name: &'static str },
    /// A user pointer failed validation, or a lock's owner check failed.
    AccessDenied { addr: usize },
    /// The physical frame free list is empty. Fatal during mandatory kernel
    /// mapping; every caller that can reach this fail-stops instead of
    /// propagating it.
    OutOfMemory,
    /// Subsystem used before its `init()` ran.
    NotInitialized { subsystem: &'static str },
}

/// Result type alias used throughout the kernel core.
pub type KernelResult<T> = Result<T, KernelError>;

/// Negated positive error codes returned in a syscall's `a0`, per the
/// syscall ABI table.
pub mod errno {
    pub const EINVAL: i64 = 1;
    pub const EBUSY: i64 = 2;
    pub const ENOTSUP: i64 = 3;
    pub const ENODEV: i64 = 4;
    pub const EIO: i64 = 5;
    pub const EBADFMT: i64 = 6;
    pub const ENOENT: i64 = 7;
    pub const EACCESS: i64 = 8;
}

impl KernelError {
    /// Map this error onto the negated errno table in `§6` of the
    /// specification. This is the only place in the kernel that performs
    /// this conversion.
    pub const fn errno(&self) -> i64 {
        match self {
            Self::InvalidArgument { .. } => -errno::EINVAL,
            Self::Busy { .. } => -errno::EBUSY,
            Self::Unsupported { .. } => -errno::ENOTSUP,
            Self::NoDevice { .. } => -errno::ENODEV,
            Self::Io { .. } => -errno::EIO,
            Self::BadFormat { .. } => -errno::EBADFMT,
            Self::NoEntry { .. } => -errno::ENOENT,
            Self::AccessDenied { .. } => -errno::EACCESS,
            // Neither of these can legally reach the syscall boundary: both
            // are fail-stop conditions (§7). Mapped here only so `errno` is
            // total.
            Self::OutOfMemory => -errno::EIO,
            Self::NotInitialized { .. } => -errno::EIO,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{name}': {value}")
            }
            Self::Busy { resource } => write!(f, "resource busy: {resource}"),
            Self::Unsupported { operation } => write!(f, "unsupported: {operation}"),
            Self::NoDevice { name } => write!(f, "no such device: {name}"),
            Self::Io { detail } => write!(f, "I/O error: {detail}"),
            Self::BadFormat { detail } => write!(f, "bad format: {detail}"),
            Self::NoEntry { name } => write!(f, "no such entry: {name}"),
            Self::AccessDenied { addr } => write!(f, "access denied at {addr:#x}"),
            Self::OutOfMemory => write!(f, "out of physical frames"),
            Self::NotInitialized { subsystem } => write!(f, "{subsystem} not initialized"),
        }
    }
}
