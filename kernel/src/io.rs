//! I/O polymorphism layer (§4.J).
//!
//! A block device, an open file, and an in-memory literal all present the
//! same four-entry surface: read, write, close, ctl. The source realizes
//! this as a struct of function pointers plus a manual reference count;
//! the idiomatic Rust shape is a trait object behind `Arc`, since `Arc`'s
//! strong count already *is* that reference count, and dropping the last
//! handle already *is* the close-at-zero-refcount rule (§4.F, §4.H).

extern crate alloc;

use alloc::sync::Arc;

use crate::error::KernelResult;

/// The four `ioctl` commands every device in this kernel core answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCtl {
    GetLen,
    GetPos,
    SetPos,
    GetBlkSz,
}

/// Common interface for block devices, open files, and in-memory images.
pub trait IoDevice: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, buf: &[u8]) -> KernelResult<usize>;
    fn ctl(&self, cmd: IoCtl, arg: usize) -> KernelResult<usize>;

    /// Most devices have nothing extra to do on close beyond dropping the
    /// `Arc`; the filesystem's open-file handle overrides this to clear
    /// its file-table slot (§4.F).
    fn close(&self) {}

    /// `ioseek`: forwards to `ctl(SetPos)`.
    fn seek(&self, pos: usize) -> KernelResult<()> {
        self.ctl(IoCtl::SetPos, pos).map(|_| ())
    }

    fn len(&self) -> KernelResult<usize> {
        self.ctl(IoCtl::GetLen, 0)
    }

    fn pos(&self) -> KernelResult<usize> {
        self.ctl(IoCtl::GetPos, 0)
    }

    fn block_size(&self) -> KernelResult<usize> {
        self.ctl(IoCtl::GetBlkSz, 0)
    }
}

/// A refcounted handle to any device behind [`IoDevice`]. Cloning bumps
/// the `Arc` strong count the same way `fork` sharing an iotab entry
/// bumps the source's manual refcount (§4.H, property 6); dropping the
/// last clone runs `close`'s effect via the device's own `Drop` impl.
pub type IoHandle = Arc<dyn IoDevice>;

/// An in-memory byte buffer exposed through [`IoDevice`], used to make
/// the ELF loader and the filesystem testable without a real block
/// device (§4.J).
pub struct MemoryIo {
    data: spin::Mutex<MemoryIoState>,
}

struct MemoryIoState {
    bytes: alloc::vec::Vec<u8>,
    pos: usize,
}

impl MemoryIo {
    pub fn new(bytes: alloc::vec::Vec<u8>) -> Self {
        Self {
            data: spin::Mutex::new(MemoryIoState { bytes, pos: 0 }),
        }
    }
}

impl IoDevice for MemoryIo {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut state = self.data.lock();
        let available = state.bytes.len().saturating_sub(state.pos);
        let n = buf.len().min(available);
        let pos = state.pos;
        buf[..n].copy_from_slice(&state.bytes[pos..pos + n]);
        state.pos += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let mut state = self.data.lock();
        let pos = state.pos;
        if pos + buf.len() > state.bytes.len() {
            state.bytes.resize(pos + buf.len(), 0);
        }
        state.bytes[pos..pos + buf.len()].copy_from_slice(buf);
        state.pos += buf.len();
        Ok(buf.len())
    }

    fn ctl(&self, cmd: IoCtl, arg: usize) -> KernelResult<usize> {
        let mut state = self.data.lock();
        match cmd {
            IoCtl::GetLen => Ok(state.bytes.len()),
            IoCtl::GetPos => Ok(state.pos),
            IoCtl::SetPos => {
                state.pos = arg;
                Ok(0)
            }
            IoCtl::GetBlkSz => Ok(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_io_round_trips() {
        let io = MemoryIo::new(alloc::vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        io.seek(0).unwrap();
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn memory_io_reports_length() {
        let io = MemoryIo::new(alloc::vec![0u8; 7]);
        assert_eq!(io.len().unwrap(), 7);
    }
}
