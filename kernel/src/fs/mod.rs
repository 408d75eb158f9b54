//! Flat block filesystem (§4.F).
//!
//! One mounted image: a boot block of directory entries, one inode block
//! per file holding a flat array of data-block numbers, and the data
//! blocks themselves. No directories, no bitmaps, no indirect pointers --
//! a single level of indirection is all the inode table offers, and the
//! boot block's dentry array is both the mount's only lookup structure
//! and its only naming structure.

extern crate alloc;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::io::{IoCtl, IoDevice, IoHandle};
use crate::mm::layout::MAXFLOPEN;
use crate::sync::sleeplock::SleepLock;

/// Block size of the filesystem image; matches the page size so a block
/// read/write is never split by the page allocator.
pub const FS_BLOCK_SIZE: usize = 4096;

/// `dentry.name` is a fixed 32-byte field, NUL-padded, not NUL-terminated
/// when it fills the field.
const NAME_LEN: usize = 32;

/// Each inode table block holds one `byte_len` header and a flat array of
/// data-block numbers; sized so the struct fills exactly one block.
const BLOCK_INDEX_COUNT: usize = 1023;

/// Maximum number of directory entries in the boot block.
const MAXFL: usize = crate::mm::layout::MAXFL;

#[derive(Debug, Clone, Copy)]
struct Dentry {
    name: [u8; NAME_LEN],
    inode: u32,
}

impl Dentry {
    fn matches(&self, name: &[u8]) -> bool {
        if name.len() > NAME_LEN {
            return false;
        }
        let stored = &self.name[..name.len()];
        if stored != name {
            return false;
        }
        self.name[name.len()..].iter().all(|&b| b == 0)
    }
}

struct BootBlock {
    num_dentry: u32,
    num_inodes: u32,
    #[allow(dead_code)]
    num_data: u32,
    dentries: [Dentry; MAXFL],
}

impl BootBlock {
    /// Parse the raw layout: three little-endian `u32` header fields, 52
    /// reserved bytes, then up to `MAXFL` 64-byte dentries
    /// (`name[32]` + `inode: u32` + `reserved[28]`).
    fn parse(block: &[u8; FS_BLOCK_SIZE]) -> Self {
        let num_dentry = u32::from_le_bytes(block[0..4].try_into().unwrap());
        let num_inodes = u32::from_le_bytes(block[4..8].try_into().unwrap());
        let num_data = u32::from_le_bytes(block[8..12].try_into().unwrap());

        let mut dentries = [Dentry {
            name: [0u8; NAME_LEN],
            inode: 0,
        }; MAXFL];
        let base = 64;
        for (i, dentry) in dentries.iter_mut().enumerate() {
            let off = base + i * 64;
            dentry.name.copy_from_slice(&block[off..off + NAME_LEN]);
            dentry.inode =
                u32::from_le_bytes(block[off + NAME_LEN..off + NAME_LEN + 4].try_into().unwrap());
        }

        Self {
            num_dentry,
            num_inodes,
            num_data,
            dentries,
        }
    }

    fn lookup(&self, name: &[u8]) -> Option<u32> {
        self.dentries[..self.num_dentry as usize]
            .iter()
            .find(|d| d.matches(name))
            .map(|d| d.inode)
    }
}

struct FsState {
    boot: BootBlock,
    blkio: IoHandle,
    /// `true` for a file-table slot currently assigned to an open file.
    slot_used: [bool; MAXFLOPEN],
}

/// The mounted filesystem. A single instance serves every process; the
/// sleep-lock (§4.B) serializes concurrent opens, reads, and writes the
/// same way one VirtIO device's own lock serializes its requests (§5).
pub struct Filesystem {
    lock: SleepLock,
    state: spin::Mutex<Option<FsState>>,
}

impl Filesystem {
    const fn new() -> Self {
        Self {
            lock: SleepLock::new(100),
            state: spin::Mutex::new(None),
        }
    }

    fn close_slot(&self, slot: usize) {
        self.lock.acquire();
        if let Some(state) = self.state.lock().as_mut() {
            state.slot_used[slot] = false;
        }
        self.lock.release();
    }

    /// Read the inode table block for `inode` and return the data-block
    /// number stored at logical offset `db_num`.
    fn data_block_number(&self, state: &FsState, inode: u32, db_num: usize) -> KernelResult<u32> {
        if db_num >= BLOCK_INDEX_COUNT {
            return Err(KernelError::BadFormat {
                detail: "logical block number exceeds inode capacity",
            });
        }
        let inode_block_offset = (inode as usize + 1) * FS_BLOCK_SIZE;
        let entry_offset = inode_block_offset + 4 + db_num * 4;
        state.blkio.seek(entry_offset)?;
        let mut buf = [0u8; 4];
        read_exact(&state.blkio, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn absolute_data_offset(&self, state: &FsState, block_num: u32) -> usize {
        (state.boot.num_inodes as usize + block_num as usize + 1) * FS_BLOCK_SIZE
    }
}

/// Read `buf.len()` bytes, treating a short read as I/O failure -- the
/// underlying block device is expected to always satisfy a request that
/// fits within the image (§7).
fn read_exact(io: &IoHandle, buf: &mut [u8]) -> KernelResult<()> {
    let n = io.read(buf)?;
    if n != buf.len() {
        return Err(KernelError::Io {
            detail: "short read from block device",
        });
    }
    Ok(())
}

fn write_exact(io: &IoHandle, buf: &[u8]) -> KernelResult<()> {
    let n = io.write(buf)?;
    if n != buf.len() {
        return Err(KernelError::Io {
            detail: "short write to block device",
        });
    }
    Ok(())
}

pub static FILESYSTEM: Filesystem = Filesystem::new();

/// Mount the filesystem image behind `blkio`: read its boot block, reset
/// the file table, and make `open` usable.
pub fn mount(blkio: IoHandle) -> KernelResult<()> {
    let mut block = [0u8; FS_BLOCK_SIZE];
    blkio.seek(0)?;
    read_exact(&blkio, &mut block)?;
    let boot = BootBlock::parse(&block);

    *FILESYSTEM.state.lock() = Some(FsState {
        boot,
        blkio,
        slot_used: [false; MAXFLOPEN],
    });
    log::info!("filesystem mounted");
    Ok(())
}

/// Open `name`, returning a refcounted handle good for `read`/`write`/
/// `ctl` through [`IoDevice`]. Fails with [`KernelError::BadFormat`] on
/// either a name miss or file-table exhaustion -- the specification does
/// not distinguish the two at the syscall boundary.
pub fn open(name: &[u8]) -> KernelResult<IoHandle> {
    FILESYSTEM.lock.acquire();
    let result = (|| {
        let mut guard = FILESYSTEM.state.lock();
        let state = guard
            .as_mut()
            .ok_or(KernelError::NotInitialized { subsystem: "fs" })?;

        let inode = state
            .boot
            .lookup(name)
            .ok_or(KernelError::BadFormat { detail: "no such file" })?;

        let slot = state
            .slot_used
            .iter()
            .position(|used| !used)
            .ok_or(KernelError::BadFormat {
                detail: "open file table exhausted",
            })?;

        let inode_block_offset = (inode as usize + 1) * FS_BLOCK_SIZE;
        state.blkio.seek(inode_block_offset)?;
        let mut len_buf = [0u8; 4];
        read_exact(&state.blkio, &mut len_buf)?;
        let byte_len = u32::from_le_bytes(len_buf) as usize;

        state.slot_used[slot] = true;

        Ok(Arc::new(FsFile {
            slot,
            inode,
            byte_len,
            pos: spin::Mutex::new(0),
        }) as IoHandle)
    })();
    FILESYSTEM.lock.release();
    result
}

/// An open file's handle. `Drop` clears its file-table slot once the
/// last clone (the last process sharing it via `fork`) goes away -- the
/// same close-at-zero-refcount rule every `IoHandle` gets for free.
struct FsFile {
    slot: usize,
    inode: u32,
    byte_len: usize,
    pos: spin::Mutex<usize>,
}

impl Drop for FsFile {
    fn drop(&mut self) {
        FILESYSTEM.close_slot(self.slot);
    }
}

impl IoDevice for FsFile {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        FILESYSTEM.lock.acquire();
        let result = (|| {
            let guard = FILESYSTEM.state.lock();
            let state = guard
                .as_ref()
                .ok_or(KernelError::NotInitialized { subsystem: "fs" })?;

            let mut pos = self.pos.lock();
            let n = buf.len().min(self.byte_len.saturating_sub(*pos));
            let start = *pos;

            let mut done = 0usize;
            while done < n {
                let at = start + done;
                let db_num = at / FS_BLOCK_SIZE;
                let db_offset = at % FS_BLOCK_SIZE;
                let chunk = (FS_BLOCK_SIZE - db_offset).min(n - done);

                let block_num = self.data_block_number(state, self.inode, db_num)?;
                let abs = self.absolute_data_offset(state, block_num) + db_offset;
                state.blkio.seek(abs)?;
                read_exact(&state.blkio, &mut buf[done..done + chunk])?;

                done += chunk;
            }
            *pos = start + done;
            Ok(done)
        })();
        FILESYSTEM.lock.release();
        result
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        FILESYSTEM.lock.acquire();
        let result = (|| {
            let guard = FILESYSTEM.state.lock();
            let state = guard
                .as_ref()
                .ok_or(KernelError::NotInitialized { subsystem: "fs" })?;

            let mut pos = self.pos.lock();
            // Writes never extend the file -- clamp to what fits before
            // byte_len, same as read.
            let n = buf.len().min(self.byte_len.saturating_sub(*pos));
            let start = *pos;

            let mut done = 0usize;
            while done < n {
                let at = start + done;
                let db_num = at / FS_BLOCK_SIZE;
                let db_offset = at % FS_BLOCK_SIZE;
                let chunk = (FS_BLOCK_SIZE - db_offset).min(n - done);

                let block_num = self.data_block_number(state, self.inode, db_num)?;
                let abs = self.absolute_data_offset(state, block_num) + db_offset;
                state.blkio.seek(abs)?;
                write_exact(&state.blkio, &buf[done..done + chunk])?;

                done += chunk;
            }
            *pos = start + done;
            Ok(done)
        })();
        FILESYSTEM.lock.release();
        result
    }

    fn ctl(&self, cmd: IoCtl, arg: usize) -> KernelResult<usize> {
        match cmd {
            IoCtl::GetLen => Ok(self.byte_len),
            IoCtl::GetPos => Ok(*self.pos.lock()),
            IoCtl::SetPos => {
                *self.pos.lock() = arg;
                Ok(0)
            }
            IoCtl::GetBlkSz => Ok(FS_BLOCK_SIZE),
        }
    }
}
