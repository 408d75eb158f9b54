//! Syscall dispatcher (§4.I).
//!
//! One trap frame, one selector register (`a7`), twelve syscalls. Every
//! user pointer a handler touches is validated through
//! [`crate::mm::vm::validate_vptr_len`]/`validate_vstr` right here at the
//! boundary -- nothing past this file re-validates.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;

use crate::error::KernelError;
use crate::io::{IoCtl, IoHandle};
use crate::mm::page_table::PteFlags;
use crate::mm::vm;
use crate::process;

/// Registers saved across an `ecall` trap. Field layout mirrors the
/// calling convention in §4.I: `a0..a5` carry arguments, `a7` the
/// syscall selector, `sepc` the faulting instruction's address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a7: usize,
    pub sepc: usize,
    pub sp: usize,
}

const SYS_EXIT: usize = 0;
const SYS_MSGOUT: usize = 1;
const SYS_CLOSE: usize = 2;
const SYS_READ: usize = 3;
const SYS_WRITE: usize = 4;
const SYS_IOCTL: usize = 5;
const SYS_DEVOPEN: usize = 6;
const SYS_FSOPEN: usize = 7;
const SYS_EXEC: usize = 8;
const SYS_FORK: usize = 9;
const SYS_WAIT: usize = 10;
const SYS_USLEEP: usize = 11;

/// Entry point for an `ecall` trap from user mode. `pid` identifies the
/// calling process (looked up by the trap handler from the running
/// thread's tid). Advances `sepc` past the `ecall` before dispatch, per
/// §4.I, and writes the result into `a0` unless the syscall diverges.
pub fn dispatch(pid: i64, frame: &mut TrapFrame) {
    frame.sepc += 4;

    let result = match frame.a7 {
        SYS_EXIT => process::exit(pid),
        SYS_MSGOUT => sys_msgout(pid, frame),
        SYS_CLOSE => sys_close(pid, frame),
        SYS_READ => sys_read(pid, frame),
        SYS_WRITE => sys_write(pid, frame),
        SYS_IOCTL => sys_ioctl(pid, frame),
        SYS_DEVOPEN => sys_devopen(pid, frame),
        SYS_FSOPEN => sys_fsopen(pid, frame),
        SYS_EXEC => sys_exec(pid, frame),
        SYS_FORK => sys_fork(pid, frame),
        SYS_WAIT => sys_wait(frame),
        SYS_USLEEP => sys_usleep(frame),
        _ => -crate::error::errno::ENOTSUP,
    };

    frame.a0 = result as usize;
}

/// Current user address space, looked up through the process table so
/// pointer validation always checks the calling process's own mapping.
fn current_space(pid: i64) -> Option<vm::AddressSpace> {
    // `with_process` only ever hands out a `&mut Process`; pointer
    // validation needs to read the space it owns without holding the
    // process table lock across a syscall body, so the caller re-derives
    // the space's satp and wraps it.
    process::with_process(pid, |p| vm::AddressSpace::from_root(p.space_root_phys()))
        .ok()
}

fn sys_msgout(pid: i64, frame: &TrapFrame) -> i64 {
    let Some(space) = current_space(pid) else {
        return -crate::error::errno::EINVAL;
    };
    let len = match vm::validate_vstr(&space, frame.a0, PteFlags::READ | PteFlags::USER) {
        Ok(len) => len,
        Err(e) => return e.errno(),
    };
    let mut buf = vec![0u8; len];
    for (i, byte) in buf.iter_mut().enumerate() {
        // SAFETY: `validate_vstr` just confirmed every byte up to and
        // including the terminator is mapped R+U.
        *byte = unsafe { core::ptr::read((frame.a0 + i) as *const u8) };
    }
    if let Ok(msg) = core::str::from_utf8(&buf) {
        crate::print!("{msg}");
    }
    0
}

fn with_fd(pid: i64, fd: i64, f: impl FnOnce(&IoHandle) -> i64) -> i64 {
    match process::with_process(pid, |p| p.iotab_get(fd).map(|h| h.clone())) {
        Ok(Ok(handle)) => f(&handle),
        Ok(Err(e)) => e.errno(),
        Err(e) => e.errno(),
    }
}

fn sys_close(pid: i64, frame: &TrapFrame) -> i64 {
    match process::with_process(pid, |p| p.close_fd(frame.a0 as i64)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => e.errno(),
        Err(e) => e.errno(),
    }
}

fn sys_read(pid: i64, frame: &TrapFrame) -> i64 {
    let fd = frame.a0 as i64;
    let ptr = frame.a1;
    let n = frame.a2;

    let Some(space) = current_space(pid) else {
        return -crate::error::errno::EINVAL;
    };
    if let Err(e) = vm::validate_vptr_len(&space, ptr, n, PteFlags::WRITE | PteFlags::USER) {
        return e.errno();
    }

    with_fd(pid, fd, |handle| {
        let mut buf = vec![0u8; n];
        match handle.read(&mut buf) {
            Ok(read) => {
                for (i, byte) in buf[..read].iter().enumerate() {
                    // SAFETY: validated above as R+W+U for the full
                    // requested length.
                    unsafe { core::ptr::write((ptr + i) as *mut u8, *byte) };
                }
                read as i64
            }
            Err(e) => e.errno(),
        }
    })
}

fn sys_write(pid: i64, frame: &TrapFrame) -> i64 {
    let fd = frame.a0 as i64;
    let ptr = frame.a1;
    let n = frame.a2;

    let Some(space) = current_space(pid) else {
        return -crate::error::errno::EINVAL;
    };
    if let Err(e) = vm::validate_vptr_len(&space, ptr, n, PteFlags::READ | PteFlags::USER) {
        return e.errno();
    }

    with_fd(pid, fd, |handle| {
        let mut buf = vec![0u8; n];
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: validated above as R+U for the full requested
            // length.
            *byte = unsafe { core::ptr::read((ptr + i) as *const u8) };
        }
        match handle.write(&buf) {
            Ok(written) => written as i64,
            Err(e) => e.errno(),
        }
    })
}

fn decode_ioctl(cmd: usize) -> Option<IoCtl> {
    match cmd {
        0 => Some(IoCtl::GetLen),
        1 => Some(IoCtl::GetPos),
        2 => Some(IoCtl::SetPos),
        3 => Some(IoCtl::GetBlkSz),
        _ => None,
    }
}

fn sys_ioctl(pid: i64, frame: &TrapFrame) -> i64 {
    let fd = frame.a0 as i64;
    let Some(cmd) = decode_ioctl(frame.a1) else {
        return -crate::error::errno::EINVAL;
    };
    with_fd(pid, fd, |handle| match handle.ctl(cmd, frame.a2) {
        Ok(v) => v as i64,
        Err(e) => e.errno(),
    })
}

/// Read a NUL-terminated name out of user memory for `DEVOPEN`/`FSOPEN`.
fn read_user_name(space: &vm::AddressSpace, ptr: usize) -> Result<alloc::vec::Vec<u8>, i64> {
    let len = vm::validate_vstr(space, ptr, PteFlags::READ | PteFlags::USER)
        .map_err(|e| e.errno())?;
    let mut buf = vec![0u8; len];
    for (i, byte) in buf.iter_mut().enumerate() {
        // SAFETY: validated above.
        *byte = unsafe { core::ptr::read((ptr + i) as *const u8) };
    }
    Ok(buf)
}

fn sys_devopen(pid: i64, frame: &TrapFrame) -> i64 {
    let fd = frame.a0 as i64;
    let Some(space) = current_space(pid) else {
        return -crate::error::errno::EINVAL;
    };
    let name = match read_user_name(&space, frame.a1) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let handle = match crate::drivers::virtio::blk::open(&name, frame.a2) {
        Ok(h) => h,
        Err(e) => return e.errno(),
    };
    match process::with_process(pid, |p| p.install(fd, handle)) {
        Ok(Ok(new_fd)) => new_fd,
        Ok(Err(e)) => e.errno(),
        Err(e) => e.errno(),
    }
}

fn sys_fsopen(pid: i64, frame: &TrapFrame) -> i64 {
    let fd = frame.a0 as i64;
    let Some(space) = current_space(pid) else {
        return -crate::error::errno::EINVAL;
    };
    let name = match read_user_name(&space, frame.a1) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let handle = match crate::fs::open(&name) {
        Ok(h) => h,
        Err(e) => return e.errno(),
    };
    match process::with_process(pid, |p| p.install(fd, handle)) {
        Ok(Ok(new_fd)) => new_fd,
        Ok(Err(e)) => e.errno(),
        Err(e) => e.errno(),
    }
}

fn sys_exec(pid: i64, frame: &TrapFrame) -> i64 {
    let fd = frame.a0 as i64;
    let handle = match process::with_process(pid, |p| p.iotab_get(fd).map(Arc::clone)) {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => return e.errno(),
        Err(e) => return e.errno(),
    };
    process::exec(pid, &handle)
}

fn sys_fork(pid: i64, frame: &TrapFrame) -> i64 {
    match process::fork(pid, frame) {
        Ok(child) => child,
        Err(e) => e.errno(),
    }
}

fn sys_wait(frame: &TrapFrame) -> i64 {
    process::wait(frame.a0 as i64)
}

fn sys_usleep(frame: &TrapFrame) -> i64 {
    crate::sched::scheduler().usleep(frame.a0);
    0
}

impl From<KernelError> for i64 {
    fn from(e: KernelError) -> Self {
        e.errno()
    }
}
