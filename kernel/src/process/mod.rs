//! Process manager (§4.H).
//!
//! A process is just enough state to resume a user thread: an address
//! space, a scheduler tid, and an I/O table. `fork` clones the first two
//! and shares the third by cloning `Arc`s; `exec` replaces the address
//! space in place; `exit`/`terminate` tear everything back down.

extern crate alloc;

use crate::error::{KernelError, KernelResult};
use crate::io::IoHandle;
use crate::mm::layout::{NPROC, PROCESS_IOMAX, USER_STACK_VMA};
use crate::mm::vm::{self, AddressSpace};
use crate::sched;
use crate::syscall::TrapFrame;

/// One live process. `iotab` slots are `None` until opened; `DEVOPEN`/
/// `FSOPEN` fill the lowest free one (§4.I).
pub struct Process {
    pub id: i64,
    pub tid: i64,
    space: AddressSpace,
    iotab: [Option<IoHandle>; PROCESS_IOMAX],
}

impl Process {
    /// Physical frame backing this process's page-table root, used by
    /// the syscall layer to re-derive an [`AddressSpace`] for pointer
    /// validation without holding the process table lock for the
    /// duration of a syscall body.
    pub fn space_root_phys(&self) -> usize {
        self.space.root_phys()
    }

    pub fn iotab_get(&self, fd: i64) -> KernelResult<&IoHandle> {
        let idx = valid_fd(fd)?;
        self.iotab[idx]
            .as_ref()
            .ok_or(KernelError::InvalidArgument {
                name: "fd",
                value: "not open",
            })
    }

    /// Lowest free `iotab` slot, or `fd` itself if it already names a
    /// free slot (`DEVOPEN`/`FSOPEN` with an explicit non-negative `fd`).
    fn free_slot(&self, fd: i64) -> KernelResult<usize> {
        if fd >= 0 {
            let idx = fd as usize;
            if idx >= PROCESS_IOMAX || self.iotab[idx].is_some() {
                return Err(KernelError::InvalidArgument {
                    name: "fd",
                    value: "not free",
                });
            }
            return Ok(idx);
        }
        self.iotab
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::InvalidArgument {
                name: "fd",
                value: "iotab exhausted",
            })
    }

    pub fn install(&mut self, fd: i64, handle: IoHandle) -> KernelResult<i64> {
        let idx = self.free_slot(fd)?;
        self.iotab[idx] = Some(handle);
        Ok(idx as i64)
    }

    pub fn close_fd(&mut self, fd: i64) -> KernelResult<()> {
        let idx = valid_fd(fd)?;
        if self.iotab[idx].take().is_none() {
            return Err(KernelError::InvalidArgument {
                name: "fd",
                value: "not open",
            });
        }
        Ok(())
    }
}

fn valid_fd(fd: i64) -> KernelResult<usize> {
    if fd < 0 || fd as usize >= PROCESS_IOMAX {
        return Err(KernelError::InvalidArgument {
            name: "fd",
            value: "out of range",
        });
    }
    Ok(fd as usize)
}

const NO_PROCESS: Option<Process> = None;

pub struct ProcessTable {
    slots: [Option<Process>; NPROC],
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            slots: [NO_PROCESS; NPROC],
        }
    }

    fn alloc_slot(&mut self) -> KernelResult<usize> {
        self.slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::BadFormat {
                detail: "process table full",
            })
    }
}

// The process table is implicitly single-writer in the source design
// (fork/exit never run concurrently, per §5), but Rust's aliasing rules
// require real synchronization even for that discipline, so it is
// guarded by a spinlock rather than left as a bare global.
static PROCESS_TABLE: spin::Mutex<ProcessTable> = spin::Mutex::new(ProcessTable::new());

/// Install the running boot thread as process 0, owning the kernel's own
/// (main) address space.
pub fn procmgr_init() {
    let mut table = PROCESS_TABLE.lock();
    table.slots[0] = Some(Process {
        id: 0,
        tid: sched::scheduler().running_thread(),
        space: AddressSpace::from_root(crate::mm::page_table::satp_root_phys(vm::main_mtag())),
        iotab: [const { None }; PROCESS_IOMAX],
    });
    log::info!("process manager initialized, boot thread is pid 0");
}

/// Fork the process owning `pid`: clone its address space, share its
/// iotab by cloning the `Arc`s, and spawn a user-mode thread that resumes
/// at `trap_frame` with `a0 = 0`. Returns the child pid (visible to the
/// parent only -- the child observes 0 through the forked trap frame).
pub fn fork(pid: i64, trap_frame: &TrapFrame) -> KernelResult<i64> {
    let mut table = PROCESS_TABLE.lock();
    let child_slot = table.alloc_slot()?;

    let parent = table.slots[pid as usize]
        .as_ref()
        .ok_or(KernelError::InvalidArgument {
            name: "pid",
            value: "no such process",
        })?;

    let child_space = vm::space_clone(&parent.space)?;
    let mut child_iotab: [Option<IoHandle>; PROCESS_IOMAX] = [const { None }; PROCESS_IOMAX];
    for (slot, handle) in parent.iotab.iter().zip(child_iotab.iter_mut()) {
        *handle = slot.clone();
    }

    let child_tid = sched::scheduler().thread_fork_to_user(trap_frame);

    table.slots[child_slot] = Some(Process {
        id: child_slot as i64,
        tid: child_tid,
        space: child_space,
        iotab: child_iotab,
    });

    Ok(child_slot as i64)
}

/// Tear down `pid`'s current user mappings, load `io` as a fresh ELF
/// image into the same address space (reusing its root table frame
/// rather than allocating a new one), and jump to user mode. Returns an
/// errno on failure; never returns on success. The torn-down mapping is
/// not restored on failure -- the caller is expected to follow up with
/// `exit`.
pub fn exec(pid: i64, io: &IoHandle) -> i64 {
    let satp = {
        let table = PROCESS_TABLE.lock();
        match table.slots[pid as usize].as_ref() {
            Some(proc) => {
                vm::space_reclaim(&proc.space);
                proc.space.satp()
            }
            None => {
                return KernelError::InvalidArgument {
                    name: "pid",
                    value: "no such process",
                }
                .errno()
            }
        }
    };

    let entry = {
        let table = PROCESS_TABLE.lock();
        let proc = table.slots[pid as usize].as_ref().expect("checked above");
        crate::elf::load(&proc.space, io)
    };

    match entry {
        Ok(entry) => {
            // SAFETY: `satp` is the same process's root table, now holding
            // the freshly loaded image.
            unsafe { crate::arch::riscv64::write_satp(satp) };
            sched::scheduler().thread_jump_to_user(entry, USER_STACK_VMA)
        }
        Err(e) => e.errno(),
    }
}

/// Close every iotab entry, reclaim the mtag unless it is still the
/// active one (`exec` already reclaimed that case), and null the table
/// slot.
fn terminate(pid: i64) {
    let mut table = PROCESS_TABLE.lock();
    if let Some(proc) = table.slots[pid as usize].take() {
        drop(proc.iotab);
        if proc.space.satp() != crate::arch::riscv64::read_satp() {
            vm::space_reclaim(&proc.space);
        }
    }
}

/// `exit` = `terminate(pid)` then `thread_exit`. Never returns.
pub fn exit(pid: i64) -> ! {
    terminate(pid);
    sched::scheduler().thread_exit()
}

/// Block until thread `tid` exits.
pub fn wait(tid: i64) -> i64 {
    sched::scheduler().thread_join(tid)
}

pub fn with_process<R>(pid: i64, f: impl FnOnce(&mut Process) -> R) -> KernelResult<R> {
    let mut table = PROCESS_TABLE.lock();
    let proc = table
        .slots
        .get_mut(pid as usize)
        .and_then(Option::as_mut)
        .ok_or(KernelError::InvalidArgument {
            name: "pid",
            value: "no such process",
        })?;
    Ok(f(proc))
}
