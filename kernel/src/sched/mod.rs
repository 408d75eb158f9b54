//! Scheduler collaborator interface.
//!
//! The thread scheduler itself is out of scope for this kernel core (§1):
//! it is consumed only through `running_thread`, `thread_spawn`,
//! `thread_join`, `thread_fork_to_user`, `thread_jump_to_user`,
//! `condition_wait`, `condition_broadcast`, and `intr_disable/restore`.
//! [`SchedulerOps`] pins down that boundary as a trait so the sleep-lock
//! (§4.B) and the VirtIO wait idiom (§5) can be unit-tested against a mock
//! implementation instead of a real scheduler. `usleep` extends the same
//! boundary to cover the external alarm primitive `sys_usleep` suspends
//! on (§5).

use crate::syscall::TrapFrame;

/// Opaque wait channel. The scheduler collaborator decides what blocking
/// on one means; this core only ever passes the same reference back to
/// `condition_wait`/`condition_broadcast` that it got from whoever armed
/// the wait (a sleep-lock, a block device, ...).
#[derive(Debug)]
pub struct ConditionVariable {
    id: core::sync::atomic::AtomicU64,
}

impl ConditionVariable {
    pub const fn new(id: u64) -> Self {
        Self {
            id: core::sync::atomic::AtomicU64::new(id),
        }
    }

    pub fn id(&self) -> u64 {
        self.id.load(core::sync::atomic::Ordering::Relaxed)
    }
}

/// The set of scheduler operations this kernel core calls into.
pub trait SchedulerOps: Sync {
    /// The currently running thread's id, or `-1` if no thread owns the
    /// hart (early boot).
    fn running_thread(&self) -> i64;

    /// Spawn a new kernel thread, returning its tid.
    fn thread_spawn(&self, entry: extern "C" fn(usize) -> !, arg: usize) -> i64;

    /// Block until thread `tid` exits, returning the tid that exited.
    fn thread_join(&self, tid: i64) -> i64;

    /// Fork the calling thread into a new user-mode thread that resumes
    /// at `trap_frame` with `a0 = 0`. Returns the child's tid to the
    /// parent.
    fn thread_fork_to_user(&self, trap_frame: &TrapFrame) -> i64;

    /// Enter user mode at `entry` with stack pointer `stack`. Never
    /// returns to the caller.
    fn thread_jump_to_user(&self, entry: usize, stack: usize) -> !;

    /// Terminate the calling thread. Never returns.
    fn thread_exit(&self) -> !;

    /// Block the calling thread on `cond` until woken by
    /// `condition_broadcast`. Releases any interrupt-disable the caller
    /// is holding across the sleep and restores it on return (§5).
    fn condition_wait(&self, cond: &ConditionVariable);

    /// Wake every thread waiting on `cond`.
    fn condition_broadcast(&self, cond: &ConditionVariable);

    /// Disable interrupts, returning whether they were previously
    /// enabled.
    fn intr_disable(&self) -> bool;

    /// Restore the interrupt-enable state returned by `intr_disable`.
    fn intr_restore(&self, was_enabled: bool);

    /// Block the calling thread for at least `us` microseconds via the
    /// external alarm primitive (§5). Like `condition_wait`, this is a
    /// suspension point.
    fn usleep(&self, us: usize);
}

static SCHEDULER: spin::Mutex<Option<&'static dyn SchedulerOps>> = spin::Mutex::new(None);

/// Install the scheduler collaborator. Called once during boot.
pub fn set_scheduler(ops: &'static dyn SchedulerOps) {
    *SCHEDULER.lock() = Some(ops);
}

/// Obtain the installed scheduler collaborator.
///
/// # Panics
/// Panics if called before `set_scheduler` -- every suspension point in
/// this kernel core assumes a scheduler is present.
pub fn scheduler() -> &'static dyn SchedulerOps {
    SCHEDULER.lock().expect("scheduler collaborator not installed")
}
