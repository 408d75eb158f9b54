//! Reentrant sleep-lock (§4.B).
//!
//! Unlike a spinlock, a blocked waiter parks via the scheduler
//! collaborator's condition variable instead of spinning, so it is safe
//! to hold across a filesystem read/write or a VirtIO request. The owner
//! check makes it reentrant: a handler that already holds the lock and
//! calls back into another function that acquires the same lock (the
//! filesystem's read entry point re-acquiring inside write, for example)
//! does not deadlock.

use crate::sched::{self, ConditionVariable};

const NO_OWNER: i64 = -1;

pub struct SleepLock {
    cond: ConditionVariable,
    tid: core::sync::atomic::AtomicI64,
}

impl SleepLock {
    pub const fn new(id: u64) -> Self {
        Self {
            cond: ConditionVariable::new(id),
            tid: core::sync::atomic::AtomicI64::new(NO_OWNER),
        }
    }

    /// Acquire the lock, blocking if another thread holds it. Reentrant:
    /// returns immediately if the calling thread already owns it.
    pub fn acquire(&self) {
        use core::sync::atomic::Ordering;

        let me = sched::scheduler().running_thread();
        if self.tid.load(Ordering::Acquire) == me {
            return;
        }

        let was_enabled = sched::scheduler().intr_disable();
        loop {
            let owner = self.tid.load(Ordering::Acquire);
            if owner == NO_OWNER || owner == me {
                break;
            }
            sched::scheduler().condition_wait(&self.cond);
        }
        self.tid.store(me, Ordering::Release);
        sched::scheduler().intr_restore(was_enabled);
    }

    /// Release the lock. Panics if the calling thread is not the owner.
    pub fn release(&self) {
        use core::sync::atomic::Ordering;

        let me = sched::scheduler().running_thread();
        assert_eq!(
            self.tid.load(Ordering::Acquire),
            me,
            "sleep-lock released by non-owner"
        );
        self.tid.store(NO_OWNER, Ordering::Release);
        sched::scheduler().condition_broadcast(&self.cond);
    }

    pub fn holder(&self) -> i64 {
        self.tid.load(core::sync::atomic::Ordering::Acquire)
    }
}

/// RAII guard for `SleepLock`, mirroring `spin::Mutex`'s ergonomics.
pub struct SleepLockGuard<'a> {
    lock: &'a SleepLock,
}

impl SleepLock {
    pub fn lock(&self) -> SleepLockGuard<'_> {
        self.acquire();
        SleepLockGuard { lock: self }
    }
}

impl Drop for SleepLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::mock::MockScheduler;

    static MOCK: MockScheduler = MockScheduler::new();

    fn with_mock_scheduler<F: FnOnce()>(f: F) {
        sched::set_scheduler(&MOCK);
        f();
    }

    #[test]
    fn reentrant_acquire_does_not_deadlock() {
        with_mock_scheduler(|| {
            let lock = SleepLock::new(1);
            lock.acquire();
            lock.acquire(); // same thread: must not block
            assert_eq!(lock.holder(), 0);
            lock.release();
            assert_eq!(lock.holder(), NO_OWNER);
        });
    }

    #[test]
    fn release_broadcasts() {
        with_mock_scheduler(|| {
            let lock = SleepLock::new(2);
            lock.acquire();
            let before = MOCK.broadcasts.load(core::sync::atomic::Ordering::Relaxed);
            lock.release();
            let after = MOCK.broadcasts.load(core::sync::atomic::Ordering::Relaxed);
            assert_eq!(after, before + 1);
        });
    }

    #[test]
    #[should_panic(expected = "released by non-owner")]
    fn release_without_owning_panics() {
        with_mock_scheduler(|| {
            let lock = SleepLock::new(3);
            lock.release();
        });
    }
}
