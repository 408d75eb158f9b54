//! Shared helpers for the integration test binaries in this directory.
//!
//! Everything in the library that is only reachable through a `#[cfg(test)]`
//! item (the mock scheduler, the frame-pool seeding helper) is invisible to
//! these binaries -- they link `rv39_kernel` as an ordinary dependency, not
//! as the crate under test, so `cfg(test)` never applies to it here. This
//! module re-derives the small amount of setup that requires, built only
//! from the library's public surface.

use rv39_kernel::error::KernelResult;
use rv39_kernel::mm::frame_allocator;
use rv39_kernel::mm::layout::PAGE_SIZE;
use rv39_kernel::sched::{ConditionVariable, SchedulerOps};
use rv39_kernel::syscall::TrapFrame;

/// Seed the global frame allocator from a leaked heap pool, once per test
/// binary. `frame_allocator::init` is `pub` (not `cfg(test)`), so this is
/// the same call a real boot would make, just pointed at heap memory
/// instead of a linker-described RAM range.
pub fn ensure_frame_pool() {
    static INIT: std::sync::Once = std::sync::Once::new();
    const POOL_PAGES: usize = 1024;
    INIT.call_once(|| {
        let backing: &'static mut [u8] = vec![0u8; POOL_PAGES * PAGE_SIZE + PAGE_SIZE].leak();
        let start = rv39_kernel::mm::layout::page_align_up(backing.as_ptr() as usize);
        // SAFETY: `backing` is leaked for the life of the test binary and
        // not reachable from anywhere else.
        unsafe { frame_allocator::init(start, start + POOL_PAGES * PAGE_SIZE) };
    });
}

/// A single-threaded scheduler collaborator, identical in spirit to the
/// library's own `sched::mock::MockScheduler` (invisible here since it's
/// `cfg(test)`-gated inside the library crate): `condition_wait` returns
/// immediately, and `thread_jump_to_user`/`thread_exit` are unreachable
/// since nothing in these tests drives a process to a successful `exec`
/// or `exit`.
pub struct MockScheduler {
    pub running_tid: std::sync::atomic::AtomicI64,
    pub interrupts_enabled: std::sync::atomic::AtomicBool,
    pub broadcasts: std::sync::atomic::AtomicI64,
}

impl MockScheduler {
    pub const fn new() -> Self {
        Self {
            running_tid: std::sync::atomic::AtomicI64::new(0),
            interrupts_enabled: std::sync::atomic::AtomicBool::new(true),
            broadcasts: std::sync::atomic::AtomicI64::new(0),
        }
    }
}

impl SchedulerOps for MockScheduler {
    fn running_thread(&self) -> i64 {
        self.running_tid.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn thread_spawn(&self, _entry: extern "C" fn(usize) -> !, _arg: usize) -> i64 {
        1
    }

    fn thread_join(&self, tid: i64) -> i64 {
        tid
    }

    fn thread_fork_to_user(&self, _trap_frame: &TrapFrame) -> i64 {
        1
    }

    fn thread_jump_to_user(&self, _entry: usize, _stack: usize) -> ! {
        unreachable!("mock scheduler never actually enters user mode")
    }

    fn thread_exit(&self) -> ! {
        unreachable!("mock scheduler never actually exits a thread")
    }

    fn condition_wait(&self, _cond: &ConditionVariable) {}

    fn condition_broadcast(&self, _cond: &ConditionVariable) {
        self.broadcasts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn intr_disable(&self) -> bool {
        self.interrupts_enabled
            .swap(false, std::sync::atomic::Ordering::Relaxed)
    }

    fn intr_restore(&self, was_enabled: bool) {
        self.interrupts_enabled
            .store(was_enabled, std::sync::atomic::Ordering::Relaxed);
    }

    fn usleep(&self, _us: usize) {}
}

/// Install a fresh [`MockScheduler`], leaked for the `'static` lifetime
/// `sched::set_scheduler` requires. Harmless to call more than once; the
/// scheduler collaborator is a single global slot and the last call wins.
pub fn install_mock_scheduler() -> &'static MockScheduler {
    let sched: &'static MockScheduler = Box::leak(Box::new(MockScheduler::new()));
    rv39_kernel::sched::set_scheduler(sched);
    sched
}

/// Build a one-file flat filesystem image: boot block naming `name` as
/// inode 0, a one-block inode whose only data block holds `contents`.
/// Mirrors `fs::mod.rs`'s own internal `build_image` test helper, which
/// this crate cannot reuse (private to the library under `cfg(test)`).
pub fn build_fs_image(name: &[u8], contents: &[u8]) -> Vec<u8> {
    use rv39_kernel::fs::FS_BLOCK_SIZE;
    assert!(contents.len() <= FS_BLOCK_SIZE);
    assert!(name.len() <= 32);

    let num_inodes = 1usize;
    let num_data = 1usize;
    let total_blocks = 1 + num_inodes + num_data;
    let mut image = vec![0u8; total_blocks * FS_BLOCK_SIZE];

    image[0..4].copy_from_slice(&1u32.to_le_bytes());
    image[4..8].copy_from_slice(&(num_inodes as u32).to_le_bytes());
    image[8..12].copy_from_slice(&(num_data as u32).to_le_bytes());

    let dentry_off = 64;
    image[dentry_off..dentry_off + name.len()].copy_from_slice(name);
    image[dentry_off + 32..dentry_off + 36].copy_from_slice(&0u32.to_le_bytes());

    let inode_block_off = FS_BLOCK_SIZE;
    image[inode_block_off..inode_block_off + 4]
        .copy_from_slice(&(contents.len() as u32).to_le_bytes());
    image[inode_block_off + 4..inode_block_off + 8].copy_from_slice(&0u32.to_le_bytes());

    let data_off = (num_inodes + 1) * FS_BLOCK_SIZE;
    image[data_off..data_off + contents.len()].copy_from_slice(contents);
    image
}

/// A trivial ELF64 RV64 `ET_EXEC` image: one `PT_LOAD` segment of `code`
/// at the user region's base, zero-extended to `memsz`. Mirrors `elf.rs`'s
/// own internal `build_image` test helper for the same reason as above.
pub fn build_elf_image(code: &[u8], memsz: usize) -> Vec<u8> {
    use rv39_kernel::mm::layout::{PAGE_SIZE, USER_START_VMA};

    const EHSIZE: usize = 64;
    const PHSIZE: usize = 56;
    let phoff = EHSIZE;
    let data_off = phoff + PHSIZE;

    let mut image = vec![0u8; data_off + code.len()];

    // e_ident
    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // EI_CLASS64
    image[5] = 1; // EI_DATA_LSB
    image[6] = 1; // EI_VERSION_CURRENT
    image[7] = 0; // EI_OSABI_NONE

    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    image[18..20].copy_from_slice(&243u16.to_le_bytes()); // e_machine = EM_RISCV
    image[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    image[24..32].copy_from_slice(&(USER_START_VMA as u64).to_le_bytes()); // e_entry
    image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes()); // e_phoff
    image[54..56].copy_from_slice(&(PHSIZE as u16).to_le_bytes()); // e_phentsize
    image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    // program header
    image[phoff..phoff + 4].copy_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
    image[phoff + 4..phoff + 8].copy_from_slice(&(0x5u32).to_le_bytes()); // p_flags = R|X
    image[phoff + 8..phoff + 16].copy_from_slice(&(data_off as u64).to_le_bytes()); // p_offset
    image[phoff + 16..phoff + 24].copy_from_slice(&(USER_START_VMA as u64).to_le_bytes()); // p_vaddr
    image[phoff + 24..phoff + 32].copy_from_slice(&(USER_START_VMA as u64).to_le_bytes()); // p_paddr
    image[phoff + 32..phoff + 40].copy_from_slice(&(code.len() as u64).to_le_bytes()); // p_filesz
    image[phoff + 40..phoff + 48].copy_from_slice(&(memsz as u64).to_le_bytes()); // p_memsz
    image[phoff + 48..phoff + 56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes()); // p_align

    image[data_off..data_off + code.len()].copy_from_slice(code);
    image
}

/// A bad-ELF image: same as [`build_elf_image`] but with `e_ident[5]`
/// (endianness) set to an unsupported value, for the malformed-image
/// rejection path.
pub fn build_bad_endian_elf_image() -> Vec<u8> {
    let mut image = build_elf_image(&[0x13, 0x00, 0x00, 0x00], PAGE_SIZE);
    image[5] = 2; // not EI_DATA_LSB
    image
}

const PAGE_SIZE: usize = rv39_kernel::mm::layout::PAGE_SIZE;

/// Minimal harness for a `harness = false` integration test binary: run
/// each named test, print `ok`/`FAILED`, and exit non-zero if any failed.
pub fn run_tests(tests: &[(&str, fn() -> KernelResult<()>)]) {
    let mut failed = 0;
    for (name, test) in tests {
        print!("{name}...\t");
        match test() {
            Ok(()) => println!("ok"),
            Err(e) => {
                println!("FAILED: {e}");
                failed += 1;
            }
        }
    }
    println!("\n{} passed, {failed} failed", tests.len() - failed);
    if failed != 0 {
        std::process::exit(1);
    }
}
