//! Page-aligned fiber stacks with no-access guard pages at both ends.

use anyhow::{Context as _, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;

#[cfg(not(unix))]
compile_error!("fiber stacks require a unix platform (mmap/mprotect)");

/// Written at both ends of the usable stack in debug builds and inspected
/// at release time. Overflow detection is best-effort.
const STACK_SENTINEL: u64 = 0xDEAD_BEEF_DEAD_BEEF;

pub(super) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|sz| sz as usize)
            .unwrap_or(4096)
    })
}

fn round_to_page(size: usize) -> usize {
    let mask = page_size() - 1;
    (size + mask) & !mask
}

/// One mmap'd allocation: `[guard page | usable stack | guard page]`.
pub(super) struct StackMemory {
    base: NonNull<std::ffi::c_void>,
    total: usize,
    usable: usize,
}

impl StackMemory {
    pub(super) fn allocate(stack_size: usize) -> Result<Self> {
        let page = page_size();
        let usable = round_to_page(stack_size.max(page));
        let total = usable + 2 * page;

        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(total).expect("stack size is nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .context("failed to mmap fiber stack")?;

        // Lower and upper guard pages.
        unsafe {
            mprotect(base, page, ProtFlags::PROT_NONE)
                .context("failed to protect lower guard page")?;
            let upper = base.byte_add(page + usable);
            mprotect(upper, page, ProtFlags::PROT_NONE)
                .context("failed to protect upper guard page")?;
        }

        let mem = Self {
            base,
            total,
            usable,
        };

        tracing::trace!(lo = ?mem.lo(), size = usable, "allocated fiber stack");

        Ok(mem)
    }

    /// Lowest usable address.
    pub(super) fn lo(&self) -> *mut u8 {
        unsafe { self.base.byte_add(page_size()).as_ptr().cast() }
    }

    /// One past the highest usable address; page aligned.
    pub(super) fn top(&self) -> *mut u8 {
        unsafe { self.lo().add(self.usable) }
    }

    pub(super) fn write_sentinels(&self) {
        if cfg!(debug_assertions) {
            unsafe {
                self.lo().cast::<u64>().write(STACK_SENTINEL);
                self.top().cast::<u64>().sub(1).write(STACK_SENTINEL);
            }
        }
    }

    /// Best-effort overflow check at release. The upper word is consumed
    /// by regular execution early on, so a warning fires only once both
    /// ends are dead.
    pub(super) fn check_sentinels(&self, stack_size: usize) {
        if cfg!(debug_assertions) {
            let lo = unsafe { self.lo().cast::<u64>().read() };
            let hi = unsafe { self.top().cast::<u64>().sub(1).read() };
            if lo != STACK_SENTINEL && hi != STACK_SENTINEL {
                tracing::warn!(
                    stack_size,
                    "possible task stack overflow detected; consider raising the task stack size"
                );
            }
        }
    }
}

impl Drop for StackMemory {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = munmap(self.base, self.total) {
                tracing::warn!(error = %e, "failed to unmap fiber stack");
            }
        }
    }
}

// Safety: the mapping is owned exclusively by this value; the raw base
// pointer is only dereferenced through it.
unsafe impl Send for StackMemory {}

/// Seeds a fresh stack so that the first switch into it lands in `entry`
/// with a well-formed frame, and returns the stack pointer to resume at.
pub(super) fn seed(mem: &StackMemory, entry: extern "C" fn() -> !) -> usize {
    mem.write_sentinels();

    let top = mem.top() as usize;

    #[cfg(target_arch = "x86_64")]
    let sp = unsafe {
        // The word at top-8 keeps the upper sentinel; `ret` enters `entry`
        // with rsp ≡ 8 (mod 16), mimicking a call.
        let frame = (top - 16) as *mut u64;
        frame.write(entry as usize as u64);
        let sp = top - 16 - 8 * super::switch::SWITCH_FRAME_WORDS;
        std::ptr::write_bytes(sp as *mut u8, 0, 8 * super::switch::SWITCH_FRAME_WORDS);
        sp
    };

    #[cfg(target_arch = "aarch64")]
    let sp = unsafe {
        // Entry executes with sp = top-16, leaving the upper sentinel
        // untouched; x30 in the seeded frame carries the entry address.
        let frame_top = top - 16;
        let sp = frame_top - 8 * super::switch::SWITCH_FRAME_WORDS;
        std::ptr::write_bytes(sp as *mut u8, 0, 8 * super::switch::SWITCH_FRAME_WORDS);
        ((sp + 8) as *mut u64).write(entry as usize as u64);
        sp
    };

    sp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_page_aligned() {
        let mem = StackMemory::allocate(10_000).unwrap();
        let page = page_size();
        assert_eq!(mem.lo() as usize % page, 0);
        assert_eq!(mem.top() as usize % page, 0);
        assert!(mem.top() as usize - mem.lo() as usize >= 10_000);
    }

    #[test]
    fn sentinels_survive_until_scribbled() {
        let mem = StackMemory::allocate(8192).unwrap();
        mem.write_sentinels();
        // Untouched stack: no warning path, sentinels intact.
        mem.check_sentinels(8192);
        if cfg!(debug_assertions) {
            unsafe {
                assert_eq!(mem.lo().cast::<u64>().read(), STACK_SENTINEL);
            }
        }
    }
}
