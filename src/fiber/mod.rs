//! Context manager: user-level stacks backing suspendable tasks.
//!
//! A [`Context`] is a stack-pointer slot capturing a register image; a
//! [`StackContext`] pairs a context with its own guarded stack and a
//! pending entry function. Entering a fresh stack runs the entry exactly
//! once via a trampoline; afterwards the context resumes wherever it last
//! suspended. Stacks are cached per thread and always return to the cache
//! of the thread that allocated them, no matter which thread releases.

use crate::config::PER_THREAD_CTX_STORE;
use crossbeam_queue::SegQueue;
use std::cell::{Cell, UnsafeCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

mod stack;
use stack::StackMemory;

mod switch;
use switch::weft_fiber_switch;

pub(crate) type EntryFn = Box<dyn FnOnce() + Send + 'static>;

// The entry staged for the next first-time switch on this thread. The
// trampoline consumes it; passing the closure by value avoids any pointer
// into the (movable) StackContext.
thread_local! {
    static TO_ENTER: Cell<Option<EntryFn>> = const { Cell::new(None) };
}

/// A register image slot. Workers own one as their return context; every
/// [`StackContext`] embeds one for the fiber side.
#[derive(Debug)]
pub(crate) struct Context {
    sp: UnsafeCell<usize>,
}

// Safety: the slot is only read or written by the thread that currently
// runs the associated code path; hand-over between threads goes through
// the task state machine, whose locks establish the necessary ordering.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            sp: UnsafeCell::new(0),
        }
    }

    /// Snapshot of the register-image slot; paired with
    /// [`Context::restore`] around nested scheduling loops that reuse
    /// the slot.
    pub(crate) fn snapshot(&self) -> usize {
        unsafe { *self.sp.get() }
    }

    pub(crate) fn restore(&self, sp: usize) {
        unsafe { *self.sp.get() = sp };
    }
}

/// Saves the caller into `save` and resumes `resume`. Returns when some
/// context later resumes `save`.
pub(crate) fn swap(save: &Context, resume: &Context) {
    unsafe { weft_fiber_switch(save.sp.get(), resume.sp.get()) }
}

/// Stages the fiber's entry (first switch only), then swaps into it.
pub(crate) fn swap_into(save: &Context, fiber: &StackContext) {
    fiber.stage_entry();
    swap(save, &fiber.ctx);
}

/// Resumes `resume` without saving the caller. The current stack becomes
/// unreachable; used when a fiber terminates.
pub(crate) fn enter(resume: &Context) -> ! {
    let mut graveyard: usize = 0;
    unsafe { weft_fiber_switch(&mut graveyard, resume.sp.get()) }
    unreachable!("terminated fiber context was resumed");
}

extern "C" fn fiber_entry() -> ! {
    let entry = TO_ENTER
        .with(|c| c.take())
        .expect("fiber entered without a staged entry function");
    entry();
    // The entry function must leave via `enter` and never return here.
    tracing::error!("fiber entry function returned");
    std::process::abort();
}

/// A runnable or suspended fiber: guarded stack plus register image.
pub(crate) struct StackContext {
    ctx: Context,
    mem: StackMemory,
    entry: Cell<Option<EntryFn>>,
    cache: Arc<ContextCache>,
}

// Safety: a StackContext is only manipulated by the thread that currently
// owns its task; see `Context`.
unsafe impl Send for StackContext {}

impl StackContext {
    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    fn stage_entry(&self) {
        if let Some(entry) = self.entry.take() {
            TO_ENTER.with(|c| {
                let prev = c.replace(Some(entry));
                debug_assert!(prev.is_none(), "nested fiber entry staging");
            });
        }
    }

    /// Returns the stack to the free list of the allocating thread.
    pub(crate) fn release(self) {
        self.mem.check_sentinels(self.cache.stack_size);
        self.cache.recycle(self.mem);
    }
}

impl std::fmt::Debug for StackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackContext")
            .field("stack_lo", &self.mem.lo())
            .finish_non_exhaustive()
    }
}

/// Thread-bound free list of fiber stacks. Cross-thread release is
/// permitted; the queue is lock-free and bounded.
#[derive(Debug)]
pub(crate) struct ContextCache {
    free: SegQueue<StackMemory>,
    cached: AtomicUsize,
    stack_size: usize,
}

impl ContextCache {
    pub(crate) fn new(stack_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: SegQueue::new(),
            cached: AtomicUsize::new(0),
            stack_size,
        })
    }

    /// Builds a context that, when entered, invokes `entry` exactly once
    /// on its own stack. The stack comes from the free list when possible.
    pub(crate) fn create(
        self: &Arc<Self>,
        entry: EntryFn,
    ) -> anyhow::Result<StackContext> {
        let mem = match self.free.pop() {
            Some(mem) => {
                self.cached.fetch_sub(1, Ordering::Relaxed);
                mem
            }
            None => StackMemory::allocate(self.stack_size)?,
        };

        let sp = stack::seed(&mem, fiber_entry);
        let ctx = Context::new();
        unsafe { *ctx.sp.get() = sp };

        Ok(StackContext {
            ctx,
            mem,
            entry: Cell::new(Some(entry)),
            cache: Arc::clone(self),
        })
    }

    fn recycle(&self, mem: StackMemory) {
        if self.cached.load(Ordering::Relaxed) < PER_THREAD_CTX_STORE {
            self.cached.fetch_add(1, Ordering::Relaxed);
            self.free.push(mem);
        }
        // Over the cap the memory is simply unmapped.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    // Pointers the fiber needs to swap against, shared through an Arc so
    // the closure does not borrow the stack frame of the test.
    struct Shared {
        main: Context,
        fiber_ctx: AtomicUsize, // *const Context of the fiber, set after creation
        trace: AtomicU64,
    }

    // Safety: test synchronizes through the fiber switch itself.
    unsafe impl Sync for Shared {}

    fn fiber_ctx(shared: &Shared) -> &Context {
        unsafe { &*(shared.fiber_ctx.load(Ordering::Acquire) as *const Context) }
    }

    #[test]
    fn entry_runs_exactly_once_and_frame_survives_suspension() {
        let cache = ContextCache::new(64 * 1024);
        let shared = Arc::new(Shared {
            main: Context::new(),
            fiber_ctx: AtomicUsize::new(0),
            trace: AtomicU64::new(0),
        });

        let fiber = {
            let shared = Arc::clone(&shared);
            cache
                .create(Box::new(move || {
                    // Frame-local state that must survive the suspension.
                    let marker = 0x5157u64;
                    shared.trace.store(marker, Ordering::SeqCst);
                    swap(fiber_ctx(&shared), &shared.main);
                    // Resumed in the same frame: the local is intact.
                    shared.trace.store(marker + 1, Ordering::SeqCst);
                    enter(&shared.main);
                }))
                .unwrap()
        };

        shared
            .fiber_ctx
            .store(fiber.ctx() as *const Context as usize, Ordering::Release);

        swap_into(&shared.main, &fiber);
        assert_eq!(shared.trace.load(Ordering::SeqCst), 0x5157);

        // Second swap must not re-run the trampoline.
        swap_into(&shared.main, &fiber);
        assert_eq!(shared.trace.load(Ordering::SeqCst), 0x5158);

        fiber.release();
    }

    #[test]
    fn released_stacks_are_reused() {
        let cache = ContextCache::new(32 * 1024);
        let shared = Arc::new(Shared {
            main: Context::new(),
            fiber_ctx: AtomicUsize::new(0),
            trace: AtomicU64::new(0),
        });

        for round in 0..3 {
            let fiber = {
                let shared = Arc::clone(&shared);
                cache
                    .create(Box::new(move || {
                        shared.trace.fetch_add(1, Ordering::SeqCst);
                        enter(&shared.main);
                    }))
                    .unwrap()
            };
            shared
                .fiber_ctx
                .store(fiber.ctx() as *const Context as usize, Ordering::Release);
            swap_into(&shared.main, &fiber);
            assert_eq!(shared.trace.load(Ordering::SeqCst), round + 1);
            fiber.release();
        }

        assert!(cache.cached.load(Ordering::Relaxed) >= 1);
    }
}
