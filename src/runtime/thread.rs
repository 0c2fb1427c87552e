use crate::config::{RuntimeConfig, THREAD_QUEUE_SIZE};
use crate::fiber::{Context, ContextCache};
use crate::task::{Task, TaskHandle, TaskPool};
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Instant;

/// A lock-free hand-off cell for a just-released successor. Single
/// writer per store; the owner takes from the front, stealers from the
/// back of the slot array.
#[derive(Debug)]
pub(crate) struct HotSlot {
    ptr: AtomicPtr<Task>,
}

impl HotSlot {
    fn new() -> HotSlot {
        HotSlot {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Tries to place `task`; fails when the slot is occupied.
    pub(crate) fn try_put(&self, task: &TaskHandle) -> bool {
        let raw = Arc::into_raw(Arc::clone(task)) as *mut Task;
        match self
            .ptr
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                // Occupied; drop the reference we minted.
                unsafe { drop(Arc::from_raw(raw)) };
                false
            }
        }
    }

    pub(crate) fn take(&self) -> Option<TaskHandle> {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            Some(unsafe { Arc::from_raw(raw) })
        }
    }
}

impl Drop for HotSlot {
    fn drop(&mut self) {
        // Reclaim a reference still parked in the slot.
        let _ = self.take();
    }
}

/// Per-thread scheduler record. Shared across threads for stealing and
/// cross-thread releases; the cell-based fields are owned by the thread
/// the record belongs to.
#[derive(Debug)]
pub(crate) struct WorkerThread {
    /// 0 is the master, positive ids are pool workers, negative ids are
    /// utility threads.
    pub(crate) id: isize,

    /// Index into the thread table; doubles as the mempool owner slot.
    pub(crate) slot: usize,

    pub(crate) numa: usize,

    pub(crate) is_utility: bool,

    /// Hand-off slots; see [`HotSlot`].
    pub(crate) hot: [HotSlot; THREAD_QUEUE_SIZE],

    /// Where a completing or suspending fiber returns to.
    pub(crate) retctx: Context,

    current: RefCell<Option<TaskHandle>>,

    /// Task picked by a yielding fiber, to be run next on this thread.
    next: RefCell<Option<TaskHandle>>,

    /// Requeue placement for the task currently being suspended.
    pub(crate) delay: Cell<i32>,

    /// Last thread slot a steal succeeded from.
    pub(crate) last_steal: Cell<usize>,

    pub(crate) last_progress: Cell<Option<Instant>>,

    pub(crate) ctx_cache: Arc<ContextCache>,

    pub(crate) pool: Arc<TaskPool>,

    /// Tasks executed by this thread; logged at shutdown.
    pub(crate) taskcntr: Cell<u64>,
}

// Safety: records are shared for the atomic hot slots and the lock-free
// free lists. The cell-based fields (current, next, delay, counters)
// are only touched by the OS thread bound to this record; hand-over at
// shutdown is ordered by thread join.
unsafe impl Send for WorkerThread {}
unsafe impl Sync for WorkerThread {}

impl WorkerThread {
    pub(crate) fn new(cfg: &RuntimeConfig, id: isize, slot: usize) -> Arc<WorkerThread> {
        Arc::new(WorkerThread {
            id,
            slot,
            numa: if id >= 0 { cfg.numa_node_of(slot) } else { 0 },
            is_utility: id < 0,
            hot: std::array::from_fn(|_| HotSlot::new()),
            retctx: Context::new(),
            current: RefCell::new(None),
            next: RefCell::new(None),
            delay: Cell::new(0),
            last_steal: Cell::new(0),
            last_progress: Cell::new(None),
            ctx_cache: ContextCache::new(cfg.task_stack_size),
            pool: TaskPool::new(slot),
            taskcntr: Cell::new(0),
        })
    }

    /// Record for a utility thread, sharing the master's mempool slot.
    pub(crate) fn new_utility(
        cfg: &RuntimeConfig,
        id: isize,
        master_pool: Arc<TaskPool>,
    ) -> Arc<WorkerThread> {
        debug_assert!(id < 0);
        Arc::new(WorkerThread {
            id,
            slot: 0,
            numa: 0,
            is_utility: true,
            hot: std::array::from_fn(|_| HotSlot::new()),
            retctx: Context::new(),
            current: RefCell::new(None),
            next: RefCell::new(None),
            delay: Cell::new(0),
            last_steal: Cell::new(0),
            last_progress: Cell::new(None),
            ctx_cache: ContextCache::new(cfg.task_stack_size),
            pool: master_pool,
            taskcntr: Cell::new(0),
        })
    }

    #[track_caller]
    pub(crate) fn current_task(&self) -> TaskHandle {
        self.current
            .borrow()
            .as_ref()
            .map(Arc::clone)
            .expect("thread has no current task")
    }

    pub(crate) fn set_current_task(&self, task: TaskHandle) {
        *self.current.borrow_mut() = Some(task);
    }

    pub(crate) fn take_next(&self) -> Option<TaskHandle> {
        self.next.borrow_mut().take()
    }

    pub(crate) fn set_next(&self, task: TaskHandle) {
        let prev = self.next.borrow_mut().replace(task);
        debug_assert!(prev.is_none(), "next-task hand-off overwritten");
    }

    /// Front-to-back scan of the hand-off slots (owner side).
    pub(crate) fn hot_take_front(&self) -> Option<TaskHandle> {
        self.hot.iter().find_map(|slot| slot.take())
    }

    /// Back-to-front scan (stealer side), reducing contention with the
    /// owner.
    pub(crate) fn hot_take_back(&self) -> Option<TaskHandle> {
        self.hot.iter().rev().find_map(|slot| slot.take())
    }

    pub(crate) fn hot_try_put(&self, task: &TaskHandle) -> bool {
        self.hot.iter().any(|slot| slot.try_put(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Builder;
    use crate::phase::Phase;
    use crate::task::Priority;
    use static_assertions::assert_impl_all;

    assert_impl_all!(WorkerThread: Send, Sync);

    fn mk_task() -> TaskHandle {
        let root = Task::new_root();
        let t = Arc::new(Task::empty(0));
        t.reinit(Box::new(|| {}), root, Priority::Default, Phase::ANY, "hot");
        t
    }

    #[test]
    fn hot_slots_fill_and_overflow() {
        let cfg = Builder::new().num_threads(1).freeze().unwrap();
        let thread = WorkerThread::new(&cfg, 0, 0);

        let tasks: Vec<_> = (0..THREAD_QUEUE_SIZE + 1).map(|_| mk_task()).collect();
        for t in &tasks[..THREAD_QUEUE_SIZE] {
            assert!(thread.hot_try_put(t));
        }
        // All slots occupied: the extra task falls through.
        assert!(!thread.hot_try_put(&tasks[THREAD_QUEUE_SIZE]));

        let mut taken = 0;
        while thread.hot_take_back().is_some() {
            taken += 1;
        }
        assert_eq!(taken, THREAD_QUEUE_SIZE);
    }

    #[test]
    fn hot_slot_drop_releases_reference() {
        let task = mk_task();
        {
            let slot = HotSlot::new();
            assert!(slot.try_put(&task));
            // Dropped while occupied.
        }
        assert_eq!(Arc::strong_count(&task), 1);
    }
}
