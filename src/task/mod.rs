use crate::deps::DepEntry;
use crate::deps::hash::DepHash;
use crate::fiber::StackContext;
use crate::phase::Phase;
use crate::remote::comm::TransferHandle;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};

pub(crate) mod pool;
pub(crate) use pool::TaskPool;

pub(crate) mod queue;
pub(crate) use queue::TaskQueue;

/// The task body. Boxed closures take the place of the classic function
/// pointer plus argument blob; captures travel with the closure.
pub(crate) type TaskBody = Box<dyn FnOnce() + Send + 'static>;

pub(crate) type TaskHandle = Arc<Task>;

/// Task lifecycle. Transitions are monotonic except `Suspended↔Queued`
/// and the `Running→Blocked→Running` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Allocated, fields not yet published.
    Nascent = 0,
    /// Fully created, dependencies may be outstanding.
    Created,
    /// On a queue, ready to run.
    Queued,
    /// Runnable but held back until its phase becomes runnable.
    Deferred,
    Running,
    /// Yielded voluntarily; will be re-queued.
    Suspended,
    /// Waiting on an external transfer handle; re-queued by the wait
    /// subsystem.
    Blocked,
    Finished,
    Cancelled,
    /// Logically complete; release deferred to handle completion.
    Detached,
    /// Placeholder for remote bookkeeping.
    Dummy,
    /// The implicit top-level task.
    Root,
    /// Returned to the mempool.
    Destroyed,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        debug_assert!(v <= TaskState::Destroyed as u8);
        unsafe { std::mem::transmute(v) }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskFlags: u32 {
        /// The user holds a weak claim (a `TaskRef`); destruction is
        /// deferred to wait/test/free.
        const HAS_REF = 1;
        /// Invoke the body directly on the worker stack; no fiber, no
        /// yield.
        const INLINE = 1 << 1;
        /// Run on the releasing thread the moment it becomes runnable.
        const IMMEDIATE = 1 << 2;
        /// Communication task created by the copy-in machinery.
        const IS_COMMTASK = 1 << 3;
    }
}

bitflags! {
    /// Flags accepted by `create_task`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CreateFlags: u32 {
        /// The task will never yield; it is executed inline without a
        /// fiber context.
        const NOYIELD = 1;
    }
}

/// Scheduling priority. `Parent` and `Inline` are pseudo priorities
/// resolved at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Default,
    Low,
    /// Inherit the creating task's priority.
    Parent,
    /// High priority plus inline/immediate execution.
    Inline,
}

impl Priority {
    fn as_u8(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Default => 1,
            Priority::Low => 2,
            Priority::Parent => 3,
            Priority::Inline => 4,
        }
    }

    fn from_u8(v: u8) -> Priority {
        match v {
            0 => Priority::High,
            1 => Priority::Default,
            2 => Priority::Low,
            3 => Priority::Parent,
            _ => Priority::Inline,
        }
    }

    pub(crate) fn is_high(self) -> bool {
        matches!(self, Priority::High)
    }
}

/// Fields touched only while the task is owned by a single thread.
#[derive(Default)]
pub(crate) struct TaskInner {
    pub(crate) body: Option<TaskBody>,
    pub(crate) ctx: Option<StackContext>,
    pub(crate) wait_handle: Option<TransferHandle>,
}

/// The scheduling unit.
///
/// Tasks are runtime-owned, reference-counted records recycled through a
/// per-thread mempool. The generation stamp (`instance`) survives reuse
/// and defeats stale enqueue attempts against recycled records.
pub(crate) struct Task {
    /// Thread slot whose pool this record returns to.
    pub(crate) owner: usize,

    /// Monotonic generation stamp, incremented on every (re)initialization.
    instance: AtomicU64,

    state: AtomicU8,

    /// Guards transitions that race with successor installation: the
    /// triple {state := Finished, capture HAS_REF, hand out successors}
    /// must appear atomic to the remote dependency handler.
    lock: Mutex<()>,

    flags: AtomicU32,
    prio: AtomicU8,
    phase: AtomicI32,

    /// Decremented as local dependencies resolve; both counters must be
    /// zero before the task may be enqueued.
    pub(crate) unresolved_deps: AtomicU32,
    pub(crate) unresolved_remote_deps: AtomicU32,

    /// Incremented at child creation, decremented at child completion.
    pub(crate) num_children: AtomicI32,

    parent: Mutex<Option<TaskHandle>>,

    /// NUMA node hint for queue placement; negative means none.
    numa_hint: AtomicI64,

    descr: Mutex<&'static str>,

    pub(crate) inner: Mutex<TaskInner>,

    /// Dephash entries this task produced, in creation order. Mutated by
    /// the creating thread only; read-only afterwards.
    pub(crate) deps_owned: Mutex<Vec<Arc<DepEntry>>>,

    /// Successors attached through `Direct` dependencies; drained on
    /// completion like entry successor lists.
    pub(crate) direct_successors: Mutex<Vec<TaskHandle>>,

    /// Outstanding accesses of this task's children, keyed by
    /// (segment, offset).
    pub(crate) dephash: Mutex<DepHash>,
}

impl Task {
    pub(crate) fn empty(owner: usize) -> Task {
        Task {
            owner,
            instance: AtomicU64::new(0),
            state: AtomicU8::new(TaskState::Nascent as u8),
            lock: Mutex::new(()),
            flags: AtomicU32::new(0),
            prio: AtomicU8::new(Priority::Default.as_u8()),
            phase: AtomicI32::new(Phase::ANY.0),
            unresolved_deps: AtomicU32::new(0),
            unresolved_remote_deps: AtomicU32::new(0),
            num_children: AtomicI32::new(0),
            parent: Mutex::new(None),
            numa_hint: AtomicI64::new(-1),
            descr: Mutex::new(""),
            inner: Mutex::new(TaskInner::default()),
            deps_owned: Mutex::new(Vec::new()),
            direct_successors: Mutex::new(Vec::new()),
            dephash: Mutex::new(DepHash::default()),
        }
    }

    /// The implicit top of the task tree.
    pub(crate) fn new_root() -> TaskHandle {
        let root = Task::empty(0);
        root.state.store(TaskState::Root as u8, Ordering::Release);
        *root.descr.lock() = "root_task";
        Arc::new(root)
    }

    /// Re-initializes a recycled record. The instance counter is never
    /// reset.
    pub(crate) fn reinit(
        &self,
        body: TaskBody,
        parent: TaskHandle,
        prio: Priority,
        phase: Phase,
        descr: &'static str,
    ) {
        self.instance.fetch_add(1, Ordering::AcqRel);
        self.state
            .store(TaskState::Nascent as u8, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        self.phase.store(phase.0, Ordering::Release);
        self.unresolved_deps.store(0, Ordering::Release);
        self.unresolved_remote_deps.store(0, Ordering::Release);
        self.num_children.store(0, Ordering::Release);
        self.numa_hint.store(-1, Ordering::Release);
        *self.descr.lock() = descr;

        let resolved = match prio {
            Priority::Parent => parent.prio(),
            Priority::Inline => {
                self.set_flags(TaskFlags::INLINE | TaskFlags::IMMEDIATE);
                Priority::High
            }
            p => p,
        };
        self.prio.store(resolved.as_u8(), Ordering::Release);

        *self.parent.lock() = Some(parent);

        let mut inner = self.inner.lock();
        debug_assert!(inner.ctx.is_none(), "recycled task still holds a context");
        inner.body = Some(body);
        inner.wait_handle = None;
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Callers owning `Task::lock` (or the task exclusively) may store
    /// directly.
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub(crate) fn is_root(&self) -> bool {
        self.state() == TaskState::Root
    }

    pub(crate) fn has_flag(&self, flag: TaskFlags) -> bool {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    pub(crate) fn set_flags(&self, flags: TaskFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn unset_flags(&self, flags: TaskFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn prio(&self) -> Priority {
        Priority::from_u8(self.prio.load(Ordering::Acquire))
    }

    pub(crate) fn set_prio(&self, prio: Priority) {
        debug_assert!(!matches!(prio, Priority::Parent | Priority::Inline));
        self.prio.store(prio.as_u8(), Ordering::Release);
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn parent(&self) -> Option<TaskHandle> {
        self.parent.lock().clone()
    }

    pub(crate) fn numa_hint(&self) -> Option<usize> {
        let v = self.numa_hint.load(Ordering::Acquire);
        (v >= 0).then_some(v as usize)
    }

    pub(crate) fn set_numa_hint(&self, node: usize) {
        self.numa_hint.store(node as i64, Ordering::Release);
    }

    pub(crate) fn descr(&self) -> &'static str {
        *self.descr.lock()
    }

    /// Both dependency counters drained?
    pub(crate) fn deps_resolved(&self) -> bool {
        self.unresolved_deps.load(Ordering::Acquire) == 0
            && self.unresolved_remote_deps.load(Ordering::Acquire) == 0
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        self.inner.lock().body.take()
    }

    /// Clears dependency bookkeeping and severs the parent link before the
    /// record goes back to the pool.
    pub(crate) fn reset_for_destroy(&self) {
        self.set_state(TaskState::Destroyed);
        self.deps_owned.lock().clear();
        self.direct_successors.lock().clear();
        self.dephash.lock().clear();
        *self.parent.lock() = None;
        let mut inner = self.inner.lock();
        inner.body = None;
        inner.wait_handle = None;
        debug_assert!(inner.ctx.is_none(), "destroying task with a live context");
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("descr", &self.descr())
            .field("state", &self.state())
            .field("instance", &self.instance())
            .field("prio", &self.prio())
            .field("phase", &self.phase().0)
            .finish_non_exhaustive()
    }
}

/// A weak user claim on a task, valid until waited, tested successfully
/// or freed. The instance stamp guards against the record being recycled
/// underneath the reference.
#[derive(Debug, Clone)]
pub struct TaskRef {
    pub(crate) task: TaskHandle,
    pub(crate) instance: u64,
}

impl TaskRef {
    pub(crate) fn new(task: &TaskHandle) -> TaskRef {
        TaskRef {
            task: Arc::clone(task),
            instance: task.instance(),
        }
    }

    /// False once the referenced record was recycled for another task.
    pub(crate) fn is_current(&self) -> bool {
        self.task.instance() == self.instance
    }
}
