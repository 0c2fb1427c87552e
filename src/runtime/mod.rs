//! The runtime object: thread pool, queues, dependency engine, transport
//! and the public scheduler surface.

use crate::config::{Builder, RuntimeConfig};
use crate::copyin::{self, CopyinState};
use crate::deps::DepDescriptor;
use crate::deps::engine::{DepEngine, RemoteInDep};
use crate::error::Error;
use crate::gptr::{GlobalPtr, SegmentId, UnitId};
use crate::phase::{Phase, PhaseTracker};
use crate::remote::Message;
use crate::remote::amsgq::Amsgq;
use crate::remote::comm::{LocalTeam, Team};
use crate::task::{
    CreateFlags, Priority, TaskFlags, TaskHandle, TaskQueue, TaskRef, TaskState, Task,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::time::Duration;

pub(crate) mod cancel;
use cancel::CancelState;

pub(crate) mod thread;
use thread::WorkerThread;

pub(crate) mod wait;
use wait::WaitList;

pub(crate) mod worker;

/// Per-thread binding of the runtime and this thread's scheduler record.
pub(crate) mod context {
    use super::{RuntimeInner, WorkerThread};
    use std::cell::RefCell;
    use std::sync::Arc;

    struct Bound {
        rt: Arc<RuntimeInner>,
        thread: Arc<WorkerThread>,
    }

    thread_local! {
        static CURRENT: RefCell<Option<Bound>> = const { RefCell::new(None) };
    }

    pub(crate) fn bind(rt: Arc<RuntimeInner>, thread: Arc<WorkerThread>) {
        CURRENT.with(|c| {
            let prev = c.borrow_mut().replace(Bound { rt, thread });
            assert!(prev.is_none(), "thread is already bound to a runtime");
        });
    }

    pub(crate) fn unbind() {
        CURRENT.with(|c| c.borrow_mut().take());
    }

    /// Drops the binding only if it belongs to `rt`.
    pub(crate) fn unbind_matching(rt: &Arc<RuntimeInner>) {
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            if cur.as_ref().is_some_and(|b| Arc::ptr_eq(&b.rt, rt)) {
                cur.take();
            }
        });
    }

    pub(crate) fn is_bound() -> bool {
        CURRENT.with(|c| c.borrow().is_some())
    }

    /// Clones are returned (never borrows) so callers can hold them
    /// across fiber switches.
    pub(crate) fn try_current() -> Option<(Arc<RuntimeInner>, Arc<WorkerThread>)> {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .map(|b| (Arc::clone(&b.rt), Arc::clone(&b.thread)))
        })
    }

    #[track_caller]
    pub(crate) fn current_runtime() -> Arc<RuntimeInner> {
        try_current().expect("not a runtime thread").0
    }

    #[track_caller]
    pub(crate) fn current_thread() -> Arc<WorkerThread> {
        try_current().expect("not a runtime thread").1
    }
}

pub(crate) struct RuntimeInner {
    cfg: RuntimeConfig,
    team: Arc<dyn Team>,
    root: TaskHandle,
    /// One global queue per NUMA node (one total without NUMA
    /// placement).
    queues: Vec<TaskQueue>,
    engine: DepEngine,
    amsgq: Amsgq,
    copyin: CopyinState,
    waitlist: WaitList,
    phases: PhaseTracker,
    cancel: CancelState,
    threads: Vec<Arc<WorkerThread>>,
    join_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,

    /// True while worker threads should process tasks.
    parallel: AtomicBool,
    /// Worker threads launch on first task creation.
    threads_running: AtomicBool,
    /// All workers poll the transport while a root completion wait is
    /// in flight.
    worker_poll_remote: AtomicBool,

    idle_mutex: Mutex<()>,
    idle_cv: Condvar,

    num_utility: AtomicIsize,
    finalized: AtomicBool,
}

impl RuntimeInner {
    pub(crate) fn cfg(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub(crate) fn team(&self) -> &dyn Team {
        self.team.as_ref()
    }

    pub(crate) fn my_unit(&self) -> UnitId {
        self.team.my_unit()
    }

    pub(crate) fn num_units(&self) -> usize {
        self.team.num_units()
    }

    pub(crate) fn root(&self) -> &TaskHandle {
        &self.root
    }

    pub(crate) fn queues(&self) -> &[TaskQueue] {
        &self.queues
    }

    pub(crate) fn queue_for(&self, numa: usize) -> &TaskQueue {
        &self.queues[numa % self.queues.len()]
    }

    pub(crate) fn threads(&self) -> &[Arc<WorkerThread>] {
        &self.threads
    }

    pub(crate) fn engine(&self) -> &DepEngine {
        &self.engine
    }

    pub(crate) fn amsgq(&self) -> &Amsgq {
        &self.amsgq
    }

    pub(crate) fn copyin(&self) -> &CopyinState {
        &self.copyin
    }

    pub(crate) fn waitlist(&self) -> &WaitList {
        &self.waitlist
    }

    pub(crate) fn phases(&self) -> &PhaseTracker {
        &self.phases
    }

    pub(crate) fn cancel(&self) -> &CancelState {
        &self.cancel
    }

    pub(crate) fn parallel(&self) -> bool {
        self.parallel.load(Ordering::Acquire)
    }

    pub(crate) fn threads_running(&self) -> bool {
        self.threads_running.load(Ordering::Acquire)
    }

    pub(crate) fn poll_remote(&self) -> bool {
        self.worker_poll_remote.load(Ordering::Acquire)
    }

    pub(crate) fn set_poll_remote(&self, val: bool) {
        self.worker_poll_remote.store(val, Ordering::Release);
    }

    pub(crate) fn wakeup_one(&self) {
        if self.cfg.idle_policy == crate::config::IdlePolicy::Wait {
            let _guard = self.idle_mutex.lock();
            self.idle_cv.notify_one();
        }
    }

    pub(crate) fn wakeup_all(&self) {
        if self.cfg.idle_policy == crate::config::IdlePolicy::Wait {
            let _guard = self.idle_mutex.lock();
            self.idle_cv.notify_all();
        }
    }

    /// Descends into the configured idle mode after the grace period.
    pub(crate) fn wait_for_work(&self) {
        match self.cfg.idle_policy {
            crate::config::IdlePolicy::Poll => {}
            crate::config::IdlePolicy::Usleep => std::thread::sleep(self.cfg.idle_sleep),
            crate::config::IdlePolicy::Wait => {
                let mut guard = self.idle_mutex.lock();
                if self.parallel() {
                    let _ = self
                        .idle_cv
                        .wait_for(&mut guard, Duration::from_millis(100));
                }
            }
        }
    }

    /// Delayed thread start: spin up the pool workers once.
    pub(crate) fn start_threads(self: &Arc<Self>) {
        if self.threads_running.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(threads = self.cfg.num_threads, "starting worker threads");

        let mut handles = self.join_handles.lock();
        for record in self.threads.iter().skip(1) {
            let rt = Arc::clone(self);
            let thread = Arc::clone(record);
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{}", record.slot))
                .stack_size(self.cfg.task_stack_size.max(1 << 21))
                .spawn(move || worker::thread_main(rt, thread))
                .expect("FATAL: failed to spawn worker thread");
            handles.push(handle);
        }
    }

    /// Makes a task eligible to run, honoring cancellation, the
    /// generation stamp, phase deferral and queue placement.
    pub(crate) fn enqueue_runnable(&self, task: &TaskHandle) {
        if self.cancel.requested() {
            cancel::cancel_task(self, task);
            return;
        }

        if task.state() == TaskState::Deferred {
            return;
        }

        let instance = task.instance();
        let mut queueable = false;
        {
            let _guard = task.lock();
            match task.state() {
                TaskState::Created if task.instance() == instance && task.deps_resolved() => {
                    task.set_state(TaskState::Queued);
                    queueable = true;
                }
                TaskState::Suspended => queueable = true,
                _ => {}
            }
        }
        if !queueable {
            tracing::trace!(task = task.descr(), state = ?task.state(), "refusing enqueue");
            return;
        }

        // Root children of a later phase are held until matching raises
        // the watermark. The queue lock closes the race with the
        // watermark advance.
        if task.parent().is_some_and(|p| p.is_root()) && !self.phases.is_runnable(task.phase()) {
            let mut deferred = false;
            {
                let _task_guard = task.lock();
                let mut queue = self.engine.deferred_local.lock();
                if !self.phases.is_runnable(task.phase())
                    && matches!(task.state(), TaskState::Queued | TaskState::Created)
                {
                    task.set_state(TaskState::Deferred);
                    queue.pushback(Arc::clone(task));
                    deferred = true;
                }
            }
            if deferred {
                tracing::trace!(task = task.descr(), phase = task.phase().0, "task deferred");
                return;
            }
        }

        if task.has_flag(TaskFlags::IMMEDIATE) {
            let rt = context::current_runtime();
            let thread = context::current_thread();
            worker::handle_inline_task(&rt, &thread, Arc::clone(task));
            return;
        }

        let thread = context::current_thread();
        let node = if self.cfg.respect_numa {
            task.numa_hint().unwrap_or(0).min(self.queues.len() - 1)
        } else {
            0
        };

        // Locality fast path: hand the task to ourselves.
        if !thread.is_utility && node == thread.numa && thread.hot_try_put(task) {
            tracing::trace!(task = task.descr(), thread = thread.id, "task in hot slot");
            return;
        }

        self.queue_for(node).push(Arc::clone(task));
        self.wakeup_one();
    }

    pub(crate) fn destroy_task(&self, task: &TaskHandle) {
        if task.parent().is_some_and(|p| p.is_root()) {
            self.phases.take_task(task.phase());
        }
        task.reset_for_destroy();
        self.threads[task.owner].pool.release(Arc::clone(task));
    }

    /// Creates a task under the current task. The core of the public
    /// `create_task` and of the internal copy-in machinery.
    pub(crate) fn create_task_internal(
        &self,
        body: crate::task::TaskBody,
        deps: &[DepDescriptor],
        prio: Priority,
        flags: CreateFlags,
        descr: &'static str,
        is_comm: bool,
        want_ref: bool,
    ) -> Result<Option<TaskRef>, Error> {
        if self.cancel.requested() {
            tracing::warn!("ignoring task creation while cancelling");
            return Ok(None);
        }

        if !self.threads_running() {
            context::current_runtime().start_threads();
        }

        let thread = context::current_thread();
        let parent = thread.current_task();
        let task = thread.pool.allocate();

        let phase = if parent.is_root() {
            self.phases.current()
        } else {
            Phase::ANY
        };
        task.reinit(body, Arc::clone(&parent), prio, phase, descr);
        if parent.is_root() {
            self.phases.add_task(phase);
        }
        if self.cfg.respect_numa {
            // Stand-in for address-based affinity: tasks inherit the
            // creating thread's node.
            task.set_numa_hint(thread.numa);
        }

        let taskref = want_ref.then(|| {
            task.set_flags(TaskFlags::HAS_REF);
            TaskRef::new(&task)
        });
        if flags.contains(CreateFlags::NOYIELD) {
            task.set_flags(TaskFlags::INLINE);
        }
        if is_comm {
            task.set_flags(TaskFlags::IS_COMMTASK);
        }

        let nc = parent.num_children.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(parent = parent.descr(), children = nc, "child registered");

        self.engine.handle_task(self, &task, deps);

        let runnable = {
            let _guard = task.lock();
            task.set_state(TaskState::Created);
            task.deps_resolved()
        };
        tracing::trace!(
            task = task.descr(),
            runnable,
            phase = task.phase().0,
            "task created"
        );

        if runnable {
            self.enqueue_runnable(&task);
        }

        Ok(taskref)
    }

    /// Active-message dispatch, invoked by the transport poller.
    pub(crate) fn dispatch_message(&self, src: UnitId, msg: Message) {
        tracing::trace!(%src, ?msg, "handling active message");
        match msg {
            Message::RequestInDep {
                gptr,
                phase,
                origin,
                origin_ref,
            } => self.engine.handle_remote_indep(
                self,
                RemoteInDep {
                    gptr,
                    phase,
                    origin,
                    origin_ref,
                },
            ),
            Message::ReleaseDep { origin_ref } => {
                self.engine.handle_remote_release(self, origin_ref)
            }
            Message::SendRequest {
                gptr,
                nbytes,
                tag,
                phase,
                origin,
            } => copyin::handle_send_request(self, gptr, nbytes as usize, tag, phase, origin),
        }
    }

    /// Phase matching: serve and re-match deferred remote requests,
    /// create parked send tasks, raise the watermark and release local
    /// deferred work.
    pub(crate) fn perform_matching(&self, phase: Phase, local_only: bool) {
        tracing::debug!(
            phase = phase.0,
            local_only,
            in_flight = self.phases.tasks_in_flight(),
            "performing matching"
        );

        if !local_only && self.num_units() > 1 {
            self.amsgq.process_blocking(self);
            self.engine.handle_deferred_remote(self, phase);
            copyin::create_delayed_send_tasks(self);
        }

        self.phases.set_runnable(phase);
        self.engine.handle_deferred_local(self);
        self.wakeup_all();
    }

    fn shutdown_impl(self: &Arc<Self>) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("tearing down runtime");

        if self.threads_running() {
            self.parallel.store(false, Ordering::Release);
            self.wakeup_all();
            let handles = std::mem::take(&mut *self.join_handles.lock());
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("worker thread panicked");
                }
            }
        }

        for t in &self.threads {
            tracing::info!(thread = t.id, executed = t.taskcntr.get(), "thread statistics");
        }

        if !self.waitlist.is_empty() {
            tracing::warn!("wait list not empty at shutdown");
        }
        self.engine.assert_quiescent();
        self.amsgq.close();

        context::unbind_matching(self);
        tracing::debug!("runtime torn down");
    }
}

impl std::fmt::Debug for RuntimeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("unit", &self.my_unit())
            .field("units", &self.num_units())
            .field("threads", &self.cfg.num_threads)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Builds a single-unit runtime.
    pub fn build(self) -> Result<Runtime, Error> {
        self.build_with_team(LocalTeam::solo())
    }

    /// Builds a runtime participating in `team`. The calling thread
    /// becomes the master (thread 0).
    pub fn build_with_team(self, team: Arc<dyn Team>) -> Result<Runtime, Error> {
        if context::is_bound() {
            return Err(Error::InvalidArgument(
                "a runtime is already active on this thread",
            ));
        }

        let cfg = self.freeze()?;
        tracing::info!(
            threads = cfg.num_threads,
            unit = %team.my_unit(),
            units = team.num_units(),
            "initializing runtime"
        );

        let threads: Vec<Arc<WorkerThread>> = (0..cfg.num_threads)
            .map(|i| WorkerThread::new(&cfg, i as isize, i))
            .collect();
        let num_queues = if cfg.respect_numa {
            cfg.num_numa_nodes
        } else {
            1
        };

        let inner = Arc::new(RuntimeInner {
            amsgq: Amsgq::new(&cfg, Arc::clone(&team)),
            team,
            root: Task::new_root(),
            queues: (0..num_queues).map(|_| TaskQueue::new()).collect(),
            engine: DepEngine::default(),
            copyin: CopyinState::new(),
            waitlist: WaitList::default(),
            phases: PhaseTracker::new(),
            cancel: CancelState::default(),
            threads,
            join_handles: Mutex::new(Vec::new()),
            parallel: AtomicBool::new(true),
            threads_running: AtomicBool::new(false),
            worker_poll_remote: AtomicBool::new(false),
            idle_mutex: Mutex::new(()),
            idle_cv: Condvar::new(),
            num_utility: AtomicIsize::new(0),
            finalized: AtomicBool::new(false),
            cfg,
        });

        context::bind(Arc::clone(&inner), Arc::clone(&inner.threads[0]));
        inner.threads[0].set_current_task(Arc::clone(&inner.root));

        Ok(Runtime { inner })
    }
}

/// A per-process (per-unit) task runtime. Dropping it tears the thread
/// pool down; [`Runtime::shutdown`] does so explicitly and verifies the
/// shutdown invariants.
#[derive(Debug)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn my_unit(&self) -> UnitId {
        self.inner.my_unit()
    }

    pub fn num_units(&self) -> usize {
        self.inner.num_units()
    }

    pub fn num_threads(&self) -> usize {
        self.inner.cfg.num_threads
    }

    /// Number of live tasks under the root.
    pub fn num_tasks(&self) -> i32 {
        self.inner.root.num_children.load(Ordering::Acquire)
    }

    /// Publishes `[base, base+len)` as a segment of this unit, making it
    /// addressable by [`GlobalPtr`]s across the team.
    pub fn register_segment(
        &self,
        segment: SegmentId,
        base: *mut u8,
        len: usize,
    ) -> Result<(), Error> {
        self.inner.team.register_segment(segment, base, len)
    }

    /// Resolves a pointer owned by this unit to a local address.
    pub fn segment_addr(&self, gptr: GlobalPtr) -> Result<*mut u8, Error> {
        self.inner.team.local_base(gptr)
    }

    fn ensure_bound(&self) -> Result<Arc<RuntimeInner>, Error> {
        match context::try_current() {
            Some((rt, _)) if Arc::ptr_eq(&rt, &self.inner) => Ok(rt),
            Some(_) => Err(Error::InvalidArgument(
                "called from a thread bound to another runtime",
            )),
            None => Err(Error::InvalidArgument("not a runtime thread")),
        }
    }

    /// Creates a task whose execution is ordered by `deps`.
    pub fn create_task<F>(
        &self,
        body: F,
        deps: &[DepDescriptor],
        prio: Priority,
        flags: CreateFlags,
        descr: &'static str,
    ) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let rt = self.ensure_bound()?;
        validate_deps(deps)?;
        rt.create_task_internal(Box::new(body), deps, prio, flags, descr, false, false)
            .map(|_| ())
    }

    /// Like [`Runtime::create_task`], returning a waitable reference.
    pub fn create_task_ref<F>(
        &self,
        body: F,
        deps: &[DepDescriptor],
        prio: Priority,
        flags: CreateFlags,
        descr: &'static str,
    ) -> Result<TaskRef, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let rt = self.ensure_bound()?;
        validate_deps(deps)?;
        let r = rt.create_task_internal(Box::new(body), deps, prio, flags, descr, false, true)?;
        r.ok_or(Error::Other(anyhow::anyhow!(
            "task creation yielded no reference"
        )))
    }

    /// Blocks until the referenced task finished, contributing to task
    /// execution meanwhile. Consumes the claim.
    pub fn task_wait(&self, taskref: TaskRef) -> Result<(), Error> {
        let rt = self.ensure_bound()?;
        if !taskref.is_current() {
            return Err(Error::InvalidArgument("stale task reference"));
        }

        let task = Arc::clone(&taskref.task);
        loop {
            if taskref.task.instance() != taskref.instance {
                break;
            }
            let state = {
                let _guard = task.lock();
                task.state()
            };
            match state {
                TaskState::Finished | TaskState::Cancelled | TaskState::Destroyed => break,
                _ => {}
            }

            let thread = context::current_thread();
            let next = worker::next_task(&rt, &thread).or_else(|| {
                worker::remote_progress(&rt, &thread, true);
                worker::next_task(&rt, &thread)
            });
            match next {
                Some(next) => worker::handle_task_any(&rt, &thread, next),
                None => std::hint::spin_loop(),
            }
        }

        self.release_ref(&rt, &taskref);
        Ok(())
    }

    /// Non-blocking completion probe. On a single-threaded pool one task
    /// is executed to guarantee progress.
    pub fn task_test(&self, taskref: &TaskRef) -> Result<bool, Error> {
        let rt = self.ensure_bound()?;
        if !taskref.is_current() {
            return Err(Error::InvalidArgument("stale task reference"));
        }

        let done = |task: &TaskHandle| {
            matches!(
                task.state(),
                TaskState::Finished | TaskState::Cancelled | TaskState::Destroyed
            )
        };

        if !done(&taskref.task) && rt.cfg.num_threads == 1 {
            let thread = context::current_thread();
            worker::remote_progress(&rt, &thread, true);
            if let Some(next) = worker::next_task(&rt, &thread) {
                worker::handle_task_any(&rt, &thread, next);
            }
        }

        Ok(done(&taskref.task) || taskref.task.instance() != taskref.instance)
    }

    /// Releases the claim without waiting. A task that already finished
    /// is destroyed here.
    pub fn taskref_free(&self, taskref: TaskRef) -> Result<(), Error> {
        let rt = self.ensure_bound()?;
        if !taskref.is_current() {
            return Err(Error::InvalidArgument("stale task reference"));
        }
        self.release_ref(&rt, &taskref);
        Ok(())
    }

    fn release_ref(&self, rt: &Arc<RuntimeInner>, taskref: &TaskRef) {
        let task = &taskref.task;
        let destroy = {
            let _guard = task.lock();
            if task.instance() != taskref.instance {
                false
            } else {
                task.unset_flags(TaskFlags::HAS_REF);
                matches!(task.state(), TaskState::Finished | TaskState::Cancelled)
            }
        };
        if destroy {
            rt.destroy_task(task);
        }
    }

    /// Yields the calling task; see [`crate::yield_task`].
    pub fn yield_task(&self, delay: i32) -> Result<(), Error> {
        self.ensure_bound()?;
        worker::yield_current(delay)
    }

    /// Waits for all child tasks of the calling task. On the root task
    /// with `local_only == false` this is a team-wide quiescence point.
    pub fn task_complete(&self, local_only: bool) -> Result<(), Error> {
        let rt = self.ensure_bound()?;
        worker::task_complete(&rt, local_only)
    }

    pub fn phase_advance(&self) -> Phase {
        self.inner.phases.advance()
    }

    pub fn phase_current(&self) -> Phase {
        self.inner.phases.current()
    }

    /// Requests cooperative cancellation of all outstanding tasks.
    pub fn request_cancellation(&self) {
        self.inner.cancel.request();
        self.inner.wakeup_all();
    }

    /// Spawns a non-participating thread with a scheduler binding, e.g.
    /// for dedicated transport polling.
    pub fn utility_thread<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let rt = Arc::clone(&self.inner);
        let id = -(rt.num_utility.fetch_add(1, Ordering::AcqRel) + 1);
        std::thread::Builder::new()
            .name(format!("weft-utility-{}", -id))
            .spawn(move || {
                let record =
                    WorkerThread::new_utility(&rt.cfg, id, Arc::clone(&rt.threads[0].pool));
                record.set_current_task(Arc::clone(&rt.root));
                context::bind(Arc::clone(&rt), record);
                f();
                context::unbind();
            })
            .expect("FATAL: failed to spawn utility thread");
    }

    /// Tears down the pool and verifies the shutdown invariants.
    pub fn shutdown(self) -> Result<(), Error> {
        self.inner.shutdown_impl();
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.shutdown_impl();
    }
}

fn validate_deps(deps: &[DepDescriptor]) -> Result<(), Error> {
    use crate::deps::DepKind;
    for dep in deps {
        match dep.kind {
            DepKind::Copyin | DepKind::CopyinR => {
                if dep.copyin.is_none() {
                    return Err(Error::InvalidArgument(
                        "copy-in dependency without transfer parameters",
                    ));
                }
            }
            DepKind::CopyinOut => {
                return Err(Error::InvalidArgument(
                    "CopyinOut is internal to the runtime",
                ));
            }
            DepKind::Direct => {
                if dep.task.is_none() {
                    return Err(Error::InvalidArgument(
                        "direct dependency without a task reference",
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
