//! Worker main loop, work stealing, task invocation and suspension.

use crate::config::{IDLE_GRACE, IDLE_GRACE_SLEEP, REMOTE_PROGRESS_INTERVAL};
use crate::error::Error;
use crate::fiber::{self, Context, StackContext};
use crate::runtime::cancel::{self, CancelledTask};
use crate::runtime::thread::WorkerThread;
use crate::runtime::{RuntimeInner, context};
use crate::task::{TaskFlags, TaskHandle, TaskState};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Main loop of pool workers (ids >= 1). The master thread participates
/// through completion waits instead.
pub(crate) fn thread_main(rt: Arc<RuntimeInner>, thread: Arc<WorkerThread>) {
    context::bind(Arc::clone(&rt), Arc::clone(&thread));
    if rt.cfg().bind_threads {
        bind_affinity(thread.slot);
    }
    thread.set_current_task(Arc::clone(rt.root()));
    tracing::info!(id = thread.id, numa = thread.numa, "worker thread running");

    let mut idle_since: Option<Instant> = None;

    while rt.parallel() {
        cancel::check(&rt, &thread);

        let task = next_task(&rt, &thread);
        let found_work = task.is_some();
        if let Some(task) = task {
            handle_task_any(&rt, &thread, task);
        }

        // Thread 1 doubles as the transport poller when idle or while a
        // root completion wait is in flight.
        if thread.id == 1 && (!found_work || rt.poll_remote()) {
            remote_progress(&rt, &thread, !found_work);
            if !found_work && rt.num_units() == 1 {
                std::thread::sleep(IDLE_GRACE_SLEEP);
            }
        } else if !found_work {
            match idle_since {
                None => idle_since = Some(Instant::now()),
                Some(t0) if t0.elapsed() > IDLE_GRACE => {
                    rt.wait_for_work();
                    idle_since = None;
                }
                Some(_) => {}
            }
            std::thread::sleep(IDLE_GRACE_SLEEP);
        } else {
            idle_since = None;
        }
    }

    tracing::info!(id = thread.id, executed = thread.taskcntr.get(), "worker thread exiting");
    context::unbind();
}

#[cfg(target_os = "linux")]
fn bind_affinity(slot: usize) {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut set = CpuSet::new();
    if set.set(slot % cores).is_ok() {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
            tracing::warn!(slot, error = %e, "failed to bind worker thread");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_affinity(_slot: usize) {}

/// Work acquisition in stealing order: the yield hand-off, own hot
/// slots, the last successful victim, same-node victims, the node-local
/// global queue, other nodes' queues, cross-node victims.
pub(crate) fn next_task(rt: &RuntimeInner, thread: &WorkerThread) -> Option<TaskHandle> {
    if let Some(task) = thread.take_next() {
        return Some(task);
    }
    if let Some(task) = thread.hot_take_front() {
        return Some(task);
    }

    let threads = rt.threads();
    let n = threads.len();

    let last = thread.last_steal.get();
    if last != thread.slot && last < n {
        if let Some(task) = threads[last].hot_take_back() {
            return Some(task);
        }
    }

    for step in 1..n {
        let v = (thread.slot + step) % n;
        let victim = &threads[v];
        if victim.numa != thread.numa {
            continue;
        }
        if let Some(task) = victim.hot_take_back() {
            tracing::trace!(victim = victim.id, "stole task (same node)");
            thread.last_steal.set(v);
            return Some(task);
        }
    }

    let queues = rt.queues();
    for step in 0..queues.len() {
        let q = &queues[(thread.numa + step) % queues.len()];
        if let Some(task) = q.pop() {
            return Some(task);
        }
    }

    if queues.len() > 1 {
        for step in 1..n {
            let v = (thread.slot + step) % n;
            let victim = &threads[v];
            if victim.numa == thread.numa {
                continue;
            }
            if let Some(task) = victim.hot_take_back() {
                tracing::trace!(victim = victim.id, "stole task (cross node)");
                thread.last_steal.set(v);
                return Some(task);
            }
        }
    }

    None
}

pub(crate) fn handle_task_any(rt: &Arc<RuntimeInner>, thread: &Arc<WorkerThread>, task: TaskHandle) {
    if task.has_flag(TaskFlags::INLINE) {
        handle_inline_task(rt, thread, task);
    } else {
        handle_task(rt, thread, task);
    }
}

/// Executes a fiber-backed task and postprocesses whatever state it
/// comes back in.
fn handle_task(rt: &Arc<RuntimeInner>, thread: &Arc<WorkerThread>, task: TaskHandle) {
    let previous = thread.current_task();

    debug_assert!(
        task.deps_resolved(),
        "runnable task {} has unresolved dependencies",
        task.descr()
    );

    {
        let _guard = task.lock();
        match task.state() {
            TaskState::Queued | TaskState::Suspended => task.set_state(TaskState::Running),
            other => panic!(
                "FATAL: invalid state {:?} of dequeued task {}",
                other,
                task.descr()
            ),
        }
    }

    tracing::trace!(id = thread.id, task = task.descr(), "executing task");
    invoke_task(rt, thread, &task);

    // Back on this worker's stack; the fiber suspended or terminated.
    let prev = thread.current_task();
    match prev.state() {
        TaskState::Detached => {
            if let Some(ctx) = prev.inner.lock().ctx.take() {
                ctx.release();
            }
            wait_enqueue(rt, prev);
        }
        TaskState::Blocked => wait_enqueue(rt, prev),
        TaskState::Suspended => requeue_task(rt, thread, prev),
        TaskState::Running | TaskState::Cancelled => {
            if prev.num_children.load(Ordering::Acquire) != 0 && !rt.cancel().requested() {
                // Implicit wait for child tasks.
                let _ = task_complete(rt, true);
            }
            let task = context::current_thread().current_task();
            complete_task(rt, &task);
        }
        other => {
            panic!("FATAL: task {} returned in state {:?}", prev.descr(), other)
        }
    }

    let thread = context::current_thread();
    thread.set_current_task(previous);
    thread.taskcntr.set(thread.taskcntr.get() + 1);
}

/// Executes a task directly on the worker stack: no fiber, no yield.
pub(crate) fn handle_inline_task(
    rt: &Arc<RuntimeInner>,
    thread: &Arc<WorkerThread>,
    task: TaskHandle,
) {
    let previous = thread.current_task();

    {
        let _guard = task.lock();
        task.set_state(TaskState::Running);
    }
    thread.set_current_task(Arc::clone(&task));
    tracing::trace!(id = thread.id, task = task.descr(), "executing inline task");

    invoke_taskfn(&task);

    if task.num_children.load(Ordering::Acquire) != 0 && !rt.cancel().requested() {
        let _ = task_complete(rt, true);
    }

    if task.state() == TaskState::Detached {
        wait_enqueue(rt, task);
    } else {
        complete_task(rt, &task);
    }

    let thread = context::current_thread();
    thread.set_current_task(previous);
    thread.taskcntr.set(thread.taskcntr.get() + 1);
}

/// Swaps into the task's fiber, building a context on first invocation.
fn invoke_task(rt: &Arc<RuntimeInner>, thread: &Arc<WorkerThread>, task: &TaskHandle) {
    if rt.cancel().requested() {
        // Skip the body; the completion path drains the accounting and
        // the enqueue guard cancels released successors.
        thread.set_current_task(Arc::clone(task));
        return;
    }

    {
        let mut inner = task.inner.lock();
        if inner.ctx.is_none() {
            let rt2 = Arc::clone(rt);
            let task2 = Arc::clone(task);
            let ctx = thread
                .ctx_cache
                .create(Box::new(move || wrap_task(rt2, task2)))
                .expect("FATAL: failed to allocate a fiber context");
            inner.ctx = Some(ctx);
        }
    }

    thread.set_current_task(Arc::clone(task));

    // The context slot stays put while the task runs; nobody moves it
    // until completion or detach on this very thread.
    let ctx_ptr: *const StackContext = {
        let inner = task.inner.lock();
        inner.ctx.as_ref().expect("context just installed") as *const _
    };
    unsafe { fiber::swap_into(&thread.retctx, &*ctx_ptr) };
}

/// Fiber entry: runs the body exactly once, then re-enters the worker.
/// Never returns; owned captures are dropped before the stack is
/// abandoned.
fn wrap_task(rt: Arc<RuntimeInner>, task: TaskHandle) {
    debug_assert!(!task.is_root());
    invoke_taskfn(&task);
    drop(task);
    drop(rt);

    let thread = context::current_thread();
    let retctx: *const Context = &thread.retctx;
    drop(thread);
    unsafe { fiber::enter(&*retctx) }
}

fn invoke_taskfn(task: &TaskHandle) {
    let Some(body) = task.take_body() else {
        tracing::warn!(task = task.descr(), "task without a body");
        return;
    };

    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => {
            tracing::trace!(task = task.descr(), "task body done");
        }
        Err(payload) if payload.is::<CancelledTask>() => {
            let _guard = task.lock();
            task.set_state(TaskState::Cancelled);
            tracing::debug!(task = task.descr(), "task aborted by cancellation");
        }
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("<non-string panic>");
            // Task-function failure is not modeled; a panic that is not
            // a cancellation must not unwind across the fiber boundary.
            tracing::error!(task = task.descr(), msg, "task body panicked");
            std::process::abort();
        }
    }
}

fn wait_enqueue(rt: &RuntimeInner, task: TaskHandle) {
    let handle = task.inner.lock().wait_handle.clone();
    match handle {
        Some(handle) => rt.waitlist().enqueue(task, handle),
        None => {
            tracing::warn!(task = task.descr(), "gated task without a wait handle");
        }
    }
}

/// Requeue placement after a yield: 0 selects the front, negative the
/// back, positive an insertion that many positions behind the front.
fn requeue_task(rt: &RuntimeInner, thread: &WorkerThread, task: TaskHandle) {
    let delay = thread.delay.get();
    let queue = rt.queue_for(thread.numa);
    if delay == 0 {
        queue.push(task);
    } else if delay > 0 {
        queue.insert(task, delay as usize);
    } else {
        queue.pushback(task);
    }
}

/// Cooperatively yields the running task. Illegal from inline tasks.
pub(crate) fn yield_current(delay: i32) -> Result<(), Error> {
    let Some((rt, thread)) = context::try_current() else {
        return Err(Error::InvalidArgument("yield outside the runtime"));
    };
    if !rt.threads_running() {
        // No tasks to yield to yet.
        return Ok(());
    }

    let current = thread.current_task();

    if rt.cancel().requested() && !current.is_root() && !current.has_flag(TaskFlags::INLINE) {
        cancel::abort_current_task();
    }

    if current.has_flag(TaskFlags::INLINE) {
        return Err(Error::InvalidArgument("cannot yield from an inline task"));
    }

    if current.is_root() {
        // The root task is never suspended; the master runs one task
        // inline instead.
        let next = next_task(&rt, &thread).or_else(|| {
            remote_progress(&rt, &thread, true);
            next_task(&rt, &thread)
        });
        if let Some(next) = next {
            handle_task_any(&rt, &thread, next);
        }
        return Ok(());
    }

    // A blocked task leaves immediately; the wait subsystem re-enqueues
    // it, so it must not be picked up on the way out.
    if current.state() == TaskState::Blocked {
        let ctx_ptr: *const StackContext = {
            let inner = current.inner.lock();
            inner.ctx.as_ref().expect("running task without context") as *const _
        };
        unsafe { fiber::swap((*ctx_ptr).ctx(), &thread.retctx) };
        return Ok(());
    }

    let next = next_task(&rt, &thread).or_else(|| {
        remote_progress(&rt, &thread, true);
        next_task(&rt, &thread)
    });
    let Some(next) = next else {
        return Ok(());
    };

    tracing::trace!(task = current.descr(), next = next.descr(), delay, "yielding");
    thread.delay.set(delay);
    {
        let _guard = current.lock();
        if current.inner.lock().wait_handle.is_some() {
            current.set_state(TaskState::Blocked);
        } else {
            current.set_state(TaskState::Suspended);
        }
    }
    thread.set_next(next);

    let ctx_ptr: *const StackContext = {
        let inner = current.inner.lock();
        inner.ctx.as_ref().expect("running task without context") as *const _
    };
    unsafe { fiber::swap((*ctx_ptr).ctx(), &thread.retctx) };
    // Resumed, possibly on a different thread; `thread` is stale here.
    Ok(())
}

/// Transport progress: drains the wait list, then polls the message
/// queue when due. Single-unit teams never engage the transport.
pub(crate) fn remote_progress(rt: &RuntimeInner, thread: &WorkerThread, force: bool) {
    rt.waitlist().progress(rt);

    if rt.num_units() == 1 {
        return;
    }

    let now = Instant::now();
    let due = force
        || thread
            .last_progress
            .get()
            .is_none_or(|t| now.duration_since(t) >= REMOTE_PROGRESS_INTERVAL);
    if !due {
        return;
    }
    thread.last_progress.set(Some(now));

    rt.amsgq().flush(rt);
    let _ = rt.amsgq().try_process(rt);
    rt.waitlist().progress(rt);
}

/// Completion finalization: release successors, transition, recycle.
fn complete_task(rt: &RuntimeInner, task: &TaskHandle) {
    let cancelled = task.state() == TaskState::Cancelled;
    let has_ref;
    {
        // Atomic with the remote-successor check in the dependency
        // handlers.
        let _guard = task.lock();
        if !cancelled {
            task.set_state(TaskState::Finished);
        }
        has_ref = task.has_flag(TaskFlags::HAS_REF);
    }

    if let Some(ctx) = task.inner.lock().ctx.take() {
        ctx.release();
    }

    rt.engine().release_local_task(rt, task);

    let parent = task.parent();
    if !has_ref {
        if task.num_children.load(Ordering::Acquire) == 0 {
            rt.destroy_task(task);
        } else {
            // A cancelled task may leave children behind; the record
            // must outlive their completion accounting.
            tracing::warn!(task = task.descr(), "task retired with live children");
        }
    }
    if let Some(parent) = parent {
        let nc = parent.num_children.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(parent = parent.descr(), children_left = nc, "child completed");
    }
}

/// Drains the current task's children; on the root task this is the
/// global quiescence point described in the completion protocol.
pub(crate) fn task_complete(rt: &Arc<RuntimeInner>, local_only: bool) -> Result<(), Error> {
    if !rt.threads_running() {
        if local_only {
            return Ok(());
        }
        // Start up and participate in the matching.
        rt.start_threads();
    }

    let thread = context::current_thread();
    let current = thread.current_task();
    let is_root = current.is_root();

    if is_root && thread.id != 0 {
        return Err(Error::InvalidArgument(
            "completion wait on the root task is master-only",
        ));
    }

    tracing::debug!(
        task = current.descr(),
        children = current.num_children.load(Ordering::Acquire),
        local_only,
        "waiting for child tasks"
    );

    if is_root {
        let entry_phase = rt.phases().current();
        rt.perform_matching(entry_phase, local_only);
        if !local_only {
            rt.set_poll_remote(true);
        }
    }

    rt.wakeup_all();

    let task = current;
    // The return-context slot is reused by the nested scheduling loop.
    let saved = (task.num_children.load(Ordering::Acquire) > 0).then(|| thread.retctx.snapshot());
    drop(thread);

    while task.num_children.load(Ordering::Acquire) > 0 {
        // Re-read: nested execution may have moved us.
        let thread = context::current_thread();

        let mut next = next_task(rt, &thread);
        if next.is_none() {
            remote_progress(rt, &thread, thread.id == 0);
            next = next_task(rt, &thread);
        }

        if rt.cancel().requested() {
            // Queued tasks cancel here; running tasks abort at their
            // next yield and drain through the regular completion path.
            cancel::check(rt, &thread);
        }

        match next {
            Some(next) => handle_task_any(rt, &thread, next),
            None => std::hint::spin_loop(),
        }
    }

    if let Some(sp) = saved {
        context::current_thread().retctx.restore(sp);
    }

    if is_root {
        rt.set_poll_remote(false);
        rt.phases().reset();

        if rt.cancel().requested() {
            rt.cancel().reset();
        }

        if !local_only && rt.num_units() > 1 {
            // Quiesce remaining remote activity; the access history must
            // survive until here so straggling in-dep requests still
            // match their finished producers.
            rt.amsgq().process_blocking(rt);
        }

        // Fresh epoch: retire the root's access history.
        rt.root().dephash.lock().clear();
    }

    Ok(())
}
