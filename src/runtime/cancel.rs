//! Cooperative cancellation.
//!
//! A request raises a flag that workers check between tasks; queued
//! tasks are drained and cancelled, and a running task aborts at its
//! next yield or cancellation point by unwinding back to its fiber
//! entry. Release of a cancelled task flows through the regular
//! successor walk, where the enqueue guard cancels successors instead
//! of running them.

use crate::runtime::RuntimeInner;
use crate::runtime::thread::WorkerThread;
use crate::task::{TaskFlags, TaskHandle, TaskState};
use std::sync::atomic::{AtomicBool, Ordering};

/// Panic payload used to abort a running task back to its fiber entry.
pub(crate) struct CancelledTask;

#[derive(Debug, Default)]
pub(crate) struct CancelState {
    requested: AtomicBool,
}

impl CancelState {
    pub(crate) fn request(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            tracing::info!("task cancellation requested");
        }
    }

    pub(crate) fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.requested.store(false, Ordering::Release);
    }
}

/// Aborts the running task; must be called from within a fiber-backed
/// task. The unwind is caught at the fiber entry, which transitions the
/// task to `Cancelled` and returns to the worker.
pub(crate) fn abort_current_task() -> ! {
    std::panic::panic_any(CancelledTask)
}

/// Worker check between tasks: drains and cancels everything queued.
pub(crate) fn check(rt: &RuntimeInner, thread: &WorkerThread) {
    if !rt.cancel().requested() {
        return;
    }

    while let Some(task) = thread.hot_take_front() {
        cancel_task(rt, &task);
    }
    for queue in rt.queues() {
        while let Some(task) = queue.pop() {
            cancel_task(rt, &task);
        }
    }
    while let Some(task) = rt.engine().deferred_local.pop() {
        cancel_task(rt, &task);
    }
}

/// Cancels a task that has not started running. Its successors are
/// released through the normal walk and get cancelled in turn by the
/// enqueue guard, so accounting drains without executing anything.
pub(crate) fn cancel_task(rt: &RuntimeInner, task: &TaskHandle) {
    let has_ref;
    {
        let _guard = task.lock();
        match task.state() {
            TaskState::Created
            | TaskState::Queued
            | TaskState::Deferred
            | TaskState::Suspended
            | TaskState::Blocked => {}
            other => {
                tracing::trace!(task = task.descr(), state = ?other, "not cancellable");
                return;
            }
        }
        task.set_state(TaskState::Cancelled);
        has_ref = task.has_flag(TaskFlags::HAS_REF);
    }

    tracing::debug!(task = task.descr(), "task cancelled");

    // A suspended or blocked task still owns a fiber.
    if let Some(ctx) = task.inner.lock().ctx.take() {
        ctx.release();
    }
    task.inner.lock().wait_handle = None;

    rt.engine().release_local_task(rt, task);

    let parent = task.parent();
    if !has_ref && task.num_children.load(Ordering::Acquire) == 0 {
        rt.destroy_task(task);
    }
    if let Some(parent) = parent {
        parent.num_children.fetch_sub(1, Ordering::AcqRel);
    }
}
