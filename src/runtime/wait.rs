//! Wait/detach side list: tasks whose completion is gated on an
//! external transfer handle.
//!
//! The list is drained by the transport poller. A blocked task is
//! re-enqueued once its handle completes; a detached task completed
//! logically when its body returned, so handle completion triggers its
//! dependency release.

use crate::remote::comm::TransferHandle;
use crate::runtime::{RuntimeInner, context};
use crate::task::{TaskFlags, TaskHandle, TaskState};
use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::Ordering;

#[derive(Debug)]
struct WaitEntry {
    task: TaskHandle,
    handle: TransferHandle,
}

#[derive(Debug, Default)]
pub(crate) struct WaitList {
    entries: Mutex<Slab<WaitEntry>>,
}

impl WaitList {
    pub(crate) fn enqueue(&self, task: TaskHandle, handle: TransferHandle) {
        tracing::trace!(task = task.descr(), "task gated on transfer handle");
        self.entries.lock().insert(WaitEntry { task, handle });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Releases every task whose handle completed. Returns how many were
    /// released.
    pub(crate) fn progress(&self, rt: &RuntimeInner) -> usize {
        let ready: Vec<TaskHandle> = {
            let mut entries = self.entries.lock();
            if entries.is_empty() {
                return 0;
            }
            let keys: Vec<usize> = entries
                .iter()
                .filter(|(_, e)| e.handle.test())
                .map(|(k, _)| k)
                .collect();
            keys.into_iter()
                .map(|k| entries.remove(k).task)
                .collect()
        };

        let released = ready.len();
        for task in ready {
            match task.state() {
                TaskState::Blocked => {
                    tracing::trace!(task = task.descr(), "blocked task resumed");
                    task.inner.lock().wait_handle = None;
                    {
                        let _guard = task.lock();
                        task.set_state(TaskState::Suspended);
                    }
                    rt.enqueue_runnable(&task);
                }
                TaskState::Detached => release_detached(rt, &task),
                // Cancelled while parked; the cancellation path already
                // accounted for it.
                TaskState::Cancelled | TaskState::Destroyed => {}
                other => {
                    tracing::warn!(task = task.descr(), state = ?other, "unexpected state on wait list");
                }
            }
        }
        released
    }
}

/// Finishes a detached task: its body already returned, only the handle
/// was outstanding.
fn release_detached(rt: &RuntimeInner, task: &TaskHandle) {
    debug_assert_eq!(task.state(), TaskState::Detached);
    tracing::trace!(task = task.descr(), "detached task finished");

    task.inner.lock().wait_handle = None;

    let has_ref;
    {
        let _guard = task.lock();
        task.set_state(TaskState::Finished);
        has_ref = task.has_flag(TaskFlags::HAS_REF);
    }

    rt.engine().release_local_task(rt, task);

    let parent = task.parent();
    if !has_ref {
        rt.destroy_task(task);
    }
    if let Some(parent) = parent {
        let nc = parent.num_children.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(parent = parent.descr(), children_left = nc, "detached child done");
    }
}

/// Blocks the running task on `handle`; the wait subsystem re-enqueues
/// it on completion. Falls back to a progress spin when the caller
/// cannot suspend (root or inline task).
pub(crate) fn block_on_handle(handle: &TransferHandle) {
    let thread = context::current_thread();
    let task = thread.current_task();

    if task.is_root() || task.has_flag(TaskFlags::INLINE) {
        let rt = context::current_runtime();
        while !handle.test() {
            crate::runtime::worker::remote_progress(&rt, &thread, true);
            std::hint::spin_loop();
        }
        return;
    }

    task.inner.lock().wait_handle = Some(handle.clone());
    while !handle.test() {
        {
            let _guard = task.lock();
            task.set_state(TaskState::Blocked);
        }
        if let Err(e) = crate::runtime::worker::yield_current(0) {
            tracing::warn!(error = %e, "blocked yield failed");
        }
    }
    task.inner.lock().wait_handle = None;
    {
        // Back from the wait subsystem; we are running again.
        let _guard = task.lock();
        if task.state() == TaskState::Blocked {
            task.set_state(TaskState::Running);
        }
    }
}

/// Marks the running task detached: it completes logically when its
/// body returns, and its successors stay gated on `handle`.
pub(crate) fn detach_handle(handle: &TransferHandle) {
    let thread = context::current_thread();
    let task = thread.current_task();
    debug_assert!(!task.is_root(), "the root task cannot detach");

    task.inner.lock().wait_handle = Some(handle.clone());
    let _guard = task.lock();
    task.set_state(TaskState::Detached);
    tracing::trace!(task = task.descr(), "task detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn progress_releases_only_completed_handles() {
        // Exercised end-to-end in the integration tests; here we only
        // check the bookkeeping of the list itself.
        let list = WaitList::default();
        assert!(list.is_empty());

        let task = crate::task::Task::new_root();
        let pending = TransferHandle::pending();
        list.enqueue(Arc::clone(&task), pending.clone());
        assert!(!list.is_empty());

        // Completing the handle makes the entry eligible; the release
        // path itself needs a runtime and is covered elsewhere.
        pending.complete();
        assert!(pending.test());
    }
}
