use crate::task::TaskHandle;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

/// The unlocked two-priority deque. All operations here are the "unsafe"
/// variants in the sense that callers compose them under an external
/// lock; [`TaskQueue`] provides the locked wrappers.
///
/// Push inserts at the front; pop takes from the front, draining the high
/// lane first. Stealing uses `popback` to stay off the owner's end.
#[derive(Debug, Default)]
pub(crate) struct DequePair {
    high: VecDeque<TaskHandle>,
    low: VecDeque<TaskHandle>,
}

impl DequePair {
    fn lane_mut(&mut self, task: &TaskHandle) -> &mut VecDeque<TaskHandle> {
        if task.prio().is_high() {
            &mut self.high
        } else {
            &mut self.low
        }
    }

    pub(crate) fn push(&mut self, task: TaskHandle) {
        self.lane_mut(&task).push_front(task);
    }

    pub(crate) fn pushback(&mut self, task: TaskHandle) {
        self.lane_mut(&task).push_back(task);
    }

    pub(crate) fn pop(&mut self) -> Option<TaskHandle> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    pub(crate) fn popback(&mut self) -> Option<TaskHandle> {
        self.high.pop_back().or_else(|| self.low.pop_back())
    }

    /// Inserts `task` `pos` positions behind the front of its lane.
    pub(crate) fn insert(&mut self, task: TaskHandle, pos: usize) {
        let lane = self.lane_mut(&task);
        let at = pos.min(lane.len());
        lane.insert(at, task);
    }

    /// Unlinks a specific task. Returns whether it was present.
    pub(crate) fn remove(&mut self, task: &TaskHandle) -> bool {
        for lane in [&mut self.high, &mut self.low] {
            if let Some(idx) = lane.iter().position(|t| Arc::ptr_eq(t, task)) {
                lane.remove(idx);
                return true;
            }
        }
        false
    }

    /// Splices all of `src` in front of this queue, preserving order.
    pub(crate) fn move_from(&mut self, src: &mut DequePair) {
        while let Some(task) = src.high.pop_back() {
            self.high.push_front(task);
        }
        while let Some(task) = src.low.pop_back() {
            self.low.push_front(task);
        }
    }

    /// Drops every task whose dependencies are not resolved, returning
    /// them to the caller. Used by cancellation; a dropped task comes
    /// back through `enqueue_runnable` once it actually is runnable.
    pub(crate) fn filter_runnable(&mut self) -> Vec<TaskHandle> {
        let mut dropped = Vec::new();
        for lane in [&mut self.high, &mut self.low] {
            let mut kept = VecDeque::with_capacity(lane.len());
            for task in lane.drain(..) {
                if task.deps_resolved() {
                    kept.push_back(task);
                } else {
                    dropped.push(task);
                }
            }
            *lane = kept;
        }
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }
}

/// A mutex-protected [`DequePair`]. Higher-level atomic sequences lock
/// once via [`TaskQueue::lock`] and compose the unlocked operations.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    inner: Mutex<DequePair>,
}

impl TaskQueue {
    pub(crate) fn new() -> TaskQueue {
        TaskQueue::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DequePair> {
        self.inner.lock()
    }

    pub(crate) fn push(&self, task: TaskHandle) {
        self.inner.lock().push(task);
    }

    pub(crate) fn pushback(&self, task: TaskHandle) {
        self.inner.lock().pushback(task);
    }

    pub(crate) fn pop(&self) -> Option<TaskHandle> {
        self.inner.lock().pop()
    }

    pub(crate) fn popback(&self) -> Option<TaskHandle> {
        self.inner.lock().popback()
    }

    pub(crate) fn insert(&self, task: TaskHandle, pos: usize) {
        self.inner.lock().insert(task, pos);
    }

    pub(crate) fn remove(&self, task: &TaskHandle) -> bool {
        self.inner.lock().remove(task)
    }

    pub(crate) fn move_from(&self, src: &TaskQueue) {
        let mut dst = self.inner.lock();
        let mut src = src.inner.lock();
        dst.move_from(&mut src);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::task::{Priority, Task, TaskState};
    use rstest::rstest;

    fn mk(prio: Priority) -> TaskHandle {
        let root = Task::new_root();
        let t = Arc::new(Task::empty(0));
        t.reinit(Box::new(|| {}), root, prio, Phase::ANY, "q");
        t.set_state(TaskState::Queued);
        t
    }

    #[test]
    fn high_lane_drains_first() {
        let q = TaskQueue::new();
        let lo = mk(Priority::Low);
        let hi = mk(Priority::High);
        let def = mk(Priority::Default);

        q.push(Arc::clone(&lo));
        q.push(Arc::clone(&def));
        q.push(Arc::clone(&hi));

        assert!(Arc::ptr_eq(&q.pop().unwrap(), &hi));
        // Default and low share the low lane; front is the last push.
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &def));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &lo));
        assert!(q.pop().is_none());
    }

    #[test]
    fn popback_steals_from_the_back() {
        let q = TaskQueue::new();
        let a = mk(Priority::Default);
        let b = mk(Priority::Default);
        q.push(Arc::clone(&a));
        q.push(Arc::clone(&b));

        // Owner front: b; stealer back: a.
        assert!(Arc::ptr_eq(&q.popback().unwrap(), &a));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
    }

    #[rstest]
    #[case(0, &["x", "a", "b", "c"])]
    #[case(2, &["a", "b", "x", "c"])]
    #[case(9, &["a", "b", "c", "x"])]
    fn insert_at_position(#[case] pos: usize, #[case] expect: &[&str]) {
        let root = Task::new_root();
        let named = |d: &'static str| {
            let t = Arc::new(Task::empty(0));
            t.reinit(Box::new(|| {}), Arc::clone(&root), Priority::Default, Phase::ANY, d);
            t.set_state(TaskState::Queued);
            t
        };

        let q = TaskQueue::new();
        q.pushback(named("a"));
        q.pushback(named("b"));
        q.pushback(named("c"));
        q.insert(named("x"), pos);

        let mut order = Vec::new();
        while let Some(t) = q.pop() {
            order.push(t.descr());
        }
        assert_eq!(order, expect);
    }

    #[test]
    fn remove_unlinks_the_exact_task() {
        let q = TaskQueue::new();
        let a = mk(Priority::Default);
        let b = mk(Priority::Default);
        q.push(Arc::clone(&a));
        q.push(Arc::clone(&b));

        assert!(q.remove(&a));
        assert!(!q.remove(&a));
        assert_eq!(q.len(), 1);
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
    }

    #[test]
    fn move_from_splices_in_front() {
        let dst = TaskQueue::new();
        let src = TaskQueue::new();
        let a = mk(Priority::Default);
        let b = mk(Priority::Default);
        let c = mk(Priority::Default);

        dst.pushback(Arc::clone(&c));
        src.pushback(Arc::clone(&a));
        src.pushback(Arc::clone(&b));

        dst.move_from(&src);
        assert!(src.is_empty());
        assert!(Arc::ptr_eq(&dst.pop().unwrap(), &a));
        assert!(Arc::ptr_eq(&dst.pop().unwrap(), &b));
        assert!(Arc::ptr_eq(&dst.pop().unwrap(), &c));
    }

    #[test]
    fn filter_runnable_drops_unresolved() {
        use std::sync::atomic::Ordering;

        let q = TaskQueue::new();
        let ok = mk(Priority::Default);
        let stuck = mk(Priority::Default);
        stuck.unresolved_deps.store(1, Ordering::Release);

        q.push(Arc::clone(&ok));
        q.push(Arc::clone(&stuck));

        let dropped = q.lock().filter_runnable();
        assert_eq!(dropped.len(), 1);
        assert!(Arc::ptr_eq(&dropped[0], &stuck));
        assert_eq!(q.len(), 1);
    }
}
