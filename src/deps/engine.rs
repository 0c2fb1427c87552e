//! Dependency classification, local linking, remote fan-out and
//! release-on-completion.
//!
//! Within one parent, classification runs on the creating thread in
//! creation order; the parent's dephash linearizes accesses per
//! (segment, offset). Successor chains hang off predecessor entries and
//! are drained when the predecessor finishes. Dependencies on remote
//! memory fan out as in-dep requests; the owning unit confirms ordering
//! with a release message once its producer completed.

use crate::deps::hash::DepKey;
use crate::deps::{DepDescriptor, DepEntry, DepKind, RemoteSucc};
use crate::gptr::{GlobalPtr, UnitId};
use crate::phase::Phase;
use crate::remote::Message;
use crate::task::{TaskHandle, TaskQueue, TaskState};
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::runtime::RuntimeInner;

/// A `DelayedIn` gate: one unresolved count held until the phase becomes
/// runnable.
#[derive(Debug)]
struct DelayedRelease {
    task: TaskHandle,
    instance: u64,
    phase: Phase,
}

/// An inbound in-dep request that found no producer yet; retried during
/// matching.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteInDep {
    pub(crate) gptr: GlobalPtr,
    pub(crate) phase: Phase,
    pub(crate) origin: UnitId,
    pub(crate) origin_ref: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DepEngine {
    /// Tasks held in `Deferred` until their phase becomes runnable.
    pub(crate) deferred_local: TaskQueue,

    delayed_releases: Mutex<Vec<DelayedRelease>>,

    unhandled_remote: Mutex<Vec<RemoteInDep>>,

    /// Local tasks awaiting a remote release, keyed by the reference we
    /// put on the wire.
    pending_remote: Mutex<Slab<TaskHandle>>,
}

impl DepEngine {
    /// Classifies `deps` for a freshly created task, linking it into the
    /// parent's dephash chains. Runs on the creating thread before the
    /// task transitions to `Created`.
    pub(crate) fn handle_task(
        &self,
        rt: &RuntimeInner,
        task: &TaskHandle,
        deps: &[DepDescriptor],
    ) {
        for dep in deps {
            let phase = if dep.phase.is_any() {
                task.phase()
            } else {
                dep.phase
            };

            match dep.kind {
                DepKind::In => self.handle_input(rt, task, dep.gptr, DepKind::In, phase),
                DepKind::DelayedIn => {
                    self.handle_input(rt, task, dep.gptr, DepKind::DelayedIn, phase);
                    if !rt.phases().is_runnable(phase) {
                        task.unresolved_deps.fetch_add(1, Ordering::AcqRel);
                        self.delayed_releases.lock().push(DelayedRelease {
                            task: Arc::clone(task),
                            instance: task.instance(),
                            phase,
                        });
                        tracing::trace!(task = task.descr(), phase = phase.0, "release delayed");
                    }
                }
                DepKind::Out | DepKind::InOut | DepKind::CopyinOut => {
                    self.handle_output(task, dep.gptr, dep.kind, phase, dep.copyin);
                }
                DepKind::Copyin | DepKind::CopyinR => {
                    crate::copyin::handle_copyin_dep(rt, self, task, dep, phase);
                }
                DepKind::Direct => self.handle_direct(task, dep),
            }
        }

        if rt.num_units() > 1 {
            rt.amsgq().flush(rt);
        }
    }

    /// `In`-style classification: bind to the latest producer (RAW) or
    /// fan out to the owning unit.
    fn handle_input(
        &self,
        rt: &RuntimeInner,
        task: &TaskHandle,
        gptr: GlobalPtr,
        kind: DepKind,
        phase: Phase,
    ) {
        let parent = task.parent().expect("task without parent");
        let key = gptr.dep_key();
        let entry = DepEntry::new(kind, phase, gptr, task);
        task.deps_owned.lock().push(Arc::clone(&entry));

        let producer = {
            let mut hash = parent.dephash.lock();
            let bucket = hash.bucket_mut(key);
            bucket.readers.push(entry);
            bucket.latest_producer.clone()
        };

        if let Some(prod) = producer {
            if self.link_predecessor(task, &prod) {
                tracing::trace!(task = task.descr(), %gptr, "RAW edge");
            }
        } else if self.is_remote(rt, gptr) {
            self.request_remote(rt, task, gptr, phase);
        }
        // No producer and local memory: satisfied immediately.
    }

    /// `Out`-style classification: order after outstanding readers (WAR)
    /// or, when none, the previous producer (WAW); then supplant it.
    pub(crate) fn handle_output(
        &self,
        task: &TaskHandle,
        gptr: GlobalPtr,
        kind: DepKind,
        phase: Phase,
        copyin: Option<crate::deps::CopyinDesc>,
    ) -> Arc<DepEntry> {
        let parent = task.parent().expect("task without parent");
        let key: DepKey = gptr.dep_key();
        let entry = DepEntry::new(kind, phase, gptr, task);
        if let Some(ci) = copyin {
            let mut info = entry.copyin.lock();
            info.size = ci.size;
            info.dest = ci.dest.map(crate::deps::DestPtr);
        }
        task.deps_owned.lock().push(Arc::clone(&entry));

        let (prev, readers) = {
            let mut hash = parent.dephash.lock();
            let bucket = hash.bucket_mut(key);
            (bucket.latest_producer.clone(), bucket.readers.clone())
        };

        let mut war_edges = 0;
        for reader in &readers {
            if self.link_predecessor(task, reader) {
                war_edges += 1;
            }
        }
        if war_edges > 0 {
            tracing::trace!(task = task.descr(), %gptr, war_edges, "WAR edges");
        } else if let Some(prev) = prev {
            if self.link_predecessor(task, &prev) {
                tracing::trace!(task = task.descr(), %gptr, "WAW edge");
            }
        }

        {
            let mut hash = parent.dephash.lock();
            hash.bucket_mut(key).install_producer(Arc::clone(&entry));
        }

        entry
    }

    fn handle_direct(&self, task: &TaskHandle, dep: &DepDescriptor) {
        let Some(pred) = dep.task.as_ref() else {
            tracing::warn!("direct dependency without a task reference");
            return;
        };
        if !pred.is_current() {
            return;
        }

        let prod = &pred.task;
        if Arc::ptr_eq(prod, task) {
            return;
        }
        let _guard = prod.lock();
        if pred.task.instance() != pred.instance {
            return;
        }
        match prod.state() {
            TaskState::Finished | TaskState::Destroyed => {}
            _ => {
                task.unresolved_deps.fetch_add(1, Ordering::AcqRel);
                prod.direct_successors.lock().push(Arc::clone(task));
            }
        }
    }

    /// Registers `succ` on the predecessor entry unless the predecessor
    /// already finished (or its record was recycled). Returns whether an
    /// edge was created.
    pub(crate) fn link_predecessor(&self, succ: &TaskHandle, entry: &Arc<DepEntry>) -> bool {
        let Some(owner) = entry.owner() else {
            return false;
        };
        if Arc::ptr_eq(&owner, succ) {
            return false;
        }

        let _guard = owner.lock();
        if owner.instance() != entry.task_instance {
            return false;
        }
        match owner.state() {
            TaskState::Finished | TaskState::Destroyed => false,
            // A cancelled predecessor keeps its successors unreleased;
            // they never execute and fall to the cancellation drain.
            _ => {
                succ.unresolved_deps.fetch_add(1, Ordering::AcqRel);
                entry.successors.lock().local.push(Arc::clone(succ));
                true
            }
        }
    }

    fn is_remote(&self, rt: &RuntimeInner, gptr: GlobalPtr) -> bool {
        !gptr.segment.is_local() && gptr.unit != rt.my_unit() && rt.num_units() > 1
    }

    fn request_remote(&self, rt: &RuntimeInner, task: &TaskHandle, gptr: GlobalPtr, phase: Phase) {
        task.unresolved_remote_deps.fetch_add(1, Ordering::AcqRel);
        let origin_ref = self.pending_remote.lock().insert(Arc::clone(task)) as u64;
        tracing::debug!(task = task.descr(), %gptr, phase = phase.0, origin_ref, "remote in-dep");
        rt.amsgq().post(
            rt,
            gptr.unit,
            &Message::RequestInDep {
                gptr,
                phase,
                origin: rt.my_unit(),
                origin_ref,
            },
        );
    }

    /// Walks the finished task's owned entries and direct successors,
    /// releasing everyone waiting on it. Must run after the state
    /// transitioned to `Finished` under the task lock.
    pub(crate) fn release_local_task(&self, rt: &RuntimeInner, task: &TaskHandle) {
        debug_assert!(
            matches!(task.state(), TaskState::Finished | TaskState::Cancelled),
            "releasing task in state {:?}",
            task.state()
        );

        let entries = task.deps_owned.lock().clone();
        let mut remote_released = 0usize;
        for entry in entries {
            let succ = std::mem::take(&mut *entry.successors.lock());
            for t in succ.local {
                self.resolve_local(rt, &t);
            }
            for RemoteSucc { unit, origin_ref } in succ.remote {
                remote_released += 1;
                rt.amsgq().post(rt, unit, &Message::ReleaseDep { origin_ref });
            }
        }

        let direct = std::mem::take(&mut *task.direct_successors.lock());
        for t in direct {
            self.resolve_local(rt, &t);
        }

        if remote_released > 0 {
            tracing::debug!(task = task.descr(), remote_released, "released remote successors");
            rt.amsgq().flush(rt);
        }
    }

    /// One local dependency of `task` resolved.
    pub(crate) fn resolve_local(&self, rt: &RuntimeInner, task: &TaskHandle) {
        let prev = task.unresolved_deps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unresolved_deps underflow on {}", task.descr());
        if prev == 1 && task.unresolved_remote_deps.load(Ordering::Acquire) == 0 {
            rt.enqueue_runnable(task);
        }
    }

    /// Handler: a unit asks to order after our latest producer of `gptr`
    /// before `phase`.
    pub(crate) fn handle_remote_indep(&self, rt: &RuntimeInner, req: RemoteInDep) {
        if !self.try_match_remote(rt, &req) {
            tracing::debug!(gptr = %req.gptr, phase = req.phase.0, "in-dep deferred");
            self.unhandled_remote.lock().push(req);
        }
    }

    /// True when the request was linked or released; false defers it to
    /// the next matching.
    fn try_match_remote(&self, rt: &RuntimeInner, req: &RemoteInDep) -> bool {
        let entry = {
            let hash = rt.root().dephash.lock();
            hash.bucket(&req.gptr.dep_key())
                .and_then(|b| b.producer_before(req.phase))
                .cloned()
        };

        let Some(entry) = entry else {
            return false;
        };

        let release_now = match entry.owner() {
            Some(owner) => {
                let _guard = owner.lock();
                if owner.instance() != entry.task_instance {
                    true
                } else {
                    match owner.state() {
                        TaskState::Finished | TaskState::Destroyed => true,
                        _ => {
                            entry.successors.lock().remote.push(RemoteSucc {
                                unit: req.origin,
                                origin_ref: req.origin_ref,
                            });
                            false
                        }
                    }
                }
            }
            None => true,
        };

        if release_now {
            rt.amsgq().post(
                rt,
                req.origin,
                &Message::ReleaseDep {
                    origin_ref: req.origin_ref,
                },
            );
        }
        true
    }

    /// Handler: a remote producer confirmed ordering for `origin_ref`.
    pub(crate) fn handle_remote_release(&self, rt: &RuntimeInner, origin_ref: u64) {
        let Some(task) = self.pending_remote.lock().try_remove(origin_ref as usize) else {
            tracing::warn!(origin_ref, "release for unknown remote dependency");
            return;
        };

        let prev = task.unresolved_remote_deps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unresolved_remote_deps underflow");
        tracing::debug!(task = task.descr(), origin_ref, remaining = prev - 1, "remote release");
        if prev == 1 && task.unresolved_deps.load(Ordering::Acquire) == 0 {
            rt.enqueue_runnable(&task);
        }
    }

    /// Matching at `phase`: retries deferred remote requests. Requests
    /// whose producers can all exist by now but still match nothing are
    /// released as vacuous; later-phase requests stay deferred.
    pub(crate) fn handle_deferred_remote(&self, rt: &RuntimeInner, phase: Phase) {
        let deferred = std::mem::take(&mut *self.unhandled_remote.lock());
        if deferred.is_empty() {
            return;
        }
        tracing::debug!(count = deferred.len(), phase = phase.0, "re-matching deferred in-deps");

        let mut keep = Vec::new();
        for req in deferred {
            if self.try_match_remote(rt, &req) {
                continue;
            }
            if req.phase.0 <= phase.0 + 1 {
                // Every producer that could precede it exists; the
                // dependency is vacuous.
                rt.amsgq().post(
                    rt,
                    req.origin,
                    &Message::ReleaseDep {
                        origin_ref: req.origin_ref,
                    },
                );
            } else {
                keep.push(req);
            }
        }
        self.unhandled_remote.lock().extend(keep);
        rt.amsgq().flush(rt);
    }

    /// Releases `DelayedIn` gates and deferred tasks covered by the
    /// runnable watermark.
    pub(crate) fn handle_deferred_local(&self, rt: &RuntimeInner) {
        // Delayed release gates first: they may make deferred tasks
        // runnable.
        let gates = std::mem::take(&mut *self.delayed_releases.lock());
        for gate in gates {
            if !rt.phases().is_runnable(gate.phase) {
                self.delayed_releases.lock().push(gate);
                continue;
            }
            if gate.task.instance() == gate.instance {
                self.resolve_local(rt, &gate.task);
            }
        }

        // Then the deferred task queue.
        let mut still_deferred = Vec::new();
        loop {
            let Some(task) = self.deferred_local.pop() else {
                break;
            };
            if !rt.phases().is_runnable(task.phase()) {
                still_deferred.push(task);
                continue;
            }
            {
                let _guard = task.lock();
                if task.state() == TaskState::Deferred {
                    task.set_state(TaskState::Created);
                } else {
                    continue;
                }
            }
            tracing::trace!(task = task.descr(), phase = task.phase().0, "deferred task released");
            rt.enqueue_runnable(&task);
        }
        for task in still_deferred {
            self.deferred_local.pushback(task);
        }
    }

    /// Quiescence check at shutdown.
    pub(crate) fn assert_quiescent(&self) {
        let pending = self.pending_remote.lock().len();
        let unhandled = self.unhandled_remote.lock().len();
        let deferred = self.deferred_local.len();
        assert!(
            pending == 0 && unhandled == 0 && deferred == 0,
            "FATAL: dependency engine not quiescent at shutdown \
             (pending_remote={pending}, unhandled_remote={unhandled}, deferred={deferred})"
        );
    }
}
