use crate::gptr::GlobalPtr;
use crate::phase::Phase;
use crate::task::{Task, TaskHandle, TaskRef};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub(crate) mod engine;
pub(crate) mod hash;

/// Dependency kinds accepted from the frontend, plus the internal
/// `CopyinOut` kind the prefetch machinery emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Read access; orders after the latest producer (RAW).
    In,
    /// Write access; supplants the previous producer (WAW) after all
    /// outstanding readers (WAR).
    Out,
    /// Read-modify-write; matched like `Out`.
    InOut,
    /// Materialize a remote read into a local buffer before the consumer
    /// runs.
    Copyin,
    /// Like `Copyin`, but an already materialized buffer for the same
    /// source in this phase is reused instead of fetched again.
    CopyinR,
    /// Read access whose release is withheld until the named phase is
    /// runnable.
    DelayedIn,
    /// Internal: output side of a prefetch task, keyed at the copy-in
    /// source so subsequent `In`s bind locally.
    CopyinOut,
    /// Order directly after a referenced task, no memory involved.
    Direct,
}

impl DepKind {
    pub(crate) fn is_output(self) -> bool {
        matches!(self, DepKind::Out | DepKind::InOut | DepKind::CopyinOut)
    }
}

/// Copy-in parameters of a descriptor: transfer size and an optional
/// caller-provided destination. Without a destination the runtime
/// allocates from the sized buffer pool and frees it at entry retirement.
#[derive(Debug, Clone, Copy)]
pub struct CopyinDesc {
    pub size: usize,
    pub dest: Option<*mut u8>,
}

/// A single dependency of a task under creation.
#[derive(Debug, Clone)]
pub struct DepDescriptor {
    pub kind: DepKind,
    /// Phase the dependency pertains to; [`Phase::ANY`] means "the
    /// creating task's phase".
    pub phase: Phase,
    pub gptr: GlobalPtr,
    pub copyin: Option<CopyinDesc>,
    /// Predecessor for [`DepKind::Direct`].
    pub task: Option<TaskRef>,
}

impl DepDescriptor {
    fn plain(kind: DepKind, gptr: GlobalPtr) -> DepDescriptor {
        DepDescriptor {
            kind,
            phase: Phase::ANY,
            gptr,
            copyin: None,
            task: None,
        }
    }

    pub fn input(gptr: GlobalPtr) -> DepDescriptor {
        Self::plain(DepKind::In, gptr)
    }

    pub fn output(gptr: GlobalPtr) -> DepDescriptor {
        Self::plain(DepKind::Out, gptr)
    }

    pub fn inout(gptr: GlobalPtr) -> DepDescriptor {
        Self::plain(DepKind::InOut, gptr)
    }

    pub fn copyin(gptr: GlobalPtr, size: usize, dest: Option<*mut u8>) -> DepDescriptor {
        DepDescriptor {
            copyin: Some(CopyinDesc { size, dest }),
            ..Self::plain(DepKind::Copyin, gptr)
        }
    }

    pub fn copyin_reuse(gptr: GlobalPtr, size: usize, dest: Option<*mut u8>) -> DepDescriptor {
        DepDescriptor {
            copyin: Some(CopyinDesc { size, dest }),
            ..Self::plain(DepKind::CopyinR, gptr)
        }
    }

    pub fn delayed_input(gptr: GlobalPtr, phase: Phase) -> DepDescriptor {
        DepDescriptor {
            phase,
            ..Self::plain(DepKind::DelayedIn, gptr)
        }
    }

    pub fn direct(predecessor: &TaskRef) -> DepDescriptor {
        DepDescriptor {
            task: Some(predecessor.clone()),
            ..Self::plain(DepKind::Direct, GlobalPtr::NULL)
        }
    }
}

/// Raw pointer that travels between threads; validity is guaranteed by
/// the copy-in protocol (buffer outlives the entry holding it).
#[derive(Debug, Clone, Copy)]
pub(crate) struct DestPtr(pub *mut u8);

unsafe impl Send for DestPtr {}

/// Mutable copy-in portion of an entry: the prefetch task fills in the
/// destination at run time when the caller provided none.
#[derive(Default)]
pub(crate) struct CopyinInfo {
    pub(crate) size: usize,
    pub(crate) dest: Option<DestPtr>,
    /// Runs at entry retirement; returns pooled buffers.
    pub(crate) dtor: Option<Box<dyn FnOnce(&mut CopyinInfo) + Send>>,
}

impl std::fmt::Debug for CopyinInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyinInfo")
            .field("size", &self.size)
            .field("dest", &self.dest)
            .field("has_dtor", &self.dtor.is_some())
            .finish()
    }
}

/// A remote successor recorded on a producer entry: the origin unit gets
/// a release message carrying its reference key once the producer
/// finishes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteSucc {
    pub(crate) unit: crate::gptr::UnitId,
    pub(crate) origin_ref: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Successors {
    pub(crate) local: Vec<TaskHandle>,
    pub(crate) remote: Vec<RemoteSucc>,
}

/// One outstanding access in a parent's dephash, owned by the task that
/// declared it. Successor chains hang off the entry and are drained when
/// the owning task completes.
pub(crate) struct DepEntry {
    pub(crate) kind: DepKind,
    pub(crate) phase: Phase,
    pub(crate) gptr: GlobalPtr,
    /// The declaring task. Weak: entries outlive their task inside the
    /// parent hash without keeping the record from recycling.
    pub(crate) task: Weak<Task>,
    /// Generation of the declaring task at entry creation; a mismatch
    /// means the record was recycled and this access is long finished.
    pub(crate) task_instance: u64,
    pub(crate) copyin: Mutex<CopyinInfo>,
    pub(crate) successors: Mutex<Successors>,
    /// For consumer `Copyin`/`CopyinR` entries: the `CopyinOut` entry of
    /// the prefetch task that materializes the data.
    pub(crate) bound: Mutex<Option<Arc<DepEntry>>>,
}

impl DepEntry {
    pub(crate) fn new(
        kind: DepKind,
        phase: Phase,
        gptr: GlobalPtr,
        task: &TaskHandle,
    ) -> Arc<DepEntry> {
        Arc::new(DepEntry {
            kind,
            phase,
            gptr,
            task: Arc::downgrade(task),
            task_instance: task.instance(),
            copyin: Mutex::new(CopyinInfo::default()),
            successors: Mutex::new(Successors::default()),
            bound: Mutex::new(None),
        })
    }

    pub(crate) fn owner(&self) -> Option<TaskHandle> {
        self.task.upgrade()
    }

    /// The materialized copy-in destination, once known.
    pub(crate) fn dest(&self) -> Option<*mut u8> {
        self.copyin.lock().dest.map(|p| p.0)
    }
}

impl Drop for DepEntry {
    fn drop(&mut self) {
        // Retirement: the attached destructor returns pooled buffers.
        let info = self.copyin.get_mut();
        if let Some(dtor) = info.dtor.take() {
            dtor(info);
        }
    }
}

impl std::fmt::Debug for DepEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepEntry")
            .field("kind", &self.kind)
            .field("phase", &self.phase.0)
            .field("gptr", &self.gptr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gptr::{SegmentId, UnitId};
    use static_assertions::assert_impl_all;

    assert_impl_all!(DepEntry: Send, Sync);

    #[test]
    fn dtor_runs_at_retirement() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let fired = Arc::new(AtomicBool::new(false));
        let task = Task::new_root();
        let entry = DepEntry::new(
            DepKind::CopyinOut,
            Phase(0),
            GlobalPtr::new(SegmentId(1), UnitId(0), 0),
            &task,
        );

        {
            let fired = Arc::clone(&fired);
            entry.copyin.lock().dtor = Some(Box::new(move |_| {
                fired.store(true, Ordering::SeqCst);
            }));
        }

        drop(entry);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn descriptor_constructors_pick_kinds() {
        let g = GlobalPtr::new(SegmentId(1), UnitId(0), 8);
        assert_eq!(DepDescriptor::input(g).kind, DepKind::In);
        assert_eq!(DepDescriptor::output(g).kind, DepKind::Out);
        assert!(DepDescriptor::output(g).kind.is_output());
        assert_eq!(DepDescriptor::copyin(g, 16, None).kind, DepKind::Copyin);
        assert_eq!(
            DepDescriptor::delayed_input(g, Phase(3)).phase,
            Phase(3)
        );
    }
}
