//! weft — a distributed task-parallel runtime core.
//!
//! A per-process work-stealing scheduler executes tasks whose order is
//! derived from declared data dependencies, including dependencies that
//! cross process boundaries. Tasks run on cooperative fibers and may
//! yield, block on transfers or detach; a phase watermark gates the
//! release of later-epoch work, and a round-based active-message engine
//! carries dependency traffic between units.
//!
//! ```no_run
//! use weft::{DepDescriptor, GlobalPtr, Priority, Runtime, SegmentId, UnitId};
//!
//! let rt = Runtime::builder().num_threads(4).build().unwrap();
//! let mut data = vec![0u64; 16];
//! rt.register_segment(SegmentId(1), data.as_mut_ptr().cast(), 16 * 8)
//!     .unwrap();
//!
//! let slot = GlobalPtr::new(SegmentId(1), UnitId(0), 0);
//! rt.create_task(
//!     || { /* produce */ },
//!     &[DepDescriptor::output(slot)],
//!     Priority::Default,
//!     Default::default(),
//!     "producer",
//! )
//! .unwrap();
//! rt.create_task(
//!     || { /* consume */ },
//!     &[DepDescriptor::input(slot)],
//!     Priority::Default,
//!     Default::default(),
//!     "consumer",
//! )
//! .unwrap();
//!
//! rt.task_complete(true).unwrap();
//! rt.shutdown().unwrap();
//! ```

mod config;
pub use config::{Builder, CopyinImpl, CopyinWait, IdlePolicy};

mod error;
pub use error::{Error, Result};

mod gptr;
pub use gptr::{GlobalPtr, SegmentId, TeamId, UnitId};

mod phase;
pub use phase::Phase;

mod fiber;

mod task;
pub use task::{CreateFlags, Priority, TaskRef, TaskState};

mod deps;
pub use deps::{CopyinDesc, DepDescriptor, DepKind};

mod remote;
pub use remote::comm::{CollectiveOp, LocalTeam, Team, TransferHandle};

mod copyin;

mod runtime;
pub use runtime::Runtime;

use runtime::context;

/// Yields the running task. `delay` selects the requeue placement:
/// 0 requeues at the front, negative values at the back, positive
/// values that many positions behind the front.
///
/// Illegal from inline tasks; a no-op when there is nothing to yield
/// to.
pub fn yield_task(delay: i32) -> Result<()> {
    runtime::worker::yield_current(delay)
}

/// Waits for the calling task's children from within a task body. See
/// [`Runtime::task_complete`].
pub fn task_complete(local_only: bool) -> Result<()> {
    let (rt, _) = context::try_current().ok_or(Error::InvalidArgument("not a runtime thread"))?;
    runtime::worker::task_complete(&rt, local_only)
}

/// Creates a child of the running task; the free-function form of
/// [`Runtime::create_task`] for use inside task bodies.
pub fn create_task<F>(
    body: F,
    deps: &[DepDescriptor],
    prio: Priority,
    flags: CreateFlags,
    descr: &'static str,
) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let (rt, _) = context::try_current().ok_or(Error::InvalidArgument("not a runtime thread"))?;
    rt.create_task_internal(Box::new(body), deps, prio, flags, descr, false, false)
        .map(|_| ())
}

/// The current phase of this unit.
pub fn phase_current() -> Result<Phase> {
    let (rt, _) = context::try_current().ok_or(Error::InvalidArgument("not a runtime thread"))?;
    Ok(rt.phases().current())
}

/// The materialized buffer of the running task's `depnum`-th copy-in
/// dependency, in declaration order. Only meaningful once the prefetch
/// predecessor released the task.
pub fn copyin_dest(depnum: usize) -> Result<*mut u8> {
    let (_, thread) =
        context::try_current().ok_or(Error::InvalidArgument("not a runtime thread"))?;
    let task = thread.current_task();
    copyin::copyin_info(&task, depnum).ok_or(Error::NotFound("no materialized copy-in buffer"))
}

/// True once cancellation was requested on this unit's runtime.
pub fn cancellation_requested() -> bool {
    context::try_current().is_some_and(|(rt, _)| rt.cancel().requested())
}
