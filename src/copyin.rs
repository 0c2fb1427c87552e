//! Copy-in prefetch tasks.
//!
//! A `Copyin` dependency materializes a remote read into a local buffer
//! before the consuming task runs. Two implementations exist: `GET`
//! creates a prefetch task performing a one-sided get; `SENDRECV` sends
//! a prefetch request to the producing unit, which answers with a send
//! task ordered by a delayed input in the requested phase, matched to a
//! local receive task by tag.
//!
//! Destination buffers come from a size-classed pool when the caller
//! provides none; a destructor attached to the dephash entry returns
//! them at retirement.

use crate::config::CopyinWait;
use crate::deps::engine::DepEngine;
use crate::deps::{CopyinDesc, DepDescriptor, DepEntry, DepKind, DestPtr};
use crate::gptr::{GlobalPtr, UnitId};
use crate::phase::Phase;
use crate::remote::Message;
use crate::runtime::{self, RuntimeInner};
use crate::task::{CreateFlags, Priority, TaskHandle};
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

const MEMPOOL_MAGIC: u64 = 0xDEAD_BEEF_0000_0001;

/// A pooled copy-in destination buffer.
pub(crate) struct PoolBuffer {
    magic: u64,
    data: Box<[u8]>,
}

impl PoolBuffer {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

/// Size-classed free lists for copy-in destinations. Buffers are never
/// shrunk; each exact size gets its own class, as transfer sizes repeat
/// across iterations.
pub(crate) struct CopyinPool {
    classes: DashMap<usize, Arc<SegQueue<PoolBuffer>>>,
}

impl CopyinPool {
    fn new() -> Arc<CopyinPool> {
        Arc::new(CopyinPool {
            classes: DashMap::new(),
        })
    }

    pub(crate) fn allocate(&self, size: usize) -> PoolBuffer {
        let class = self
            .classes
            .entry(size)
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .clone();
        class.pop().unwrap_or_else(|| PoolBuffer {
            magic: MEMPOOL_MAGIC,
            data: vec![0u8; size].into_boxed_slice(),
        })
    }

    pub(crate) fn release(&self, buf: PoolBuffer) {
        assert_eq!(
            buf.magic, MEMPOOL_MAGIC,
            "FATAL: corrupt copy-in pool buffer detected"
        );
        let class = self
            .classes
            .entry(buf.data.len())
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .clone();
        class.push(buf);
    }
}

/// A producer-side send task parked until matching.
#[derive(Debug, Clone, Copy)]
struct DelayedSend {
    src: GlobalPtr,
    nbytes: usize,
    target: UnitId,
    tag: i32,
    phase: Phase,
}

/// Per-runtime copy-in state.
pub(crate) struct CopyinState {
    pub(crate) pool: Arc<CopyinPool>,
    delayed_sends: Mutex<Vec<DelayedSend>>,
    next_tag: AtomicI32,
}

impl CopyinState {
    pub(crate) fn new() -> CopyinState {
        CopyinState {
            pool: CopyinPool::new(),
            delayed_sends: Mutex::new(Vec::new()),
            next_tag: AtomicI32::new(1),
        }
    }
}

/// Entry point from the dependency engine for `Copyin`/`CopyinR`
/// descriptors of `consumer`.
pub(crate) fn handle_copyin_dep(
    rt: &RuntimeInner,
    engine: &DepEngine,
    consumer: &TaskHandle,
    dep: &DepDescriptor,
    phase: Phase,
) {
    let Some(ci) = dep.copyin else {
        tracing::warn!(task = consumer.descr(), "copy-in dependency without parameters");
        return;
    };
    let parent = consumer.parent().expect("task without parent");
    let key = dep.gptr.dep_key();

    // CopyinR reuses an already materialized buffer for the same source.
    if dep.kind == DepKind::CopyinR {
        let existing = {
            let hash = parent.dephash.lock();
            hash.bucket(&key)
                .and_then(|b| b.latest_producer.clone())
                .filter(|e| e.kind == DepKind::CopyinOut && e.copyin.lock().size == ci.size)
        };
        if let Some(out_entry) = existing {
            tracing::trace!(gptr = %dep.gptr, "copy-in reuses materialized buffer");
            bind_consumer(engine, consumer, dep, phase, out_entry);
            return;
        }
    }

    match rt.cfg().copyin_impl {
        crate::config::CopyinImpl::Get => create_get_task(rt, dep.gptr, phase, ci),
        crate::config::CopyinImpl::SendRecv => create_sendrecv_task(rt, dep.gptr, phase, ci),
    }

    // The prefetch task installed a CopyinOut producer at the source key.
    let out_entry = {
        let hash = parent.dephash.lock();
        hash.bucket(&key).and_then(|b| b.latest_producer.clone())
    };
    match out_entry {
        Some(e) if e.kind == DepKind::CopyinOut => bind_consumer(engine, consumer, dep, phase, e),
        _ => tracing::warn!(gptr = %dep.gptr, "prefetch task left no CopyinOut producer"),
    }
}

/// Creates the consumer-side entry, binds it to the materializing
/// `CopyinOut` entry and orders the consumer after the prefetch (RAW).
fn bind_consumer(
    engine: &DepEngine,
    consumer: &TaskHandle,
    dep: &DepDescriptor,
    phase: Phase,
    out_entry: Arc<DepEntry>,
) {
    let parent = consumer.parent().expect("task without parent");
    let entry = DepEntry::new(dep.kind, phase, dep.gptr, consumer);
    *entry.bound.lock() = Some(Arc::clone(&out_entry));
    consumer.deps_owned.lock().push(Arc::clone(&entry));
    parent
        .dephash
        .lock()
        .bucket_mut(dep.gptr.dep_key())
        .readers
        .push(entry);

    engine.link_predecessor(consumer, &out_entry);
}

fn prefetch_flags(rt: &RuntimeInner) -> CreateFlags {
    if rt.cfg().copyin_wait == CopyinWait::DetachInline {
        CreateFlags::NOYIELD
    } else {
        CreateFlags::empty()
    }
}

fn create_get_task(rt: &RuntimeInner, src: GlobalPtr, phase: Phase, ci: CopyinDesc) {
    let mut deps: SmallVec<[DepDescriptor; 3]> = SmallVec::new();
    deps.push(DepDescriptor {
        kind: DepKind::In,
        phase,
        gptr: src,
        copyin: None,
        task: None,
    });
    deps.push(DepDescriptor {
        kind: DepKind::CopyinOut,
        phase,
        gptr: src,
        copyin: Some(ci),
        task: None,
    });
    if let Some(dest) = ci.dest {
        deps.push(DepDescriptor::output(GlobalPtr::local(rt.my_unit(), dest)));
    }

    let nbytes = ci.size;
    let created = rt.create_task_internal(
        Box::new(move || copyin_get_body(src, nbytes)),
        &deps,
        Priority::High,
        prefetch_flags(rt),
        "copyin (get)",
        true,
        false,
    );
    if let Err(e) = created {
        tracing::error!(error = %e, "failed to create copy-in get task");
    }
}

fn create_sendrecv_task(rt: &RuntimeInner, src: GlobalPtr, phase: Phase, ci: CopyinDesc) {
    let me = rt.my_unit();
    let mut local_src = None;
    let mut tag = 0;

    if src.unit != me && rt.num_units() > 1 {
        tag = rt.copyin().next_tag.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(%src, tag, phase = phase.0, "copy-in send request");
        rt.amsgq().post(
            rt,
            src.unit,
            &Message::SendRequest {
                gptr: src,
                nbytes: ci.size as u32,
                tag,
                phase,
                origin: me,
            },
        );
        rt.amsgq().flush(rt);
    } else {
        // Producer is this unit; degrade to a local copy.
        local_src = Some(src);
    }

    let mut deps: SmallVec<[DepDescriptor; 2]> = SmallVec::new();
    deps.push(DepDescriptor {
        kind: DepKind::CopyinOut,
        phase,
        gptr: src,
        copyin: Some(ci),
        task: None,
    });
    if let Some(dest) = ci.dest {
        deps.push(DepDescriptor::output(GlobalPtr::local(me, dest)));
    }

    let source_unit = src.unit;
    let nbytes = ci.size;
    let created = rt.create_task_internal(
        Box::new(move || copyin_recv_body(local_src, source_unit, tag, nbytes)),
        &deps,
        Priority::High,
        prefetch_flags(rt),
        "copyin (recv)",
        true,
        false,
    );
    if let Err(e) = created {
        tracing::error!(error = %e, "failed to create copy-in recv task");
    }
}

/// Handler for inbound [`Message::SendRequest`]s: task creation is
/// deferred to the matching step, where the named phase is released.
pub(crate) fn handle_send_request(
    rt: &RuntimeInner,
    src: GlobalPtr,
    nbytes: usize,
    tag: i32,
    phase: Phase,
    origin: UnitId,
) {
    tracing::debug!(%src, tag, phase = phase.0, %origin, "deferring copy-in send task");
    rt.copyin().delayed_sends.lock().push(DelayedSend {
        src,
        nbytes,
        target: origin,
        tag,
        phase,
    });
}

/// Creates the parked producer-side send tasks; called during matching.
pub(crate) fn create_delayed_send_tasks(rt: &RuntimeInner) {
    let parked = std::mem::take(&mut *rt.copyin().delayed_sends.lock());
    for ds in parked {
        tracing::debug!(src = %ds.src, tag = ds.tag, target = %ds.target, "creating copy-in send task");
        let deps = [DepDescriptor::delayed_input(ds.src, ds.phase)];
        let created = rt.create_task_internal(
            Box::new(move || copyin_send_body(ds.src, ds.target, ds.tag, ds.nbytes)),
            &deps,
            Priority::High,
            prefetch_flags(rt),
            "copyin (send)",
            true,
            false,
        );
        if let Err(e) = created {
            tracing::error!(error = %e, "failed to create copy-in send task");
        }
    }
}

/// Locates the running task's own `CopyinOut` entry, allocating the
/// destination from the pool when the caller provided none.
fn prepare_dest(rt: &RuntimeInner) -> (*mut u8, usize) {
    let task = runtime::context::current_thread().current_task();
    let entry = task
        .deps_owned
        .lock()
        .iter()
        .find(|e| e.kind == DepKind::CopyinOut)
        .cloned()
        .expect("copy-in task without CopyinOut dependency");

    let mut info = entry.copyin.lock();
    let size = info.size;
    if let Some(dest) = info.dest {
        return (dest.0, size);
    }

    let pool = Arc::clone(&rt.copyin().pool);
    let mut buf = pool.allocate(size);
    let ptr = buf.as_mut_ptr();
    info.dest = Some(DestPtr(ptr));
    info.dtor = Some(Box::new(move |info| {
        info.dest = None;
        pool.release(buf);
    }));
    (ptr, size)
}

fn copyin_get_body(src: GlobalPtr, nbytes: usize) {
    let rt = runtime::context::current_runtime();
    let (dest, size) = prepare_dest(&rt);
    debug_assert_eq!(size, nbytes);

    tracing::trace!(%src, nbytes, "copy-in get");
    match unsafe { rt.team().get(src, dest, nbytes) } {
        Ok(handle) => wait_for_handle(&rt, &handle),
        Err(e) => panic!("FATAL: copy-in get from {src} failed: {e}"),
    }
}

fn copyin_recv_body(local_src: Option<GlobalPtr>, source: UnitId, tag: i32, nbytes: usize) {
    let rt = runtime::context::current_runtime();
    let (dest, _) = prepare_dest(&rt);

    if let Some(src) = local_src {
        let base = rt
            .team()
            .local_base(src)
            .unwrap_or_else(|e| panic!("FATAL: copy-in source unresolved: {e}"));
        tracing::trace!(%src, nbytes, "copy-in local copy");
        unsafe { std::ptr::copy_nonoverlapping(base as *const u8, dest, nbytes) };
        return;
    }

    tracing::trace!(%source, tag, nbytes, "copy-in recv");
    match unsafe { rt.team().recv_tagged(source, tag, dest, nbytes) } {
        Ok(handle) => wait_for_handle(&rt, &handle),
        Err(e) => panic!("FATAL: copy-in recv (tag {tag}) failed: {e}"),
    }
}

fn copyin_send_body(src: GlobalPtr, target: UnitId, tag: i32, nbytes: usize) {
    let rt = runtime::context::current_runtime();
    let base = rt
        .team()
        .local_base(src)
        .unwrap_or_else(|e| panic!("FATAL: copy-in send source unresolved: {e}"));

    tracing::trace!(%target, tag, nbytes, "copy-in send");
    match unsafe { rt.team().send_tagged(target, tag, base as *const u8, nbytes) } {
        Ok(handle) => wait_for_handle(&rt, &handle),
        Err(e) => panic!("FATAL: copy-in send (tag {tag}) failed: {e}"),
    }
}

/// Wait discipline for the transfer handle, selected by configuration.
fn wait_for_handle(rt: &RuntimeInner, handle: &crate::remote::comm::TransferHandle) {
    match rt.cfg().copyin_wait {
        CopyinWait::Block => crate::runtime::wait::block_on_handle(handle),
        CopyinWait::Detach | CopyinWait::DetachInline => {
            crate::runtime::wait::detach_handle(handle)
        }
        CopyinWait::Yield => {
            // Lower the priority to overlap communication with
            // computation while test-yielding.
            let task = runtime::context::current_thread().current_task();
            task.set_prio(Priority::Low);
            while !handle.test() {
                if let Err(e) = crate::runtime::worker::yield_current(-1) {
                    tracing::warn!(error = %e, "copy-in yield failed, spinning");
                }
            }
            task.set_prio(Priority::High);
        }
    }
}

/// The materialized buffer of the running task's `depnum`-th copy-in
/// dependency, in declaration order.
pub(crate) fn copyin_info(task: &TaskHandle, depnum: usize) -> Option<*mut u8> {
    let deps = task.deps_owned.lock();
    let entry = deps
        .iter()
        .filter(|e| matches!(e.kind, DepKind::Copyin | DepKind::CopyinR))
        .nth(depnum)?;
    let bound = entry.bound.lock();
    let out = bound.as_ref()?;
    debug_assert_eq!(out.kind, DepKind::CopyinOut, "copy-in bound to a non-materializing entry");
    out.dest()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_by_size_class() {
        let pool = CopyinPool::new();
        let mut a = pool.allocate(64);
        let pa = a.as_mut_ptr();
        pool.release(a);

        let mut b = pool.allocate(64);
        assert_eq!(pa, b.as_mut_ptr());

        // A different size never aliases the first class.
        let mut c = pool.allocate(128);
        assert_ne!(pa, c.as_mut_ptr());
        assert_eq!(c.data.len(), 128);
        pool.release(b);
        pool.release(c);
    }

    #[test]
    #[should_panic(expected = "corrupt copy-in pool buffer")]
    fn pool_detects_corruption() {
        let pool = CopyinPool::new();
        let mut buf = pool.allocate(8);
        buf.magic = 0;
        pool.release(buf);
    }
}
