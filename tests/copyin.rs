//! Copy-in materialization on a single unit: user-provided and pooled
//! destination buffers, GET and SENDRECV flavors.

mod common;

use common::init_tracing;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use weft::{
    CopyinImpl, CreateFlags, DepDescriptor, GlobalPtr, Priority, Runtime, SegmentId, UnitId,
};

const MAGIC: u64 = 0xFEED_F00D;

fn seeded_runtime(impl_: CopyinImpl) -> (Runtime, Vec<u8>) {
    init_tracing();
    let rt = Runtime::builder()
        .num_threads(2)
        .copyin_impl(impl_)
        .build()
        .unwrap();
    let mut seg = vec![0u8; 64];
    seg[16..24].copy_from_slice(&MAGIC.to_ne_bytes());
    rt.register_segment(SegmentId(2), seg.as_mut_ptr(), seg.len())
        .unwrap();
    (rt, seg)
}

fn src_ptr() -> GlobalPtr {
    GlobalPtr::new(SegmentId(2), UnitId(0), 16)
}

#[test]
fn copyin_get_into_user_buffer() {
    let (rt, _seg) = seeded_runtime(CopyinImpl::Get);
    let mut dest = [0u8; 8];

    rt.create_task(
        || {},
        &[DepDescriptor::copyin(src_ptr(), 8, Some(dest.as_mut_ptr()))],
        Priority::Default,
        CreateFlags::empty(),
        "consumer",
    )
    .unwrap();

    rt.task_complete(true).unwrap();
    assert_eq!(u64::from_ne_bytes(dest), MAGIC);
    rt.shutdown().unwrap();
}

#[test]
fn copyin_pooled_buffer_via_copyin_dest() {
    let (rt, _seg) = seeded_runtime(CopyinImpl::Get);
    let seen = Arc::new(AtomicU64::new(0));

    {
        let seen = Arc::clone(&seen);
        rt.create_task(
            move || {
                let ptr = weft::copyin_dest(0).unwrap();
                let value = unsafe { (ptr as *const u64).read_unaligned() };
                seen.store(value, Ordering::SeqCst);
            },
            &[DepDescriptor::copyin(src_ptr(), 8, None)],
            Priority::Default,
            CreateFlags::empty(),
            "consumer",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), MAGIC);
    rt.shutdown().unwrap();
}

#[test]
fn copyin_sendrecv_degrades_to_local_copy() {
    let (rt, _seg) = seeded_runtime(CopyinImpl::SendRecv);
    let mut dest = [0u8; 8];

    rt.create_task(
        || {},
        &[DepDescriptor::copyin(src_ptr(), 8, Some(dest.as_mut_ptr()))],
        Priority::Default,
        CreateFlags::empty(),
        "consumer",
    )
    .unwrap();

    rt.task_complete(true).unwrap();
    assert_eq!(u64::from_ne_bytes(dest), MAGIC);
    rt.shutdown().unwrap();
}

#[test]
fn copyin_reuse_shares_one_prefetch() {
    let (rt, _seg) = seeded_runtime(CopyinImpl::Get);
    let seen = Arc::new(AtomicU64::new(0));

    // Two consumers of the same element: the second binds to the first
    // prefetch instead of fetching again.
    for _ in 0..2 {
        let seen = Arc::clone(&seen);
        rt.create_task(
            move || {
                let ptr = weft::copyin_dest(0).unwrap();
                let value = unsafe { (ptr as *const u64).read_unaligned() };
                seen.fetch_add(value, Ordering::SeqCst);
            },
            &[DepDescriptor::copyin_reuse(src_ptr(), 8, None)],
            Priority::Default,
            CreateFlags::empty(),
            "consumer",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2 * MAGIC);
    rt.shutdown().unwrap();
}

#[test]
fn copyin_wait_modes_all_deliver() {
    for wait in [
        weft::CopyinWait::Block,
        weft::CopyinWait::Detach,
        weft::CopyinWait::DetachInline,
        weft::CopyinWait::Yield,
    ] {
        init_tracing();
        let rt = Runtime::builder()
            .num_threads(2)
            .copyin_impl(CopyinImpl::Get)
            .copyin_wait(wait)
            .build()
            .unwrap();
        let mut seg = vec![0u8; 64];
        seg[16..24].copy_from_slice(&MAGIC.to_ne_bytes());
        rt.register_segment(SegmentId(2), seg.as_mut_ptr(), seg.len())
            .unwrap();

        let mut dest = [0u8; 8];
        rt.create_task(
            || {},
            &[DepDescriptor::copyin(src_ptr(), 8, Some(dest.as_mut_ptr()))],
            Priority::Default,
            CreateFlags::empty(),
            "consumer",
        )
        .unwrap();

        rt.task_complete(true).unwrap();
        assert_eq!(u64::from_ne_bytes(dest), MAGIC, "wait mode {wait:?}");
        rt.shutdown().unwrap();
    }
}
