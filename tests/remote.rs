//! Cross-unit dependency handling over an in-process two-unit team.

mod common;

use common::{SendPtr, init_tracing};
use std::sync::Arc;
use std::thread;
use weft::{
    CopyinImpl, CreateFlags, DepDescriptor, GlobalPtr, LocalTeam, Priority, Runtime, SegmentId,
    UnitId,
};

const PRODUCED: u64 = 0xCAFE_BABE;

/// Runs `f` once per unit, each on its own thread with its own runtime.
fn run_pair<F>(f: F)
where
    F: Fn(usize, Arc<LocalTeam>) + Send + Sync + 'static,
{
    init_tracing();
    let f = Arc::new(f);
    let handles: Vec<_> = LocalTeam::split(2, 100)
        .into_iter()
        .enumerate()
        .map(|(unit, team)| {
            let f = Arc::clone(&f);
            thread::Builder::new()
                .name(format!("unit-{unit}"))
                .spawn(move || (*f)(unit, team))
                .unwrap()
        })
        .collect();

    for handle in handles {
        handle.join().expect("unit thread panicked");
    }
}

fn build(team: Arc<LocalTeam>, copyin: CopyinImpl) -> Runtime {
    Runtime::builder()
        .num_threads(2)
        .copyin_impl(copyin)
        .build_with_team(team)
        .unwrap()
}

#[test]
fn empty_completion_round_terminates() {
    run_pair(|_unit, team| {
        let rt = build(team, CopyinImpl::Get);
        rt.task_complete(false).unwrap();
        rt.shutdown().unwrap();
    });
}

fn cross_unit_copyin(copyin: CopyinImpl) {
    run_pair(move |unit, team| {
        let rt = build(team, copyin);

        let mut seg = vec![0u8; 64];
        rt.register_segment(SegmentId(1), seg.as_mut_ptr(), seg.len())
            .unwrap();
        let slot = GlobalPtr::new(SegmentId(1), UnitId(0), 16);

        if unit == 0 {
            // Unit 0 produces element 16..24 of its segment in phase 0.
            let cell = SendPtr(unsafe { seg.as_mut_ptr().add(16) });
            rt.create_task(
                move || {
                    let cell = cell;
                    unsafe { (cell.0 as *mut u64).write_unaligned(PRODUCED) }
                },
                &[DepDescriptor::output(slot)],
                Priority::Default,
                CreateFlags::empty(),
                "producer",
            )
            .unwrap();
        }

        rt.phase_advance();

        let mut dest = [0u8; 8];
        if unit == 1 {
            // Unit 1 consumes it in phase 1 through a copy-in.
            rt.create_task(
                || {},
                &[
                    DepDescriptor::copyin(slot, 8, Some(dest.as_mut_ptr())),
                    DepDescriptor::input(slot),
                ],
                Priority::Default,
                CreateFlags::empty(),
                "consumer",
            )
            .unwrap();
        }

        rt.task_complete(false).unwrap();

        if unit == 1 {
            assert_eq!(u64::from_ne_bytes(dest), PRODUCED);
        }

        rt.shutdown().unwrap();
        drop(seg);
    });
}

#[test]
fn cross_unit_raw_with_copyin_get() {
    cross_unit_copyin(CopyinImpl::Get);
}

#[test]
fn cross_unit_raw_with_copyin_sendrecv() {
    cross_unit_copyin(CopyinImpl::SendRecv);
}

#[test]
fn remote_in_dep_without_copyin_orders_across_units() {
    use weft::Team;

    run_pair(|unit, team| {
        let fabric = Arc::clone(&team);
        let rt = build(team, CopyinImpl::Get);

        let mut seg = vec![0u64; 8];
        rt.register_segment(SegmentId(1), seg.as_mut_ptr().cast(), 64)
            .unwrap();
        let slot = GlobalPtr::new(SegmentId(1), UnitId(0), 0);

        if unit == 0 {
            let cell = SendPtr(seg.as_mut_ptr().cast());
            rt.create_task(
                move || {
                    let cell = cell;
                    unsafe { (cell.0 as *mut u64).write(7) }
                },
                &[DepDescriptor::output(slot)],
                Priority::Default,
                CreateFlags::empty(),
                "producer",
            )
            .unwrap();
        }

        rt.phase_advance();

        let observed = Arc::new(std::sync::atomic::AtomicU64::new(0));
        if unit == 1 {
            // A one-sided read after the remote ordering point.
            let observed = Arc::clone(&observed);
            rt.create_task(
                move || {
                    let mut buf = [0u8; 8];
                    let handle = unsafe { fabric.get(slot, buf.as_mut_ptr(), 8) }.unwrap();
                    assert!(handle.test());
                    observed.store(
                        u64::from_ne_bytes(buf),
                        std::sync::atomic::Ordering::SeqCst,
                    );
                },
                &[DepDescriptor::input(slot)],
                Priority::Default,
                CreateFlags::empty(),
                "reader",
            )
            .unwrap();
        }

        rt.task_complete(false).unwrap();
        if unit == 1 {
            assert_eq!(observed.load(std::sync::atomic::Ordering::SeqCst), 7);
        }
        rt.shutdown().unwrap();
        drop(seg);
    });
}

#[test]
fn solo_team_local_and_global_completion_are_equivalent() {
    init_tracing();
    let rt = Runtime::builder().num_threads(2).build().unwrap();
    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..8 {
        let count = Arc::clone(&count);
        rt.create_task(
            move || {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "work",
        )
        .unwrap();
    }

    // On a single unit the transport is never engaged; the global form
    // behaves exactly like the local one.
    rt.task_complete(false).unwrap();
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 8);
    rt.shutdown().unwrap();
}
