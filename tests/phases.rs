//! Phase-gated release of deferred tasks.

mod common;

use common::init_tracing;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use weft::{CreateFlags, Phase, Priority, Runtime};

#[test]
fn phase_advance_is_monotonic() {
    init_tracing();
    let rt = Runtime::builder().num_threads(1).build().unwrap();

    assert_eq!(rt.phase_current(), Phase::FIRST);
    assert_eq!(rt.phase_advance(), Phase(1));
    assert_eq!(rt.phase_advance(), Phase(2));
    assert_eq!(rt.phase_current(), Phase(2));

    rt.shutdown().unwrap();
}

#[test]
fn later_phase_tasks_wait_for_matching() {
    init_tracing();
    let rt = Runtime::builder().num_threads(2).build().unwrap();

    let phase0_ran = Arc::new(AtomicBool::new(false));
    let phase1_ran = Arc::new(AtomicBool::new(false));

    {
        let phase0_ran = Arc::clone(&phase0_ran);
        rt.create_task(
            move || phase0_ran.store(true, Ordering::SeqCst),
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "epoch0",
        )
        .unwrap();
    }

    rt.phase_advance();

    {
        let phase1_ran = Arc::clone(&phase1_ran);
        rt.create_task(
            move || phase1_ran.store(true, Ordering::SeqCst),
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "epoch1",
        )
        .unwrap();
    }

    // The phase-0 task runs; the phase-1 task is deferred until the
    // completion call raises the watermark.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !phase0_ran.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "phase-0 task never ran");
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(20));
    assert!(
        !phase1_ran.load(Ordering::SeqCst),
        "phase-1 task ran before its phase became runnable"
    );

    rt.task_complete(true).unwrap();
    assert!(phase1_ran.load(Ordering::SeqCst));

    // The epoch reset rewinds the phase counter.
    assert_eq!(rt.phase_current(), Phase::FIRST);

    rt.shutdown().unwrap();
}

#[test]
fn tasks_inside_tasks_are_never_phase_gated() {
    init_tracing();
    let rt = Runtime::builder().num_threads(2).build().unwrap();
    let inner_ran = Arc::new(AtomicBool::new(false));

    rt.phase_advance();
    {
        let inner_ran = Arc::clone(&inner_ran);
        rt.create_task(
            move || {
                let inner_ran = Arc::clone(&inner_ran);
                // Non-root children carry no phase and run right away.
                weft::create_task(
                    move || inner_ran.store(true, Ordering::SeqCst),
                    &[],
                    Priority::Default,
                    CreateFlags::empty(),
                    "inner",
                )
                .unwrap();
                weft::task_complete(true).unwrap();
            },
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "outer",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert!(inner_ran.load(Ordering::SeqCst));
    rt.shutdown().unwrap();
}
