//! Single-unit scheduling behavior: dependency ordering, suspension,
//! cancellation and task references.

mod common;

use common::init_tracing;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use weft::{
    CreateFlags, DepDescriptor, GlobalPtr, Priority, Runtime, SegmentId, UnitId,
};

fn runtime(threads: usize) -> (Runtime, Vec<u8>) {
    init_tracing();
    let rt = Runtime::builder().num_threads(threads).build().unwrap();
    // Ordering keys for dependency tests live in one registered segment.
    let mut seg = vec![0u8; 4096];
    rt.register_segment(SegmentId(1), seg.as_mut_ptr(), seg.len())
        .unwrap();
    (rt, seg)
}

fn key(off: u64) -> GlobalPtr {
    GlobalPtr::new(SegmentId(1), UnitId(0), off)
}

#[test]
fn zero_dependency_task_runs() {
    let (rt, _seg) = runtime(2);
    let ran = Arc::new(AtomicBool::new(false));

    {
        let ran = Arc::clone(&ran);
        rt.create_task(
            move || ran.store(true, Ordering::SeqCst),
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "nodeps",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert!(ran.load(Ordering::SeqCst));
    rt.shutdown().unwrap();
}

#[test]
fn raw_chain_orders_producer_before_consumer() {
    let (rt, _seg) = runtime(3);
    let value = Arc::new(AtomicU64::new(0));
    let observed = Arc::new(AtomicU64::new(0));

    {
        let value = Arc::clone(&value);
        rt.create_task(
            move || {
                std::thread::sleep(Duration::from_millis(5));
                value.store(42, Ordering::SeqCst);
            },
            &[DepDescriptor::output(key(0))],
            Priority::Default,
            CreateFlags::empty(),
            "producer",
        )
        .unwrap();
    }
    {
        let value = Arc::clone(&value);
        let observed = Arc::clone(&observed);
        rt.create_task(
            move || observed.store(value.load(Ordering::SeqCst), Ordering::SeqCst),
            &[DepDescriptor::input(key(0))],
            Priority::Default,
            CreateFlags::empty(),
            "consumer",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 42);
    rt.shutdown().unwrap();
}

#[test]
fn diamond_joins_after_both_branches() {
    let (rt, _seg) = runtime(3);
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let record = |name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>| {
        let log = Arc::clone(log);
        move || log.lock().push(name)
    };

    rt.create_task(
        record("P", &log),
        &[DepDescriptor::output(key(0))],
        Priority::Default,
        CreateFlags::empty(),
        "P",
    )
    .unwrap();
    rt.create_task(
        record("C1", &log),
        &[DepDescriptor::input(key(0)), DepDescriptor::output(key(8))],
        Priority::Default,
        CreateFlags::empty(),
        "C1",
    )
    .unwrap();
    rt.create_task(
        record("C2", &log),
        &[DepDescriptor::input(key(0)), DepDescriptor::output(key(16))],
        Priority::Default,
        CreateFlags::empty(),
        "C2",
    )
    .unwrap();
    rt.create_task(
        record("J", &log),
        &[DepDescriptor::input(key(8)), DepDescriptor::input(key(16))],
        Priority::Default,
        CreateFlags::empty(),
        "J",
    )
    .unwrap();

    rt.task_complete(true).unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 4);
    assert_eq!(log[0], "P");
    assert_eq!(log[3], "J");
    rt.shutdown().unwrap();
}

#[test]
fn war_orders_readers_before_next_writer() {
    let (rt, _seg) = runtime(3);
    let value = Arc::new(AtomicU64::new(1));
    let reads = Arc::new(AtomicU64::new(0));

    for _ in 0..2 {
        let value = Arc::clone(&value);
        let reads = Arc::clone(&reads);
        rt.create_task(
            move || {
                std::thread::sleep(Duration::from_millis(2));
                reads.fetch_add(value.load(Ordering::SeqCst), Ordering::SeqCst);
            },
            &[DepDescriptor::input(key(0))],
            Priority::Default,
            CreateFlags::empty(),
            "reader",
        )
        .unwrap();
    }
    {
        let value = Arc::clone(&value);
        rt.create_task(
            move || value.store(100, Ordering::SeqCst),
            &[DepDescriptor::output(key(0))],
            Priority::Default,
            CreateFlags::empty(),
            "writer",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    // Both readers saw the old value: the writer waited for them.
    assert_eq!(reads.load(Ordering::SeqCst), 2);
    assert_eq!(value.load(Ordering::SeqCst), 100);
    rt.shutdown().unwrap();
}

#[test]
fn suspended_fiber_resumes_in_the_same_frame() {
    let (rt, _seg) = runtime(2);
    let first = Arc::new(AtomicU64::new(0));
    let second = Arc::new(AtomicU64::new(0));
    let gate = Arc::new(AtomicBool::new(false));

    {
        let first = Arc::clone(&first);
        let second = Arc::clone(&second);
        let gate = Arc::clone(&gate);
        rt.create_task(
            move || {
                // Frame-local state that must survive suspension.
                let marker = 0x5157u64;
                first.store(marker, Ordering::SeqCst);
                while !gate.load(Ordering::SeqCst) {
                    weft::yield_task(-1).unwrap();
                }
                second.store(marker + 1, Ordering::SeqCst);
            },
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "yielder",
        )
        .unwrap();
    }
    {
        let gate = Arc::clone(&gate);
        rt.create_task(
            move || gate.store(true, Ordering::SeqCst),
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "gate",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 0x5157);
    assert_eq!(second.load(Ordering::SeqCst), 0x5158);
    rt.shutdown().unwrap();
}

#[test]
fn hot_slot_overflow_falls_through_to_global_queue() {
    let (rt, _seg) = runtime(3);
    let count = Arc::new(AtomicUsize::new(0));
    const N: usize = 200;

    {
        let count = Arc::clone(&count);
        rt.create_task(
            move || {
                for _ in 0..N {
                    let count = Arc::clone(&count);
                    weft::create_task(
                        move || {
                            count.fetch_add(1, Ordering::SeqCst);
                        },
                        &[],
                        Priority::Default,
                        CreateFlags::empty(),
                        "burst",
                    )
                    .unwrap();
                }
            },
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "spawner",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), N);
    rt.shutdown().unwrap();
}

#[test]
fn yield_from_inline_task_is_rejected() {
    let (rt, _seg) = runtime(2);
    let result = Arc::new(Mutex::new(None));

    {
        let result = Arc::clone(&result);
        rt.create_task(
            move || {
                *result.lock() = Some(weft::yield_task(0));
            },
            &[],
            Priority::Default,
            CreateFlags::NOYIELD,
            "inline",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    let res = result.lock().take().expect("inline task did not run");
    assert!(matches!(res, Err(weft::Error::InvalidArgument(_))));
    rt.shutdown().unwrap();
}

#[test]
fn cancellation_aborts_running_task_and_skips_successors() {
    let (rt, _seg) = runtime(2);
    let started = Arc::new(AtomicBool::new(false));
    let successor_ran = Arc::new(AtomicBool::new(false));

    {
        let started = Arc::clone(&started);
        rt.create_task(
            move || {
                started.store(true, Ordering::SeqCst);
                loop {
                    // Aborts here once cancellation is requested.
                    let _ = weft::yield_task(-1);
                    std::hint::spin_loop();
                }
            },
            &[DepDescriptor::output(key(0))],
            Priority::Default,
            CreateFlags::empty(),
            "spinner",
        )
        .unwrap();
    }
    {
        let successor_ran = Arc::clone(&successor_ran);
        rt.create_task(
            move || successor_ran.store(true, Ordering::SeqCst),
            &[DepDescriptor::input(key(0))],
            Priority::Default,
            CreateFlags::empty(),
            "successor",
        )
        .unwrap();
    }

    while !started.load(Ordering::SeqCst) {
        std::hint::spin_loop();
    }
    rt.request_cancellation();

    rt.task_complete(true).unwrap();
    assert!(!successor_ran.load(Ordering::SeqCst));
    rt.shutdown().unwrap();
}

#[test]
fn taskref_wait_and_test() {
    let (rt, _seg) = runtime(2);
    let ran = Arc::new(AtomicBool::new(false));

    let r = {
        let ran = Arc::clone(&ran);
        rt.create_task_ref(
            move || {
                std::thread::sleep(Duration::from_millis(2));
                ran.store(true, Ordering::SeqCst);
            },
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "waited",
        )
        .unwrap()
    };

    rt.task_wait(r).unwrap();
    assert!(ran.load(Ordering::SeqCst));

    // test + free on a second task
    let r = rt
        .create_task_ref(
            || {},
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "tested",
        )
        .unwrap();
    while !rt.task_test(&r).unwrap() {
        std::hint::spin_loop();
    }
    rt.taskref_free(r).unwrap();

    rt.task_complete(true).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn direct_dependency_orders_tasks() {
    let (rt, _seg) = runtime(2);
    let log: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let log = Arc::clone(&log);
        rt.create_task_ref(
            move || {
                std::thread::sleep(Duration::from_millis(3));
                log.lock().push(1);
            },
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "first",
        )
        .unwrap()
    };
    {
        let log = Arc::clone(&log);
        rt.create_task(
            move || log.lock().push(2),
            &[DepDescriptor::direct(&first)],
            Priority::Default,
            CreateFlags::empty(),
            "second",
        )
        .unwrap();
    }
    rt.taskref_free(first).unwrap();

    rt.task_complete(true).unwrap();
    assert_eq!(*log.lock(), vec![1, 2]);
    rt.shutdown().unwrap();
}

#[test]
fn nested_children_complete_before_parent_finishes() {
    let (rt, _seg) = runtime(3);
    let count = Arc::new(AtomicUsize::new(0));
    let after_children = Arc::new(AtomicUsize::new(0));

    {
        let count = Arc::clone(&count);
        let after_children = Arc::clone(&after_children);
        rt.create_task(
            move || {
                for _ in 0..4 {
                    let count = Arc::clone(&count);
                    weft::create_task(
                        move || {
                            count.fetch_add(1, Ordering::SeqCst);
                        },
                        &[],
                        Priority::Default,
                        CreateFlags::empty(),
                        "grandchild",
                    )
                    .unwrap();
                }
                weft::task_complete(true).unwrap();
                after_children.store(count.load(Ordering::SeqCst), Ordering::SeqCst);
            },
            &[],
            Priority::Default,
            CreateFlags::empty(),
            "parent",
        )
        .unwrap();
    }

    rt.task_complete(true).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 4);
    // The explicit wait inside the parent saw all children done.
    assert_eq!(after_children.load(Ordering::SeqCst), 4);
    rt.shutdown().unwrap();
}

#[test]
fn utility_thread_gets_a_scheduler_binding() {
    let (rt, _seg) = runtime(2);
    let (tx, rx) = std::sync::mpsc::channel();

    rt.utility_thread(move || {
        // The binding makes runtime queries legal here.
        tx.send(weft::phase_current().is_ok()).unwrap();
    });

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    rt.task_complete(true).unwrap();
    rt.shutdown().unwrap();
}
