//! The communicator seam consumed by the active-message engine and the
//! copy-in machinery.
//!
//! The runtime is transport-agnostic: anything implementing [`Team`] can
//! carry it. [`LocalTeam`] connects N units inside one process over
//! bounded queues and shared segment records; it is the default
//! single-unit team and the vehicle for multi-unit integration tests.

use crate::error::Error;
use crate::gptr::{GlobalPtr, SegmentId, UnitId};
use anyhow::anyhow;
use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Completion handle of a one-sided get or a tagged send/recv. Cloned
/// freely; all clones observe the same completion.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    done: Arc<AtomicBool>,
}

impl TransferHandle {
    pub(crate) fn pending() -> TransferHandle {
        TransferHandle {
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn ready() -> TransferHandle {
        TransferHandle {
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn test(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// A non-blocking collective in flight. Obtained from
/// [`Team::begin_barrier`] or [`Team::begin_exchange`] and driven by
/// [`Team::poll_collective`].
#[derive(Debug)]
pub struct CollectiveOp {
    round: u64,
    is_exchange: bool,
    finished: bool,
    /// For exchanges: per-peer counts addressed to this unit.
    pub(crate) received: Option<Vec<i64>>,
}

/// Contract between the scheduler core and the process fabric.
///
/// The active-message plane moves opaque buffers; the data plane exists
/// solely for the copy-in machinery. The `unsafe` operations carry raw
/// pointers whose buffers must stay valid until the returned handle
/// completes.
pub trait Team: Send + Sync + 'static {
    fn my_unit(&self) -> UnitId;

    fn num_units(&self) -> usize;

    /// Delivers one buffer to `target`'s inbox. [`Error::Again`] when the
    /// target's pre-posted capacity is exhausted.
    fn try_send(&self, target: UnitId, payload: &[u8]) -> Result<(), Error>;

    /// Pulls one inbound buffer, with its source.
    fn try_recv(&self) -> Option<(UnitId, Vec<u8>)>;

    /// Begins a round-termination barrier (all units participate).
    fn begin_barrier(&self) -> CollectiveOp;

    /// Begins an all-to-all exchange of per-peer send counts.
    fn begin_exchange(&self, send_counts: &[i64]) -> CollectiveOp;

    /// Advances a collective; true once it completed everywhere.
    fn poll_collective(&self, op: &mut CollectiveOp) -> bool;

    /// Blocking barrier separating message rounds.
    fn barrier(&self);

    /// Publishes `[base, base+len)` as segment `segment` of this unit.
    fn register_segment(&self, segment: SegmentId, base: *mut u8, len: usize)
    -> Result<(), Error>;

    /// Resolves a pointer owned by this unit to a local address.
    fn local_base(&self, gptr: GlobalPtr) -> Result<*mut u8, Error>;

    /// One-sided read of `nbytes` at `src` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `nbytes` writes until the handle
    /// completes; the source segment must stay registered.
    unsafe fn get(
        &self,
        src: GlobalPtr,
        dst: *mut u8,
        nbytes: usize,
    ) -> Result<TransferHandle, Error>;

    /// Tagged point-to-point send, matched by `(source, tag)` on the
    /// receiving side.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `nbytes` reads until the handle completes.
    unsafe fn send_tagged(
        &self,
        target: UnitId,
        tag: i32,
        src: *const u8,
        nbytes: usize,
    ) -> Result<TransferHandle, Error>;

    /// Tagged point-to-point receive.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `nbytes` writes until the handle
    /// completes.
    unsafe fn recv_tagged(
        &self,
        source: UnitId,
        tag: i32,
        dst: *mut u8,
        nbytes: usize,
    ) -> Result<TransferHandle, Error>;
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    base: usize,
    len: usize,
}

/// One half of a tagged transfer waiting for its counterpart. Pointers
/// are stored as integers; validity is guaranteed by the outstanding
/// handle.
enum PendingXfer {
    Send {
        src: usize,
        len: usize,
        handle: TransferHandle,
    },
    Recv {
        dst: usize,
        len: usize,
        handle: TransferHandle,
    },
}

#[derive(Default)]
struct CollectiveState {
    /// Per-unit count of collectives begun; op `r` of every unit pairs
    /// up, so op `r` has completed once every unit is past it.
    entered: Vec<u64>,
    /// Exchange contributions per round, plus how many units already
    /// extracted their column.
    contribs: HashMap<u64, ExchangeRound>,
    barrier_gen: u64,
    barrier_arrived: usize,
}

struct ExchangeRound {
    rows: Vec<Option<Vec<i64>>>,
    extracted: usize,
}

struct TeamShared {
    size: usize,
    inboxes: Vec<ArrayQueue<(UnitId, Vec<u8>)>>,
    segments: DashMap<(UnitId, SegmentId), Segment>,
    rendezvous: DashMap<(UnitId, UnitId, i32), PendingXfer>,
    collectives: Mutex<CollectiveState>,
    collective_cv: Condvar,
}

/// An in-process team of `size` units sharing one address space.
pub struct LocalTeam {
    unit: UnitId,
    shared: Arc<TeamShared>,
}

impl LocalTeam {
    /// A single-unit team; the transport is never engaged.
    pub fn solo() -> Arc<LocalTeam> {
        Self::split(1, crate::config::AMSGQ_MSG_COUNT)
            .pop()
            .expect("split(1) yields one unit")
    }

    /// Creates `size` connected units. Each element is handed to the
    /// runtime of one unit.
    pub fn split(size: usize, inbox_capacity: usize) -> Vec<Arc<LocalTeam>> {
        assert!(size > 0, "a team needs at least one unit");
        let shared = Arc::new(TeamShared {
            size,
            inboxes: (0..size).map(|_| ArrayQueue::new(inbox_capacity)).collect(),
            segments: DashMap::new(),
            rendezvous: DashMap::new(),
            collectives: Mutex::new(CollectiveState {
                entered: vec![0; size],
                ..CollectiveState::default()
            }),
            collective_cv: Condvar::new(),
        });

        (0..size)
            .map(|u| {
                Arc::new(LocalTeam {
                    unit: UnitId(u as u32),
                    shared: Arc::clone(&shared),
                })
            })
            .collect()
    }

    fn begin(&self, contribution: Option<Vec<i64>>) -> CollectiveOp {
        let mut st = self.shared.collectives.lock();
        let me = self.unit.index();
        let round = st.entered[me];
        st.entered[me] += 1;

        let is_exchange = contribution.is_some();
        if let Some(counts) = contribution {
            assert_eq!(counts.len(), self.shared.size, "bad exchange contribution");
            let size = self.shared.size;
            let entry = st.contribs.entry(round).or_insert_with(|| ExchangeRound {
                rows: (0..size).map(|_| None).collect(),
                extracted: 0,
            });
            entry.rows[me] = Some(counts);
        }

        CollectiveOp {
            round,
            is_exchange,
            finished: false,
            received: None,
        }
    }
}

impl Team for LocalTeam {
    fn my_unit(&self) -> UnitId {
        self.unit
    }

    fn num_units(&self) -> usize {
        self.shared.size
    }

    fn try_send(&self, target: UnitId, payload: &[u8]) -> Result<(), Error> {
        let inbox = self
            .shared
            .inboxes
            .get(target.index())
            .ok_or(Error::NotFound("unknown target unit"))?;
        inbox
            .push((self.unit, payload.to_vec()))
            .map_err(|_| Error::Again("target inbox full"))
    }

    fn try_recv(&self) -> Option<(UnitId, Vec<u8>)> {
        self.shared.inboxes[self.unit.index()].pop()
    }

    fn begin_barrier(&self) -> CollectiveOp {
        self.begin(None)
    }

    fn begin_exchange(&self, send_counts: &[i64]) -> CollectiveOp {
        self.begin(Some(send_counts.to_vec()))
    }

    fn poll_collective(&self, op: &mut CollectiveOp) -> bool {
        if op.finished {
            return true;
        }

        let mut st = self.shared.collectives.lock();
        if !st.entered.iter().all(|&e| e > op.round) {
            return false;
        }

        if op.is_exchange {
            let me = self.unit.index();
            let size = self.shared.size;
            let round = st
                .contribs
                .get_mut(&op.round)
                .expect("exchange round missing");
            let received = (0..size)
                .map(|i| {
                    round.rows[i]
                        .as_ref()
                        .expect("missing exchange contribution")[me]
                })
                .collect::<Vec<_>>();
            round.extracted += 1;
            if round.extracted == size {
                st.contribs.remove(&op.round);
            }
            op.received = Some(received);
        }

        op.finished = true;
        true
    }

    fn barrier(&self) {
        let mut st = self.shared.collectives.lock();
        let barrier_gen = st.barrier_gen;
        st.barrier_arrived += 1;
        if st.barrier_arrived == self.shared.size {
            st.barrier_arrived = 0;
            st.barrier_gen += 1;
            self.shared.collective_cv.notify_all();
        } else {
            while st.barrier_gen == barrier_gen {
                self.shared.collective_cv.wait(&mut st);
            }
        }
    }

    fn register_segment(
        &self,
        segment: SegmentId,
        base: *mut u8,
        len: usize,
    ) -> Result<(), Error> {
        if segment.is_local() {
            return Err(Error::InvalidArgument(
                "the local pseudo-segment cannot be registered",
            ));
        }
        self.shared.segments.insert(
            (self.unit, segment),
            Segment {
                base: base as usize,
                len,
            },
        );
        tracing::debug!(unit = %self.unit, segment = segment.0, len, "segment registered");
        Ok(())
    }

    fn local_base(&self, gptr: GlobalPtr) -> Result<*mut u8, Error> {
        if gptr.segment.is_local() {
            return Ok(gptr.offset as *mut u8);
        }
        if gptr.unit != self.unit {
            return Err(Error::InvalidArgument("gptr is not owned by this unit"));
        }
        let seg = self
            .shared
            .segments
            .get(&(gptr.unit, gptr.segment))
            .ok_or(Error::NotFound("segment not registered"))?;
        if gptr.offset as usize >= seg.len {
            return Err(Error::InvalidArgument("offset beyond segment"));
        }
        Ok((seg.base + gptr.offset as usize) as *mut u8)
    }

    unsafe fn get(
        &self,
        src: GlobalPtr,
        dst: *mut u8,
        nbytes: usize,
    ) -> Result<TransferHandle, Error> {
        let seg = self
            .shared
            .segments
            .get(&(src.unit, src.segment))
            .ok_or(Error::NotFound("source segment not registered"))?;
        if src.offset as usize + nbytes > seg.len {
            return Err(Error::InvalidArgument("get beyond segment bounds"));
        }

        // Units share the address space, so the one-sided read completes
        // in place.
        unsafe {
            std::ptr::copy_nonoverlapping((seg.base + src.offset as usize) as *const u8, dst, nbytes);
        }
        Ok(TransferHandle::ready())
    }

    unsafe fn send_tagged(
        &self,
        target: UnitId,
        tag: i32,
        src: *const u8,
        nbytes: usize,
    ) -> Result<TransferHandle, Error> {
        if target.index() >= self.shared.size {
            return Err(Error::NotFound("unknown target unit"));
        }

        let key = (target, self.unit, tag);
        match self.shared.rendezvous.remove(&key) {
            Some((_, PendingXfer::Recv { dst, len, handle })) => {
                if len != nbytes {
                    return Err(Error::Other(anyhow!(
                        "tagged transfer size mismatch: send {nbytes}, recv {len}"
                    )));
                }
                unsafe { std::ptr::copy_nonoverlapping(src, dst as *mut u8, nbytes) };
                handle.complete();
                Ok(TransferHandle::ready())
            }
            Some((_, pending @ PendingXfer::Send { .. })) => {
                // Duplicate tag from the same source; put it back.
                self.shared.rendezvous.insert(key, pending);
                Err(Error::InvalidArgument("tag already has a pending send"))
            }
            None => {
                let handle = TransferHandle::pending();
                self.shared.rendezvous.insert(
                    key,
                    PendingXfer::Send {
                        src: src as usize,
                        len: nbytes,
                        handle: handle.clone(),
                    },
                );
                Ok(handle)
            }
        }
    }

    unsafe fn recv_tagged(
        &self,
        source: UnitId,
        tag: i32,
        dst: *mut u8,
        nbytes: usize,
    ) -> Result<TransferHandle, Error> {
        if source.index() >= self.shared.size {
            return Err(Error::NotFound("unknown source unit"));
        }

        let key = (self.unit, source, tag);
        match self.shared.rendezvous.remove(&key) {
            Some((_, PendingXfer::Send { src, len, handle })) => {
                if len != nbytes {
                    return Err(Error::Other(anyhow!(
                        "tagged transfer size mismatch: send {len}, recv {nbytes}"
                    )));
                }
                unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst, nbytes) };
                handle.complete();
                Ok(TransferHandle::ready())
            }
            Some((_, pending @ PendingXfer::Recv { .. })) => {
                self.shared.rendezvous.insert(key, pending);
                Err(Error::InvalidArgument("tag already has a pending recv"))
            }
            None => {
                let handle = TransferHandle::pending();
                self.shared.rendezvous.insert(
                    key,
                    PendingXfer::Recv {
                        dst: dst as usize,
                        len: nbytes,
                        handle: handle.clone(),
                    },
                );
                Ok(handle)
            }
        }
    }
}

impl std::fmt::Debug for LocalTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTeam")
            .field("unit", &self.unit)
            .field("size", &self.shared.size)
            .finish()
    }
}
