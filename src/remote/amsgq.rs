//! Round-based active-message progress engine.
//!
//! Outbound messages are packed as `(u32 length, payload)` records into a
//! per-peer buffer until it is full or a flush is forced (staged mode),
//! or sent one record per buffer (direct mode). Round termination is
//! detected either by a plain barrier (sync mode) or by an all-to-all
//! exchange of per-peer send counts matched against received counts.

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::gptr::UnitId;
use crate::remote::Message;
use crate::remote::comm::Team;
use crate::runtime::RuntimeInner;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct Amsgq {
    team: Arc<dyn Team>,
    sync_mode: bool,
    direct: bool,
    msg_size: usize,
    /// Receive window: buffers drained per processing pass, matching the
    /// pre-posted receive count of the fabric.
    msg_count: usize,
    /// Send path: per-peer pack buffers.
    packs: Mutex<Vec<Vec<u8>>>,
    /// Processing path; `try_process` backs off on contention,
    /// `process_blocking` always acquires.
    processing: Mutex<()>,
    /// Per-peer buffers sent / received since the last round adjustment.
    /// Only maintained in async (counting) mode.
    send_count: Mutex<Vec<i64>>,
    recv_count: Mutex<Vec<i64>>,
}

impl Amsgq {
    pub(crate) fn new(cfg: &RuntimeConfig, team: Arc<dyn Team>) -> Amsgq {
        let n = team.num_units();
        Amsgq {
            team,
            sync_mode: cfg.amsgq_sync,
            direct: cfg.amsgq_direct,
            msg_size: cfg.amsgq_msg_size,
            msg_count: cfg.amsgq_msg_count,
            packs: Mutex::new(vec![Vec::new(); n]),
            processing: Mutex::new(()),
            send_count: Mutex::new(vec![0; n]),
            recv_count: Mutex::new(vec![0; n]),
        }
    }

    fn single_unit(&self) -> bool {
        self.team.num_units() == 1
    }

    /// Enqueues one message for `target`. Staged mode packs; direct mode
    /// sends immediately.
    pub(crate) fn post(&self, rt: &RuntimeInner, target: UnitId, msg: &Message) {
        debug_assert!(!self.single_unit(), "active message on a single unit");
        debug_assert_ne!(target, self.team.my_unit(), "active message to self");

        let mut record = Vec::with_capacity(64);
        msg.encode(&mut record);
        tracing::trace!(?msg, %target, len = record.len(), "posting active message");

        if self.direct {
            let mut framed = Vec::with_capacity(record.len() + 4);
            framed.extend_from_slice(&(record.len() as u32).to_le_bytes());
            framed.extend_from_slice(&record);
            self.send_buffer(rt, target, &framed, false);
            return;
        }

        // Flush the pack first if the record no longer fits.
        let full = {
            let mut packs = self.packs.lock();
            let buf = &mut packs[target.index()];
            if !buf.is_empty() && buf.len() + 4 + record.len() > self.msg_size {
                Some(std::mem::take(buf))
            } else {
                None
            }
        };
        if let Some(buf) = full {
            self.send_buffer(rt, target, &buf, false);
        }

        let mut packs = self.packs.lock();
        let buf = &mut packs[target.index()];
        buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
        buf.extend_from_slice(&record);
    }

    /// Forces out every non-empty pack buffer.
    pub(crate) fn flush(&self, rt: &RuntimeInner) {
        if self.single_unit() || self.direct {
            return;
        }
        self.flush_inner(rt, false);
    }

    fn flush_inner(&self, rt: &RuntimeInner, has_processing_lock: bool) {
        let pending = {
            let mut packs = self.packs.lock();
            packs
                .iter_mut()
                .enumerate()
                .filter(|(_, b)| !b.is_empty())
                .map(|(i, b)| (UnitId(i as u32), std::mem::take(b)))
                .collect::<Vec<_>>()
        };

        for (target, buf) in pending {
            self.send_buffer(rt, target, &buf, has_processing_lock);
        }
    }

    /// Retries until the fabric accepts the buffer, draining our own
    /// inbox in between so two mutually-full peers cannot wedge.
    fn send_buffer(&self, rt: &RuntimeInner, target: UnitId, buf: &[u8], has_processing_lock: bool) {
        loop {
            match self.team.try_send(target, buf) {
                Ok(()) => {
                    if !self.sync_mode {
                        self.send_count.lock()[target.index()] += 1;
                    }
                    return;
                }
                Err(e) if e.is_again() => {
                    if has_processing_lock {
                        self.drain_inbox(rt);
                    } else {
                        let _ = self.try_process(rt);
                    }
                    std::hint::spin_loop();
                }
                Err(e) => {
                    // Anything but transient back-pressure is a broken
                    // fabric; that is not user-recoverable.
                    panic!("FATAL: active message send to {target} failed: {e}");
                }
            }
        }
    }

    /// Pulls and dispatches inbound messages. `Err(Again)` when another
    /// thread holds the processing path.
    pub(crate) fn try_process(&self, rt: &RuntimeInner) -> Result<usize, Error> {
        if self.single_unit() {
            return Ok(0);
        }
        let _guard = self
            .processing
            .try_lock()
            .ok_or(Error::Again("processing path contended"))?;
        Ok(self.drain_inbox(rt))
    }

    fn drain_inbox(&self, rt: &RuntimeInner) -> usize {
        let mut buffers = 0;
        while buffers < self.msg_count {
            let Some((src, buf)) = self.team.try_recv() else {
                break;
            };
            buffers += 1;
            if !self.sync_mode {
                self.recv_count.lock()[src.index()] += 1;
            }
            self.dispatch_buffer(rt, src, &buf);
        }
        buffers
    }

    fn dispatch_buffer(&self, rt: &RuntimeInner, src: UnitId, buf: &[u8]) {
        let mut pos = 0;
        while pos + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            assert!(
                pos + len <= buf.len(),
                "FATAL: corrupt active message buffer from {src}"
            );
            match Message::decode(&buf[pos..pos + len]) {
                Ok(msg) => rt.dispatch_message(src, msg),
                Err(e) => panic!("FATAL: undecodable active message from {src}: {e}"),
            }
            pos += len;
        }
    }

    /// Runs one termination round: returns only when every message sent
    /// in the current round has been received everywhere.
    pub(crate) fn process_blocking(&self, rt: &RuntimeInner) {
        if self.single_unit() {
            return;
        }

        let _guard = self.processing.lock();

        // Snapshot this round's send counts; messages posted from here on
        // belong to the next round.
        self.flush_inner(rt, true);
        let send_round = if self.sync_mode {
            Vec::new()
        } else {
            let mut counts = self.send_count.lock();
            let snapshot = counts.clone();
            counts.iter_mut().for_each(|c| *c = 0);
            snapshot
        };

        tracing::debug!(?send_round, "starting blocking message round");

        // Local sends completed at flush; post the termination collective
        // and keep serving inbound messages until it resolves.
        let mut op = if self.sync_mode {
            self.team.begin_barrier()
        } else {
            self.team.begin_exchange(&send_round)
        };

        loop {
            self.drain_inbox(rt);
            // Replies produced by handlers leave promptly; they count
            // toward the next round.
            self.flush_inner(rt, true);
            if self.team.poll_collective(&mut op) {
                break;
            }
            std::hint::spin_loop();
        }

        // In counting mode, keep processing until every peer's round
        // count is covered by actual receipts.
        if !self.sync_mode {
            let recv_round = op.received.take().expect("exchange without counts");
            loop {
                let outstanding = {
                    let recv = self.recv_count.lock();
                    recv_round.iter().zip(recv.iter()).any(|(want, got)| want > got)
                };
                if !outstanding {
                    break;
                }
                self.drain_inbox(rt);
                self.flush_inner(rt, true);
                std::hint::spin_loop();
            }

            let mut recv = self.recv_count.lock();
            for (got, want) in recv.iter_mut().zip(recv_round.iter()) {
                *got -= want;
            }
        }

        // Keeps the next round from picking up stragglers of this one.
        self.team.barrier();

        tracing::debug!("blocking message round complete");
    }

    /// Shutdown accounting: per-peer counters must be balanced.
    pub(crate) fn close(&self) {
        if self.single_unit() || self.sync_mode {
            return;
        }

        let send = self.send_count.lock();
        let recv = self.recv_count.lock();
        for (peer, (&s, &r)) in send.iter().zip(recv.iter()).enumerate() {
            assert!(
                s == 0,
                "FATAL: {} unaccounted sent messages to unit {peer} at shutdown",
                s
            );
            assert!(
                r == 0,
                "FATAL: {} unaccounted received messages from unit {peer} at shutdown",
                r
            );
        }
    }

}

impl std::fmt::Debug for Amsgq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Amsgq")
            .field("units", &self.team.num_units())
            .field("sync", &self.sync_mode)
            .field("direct", &self.direct)
            .finish()
    }
}
