//! Dependency-handling messages exchanged between units and the
//! round-based progress engine that carries them.

use crate::gptr::{GlobalPtr, SegmentId, TeamId, UnitId};
use crate::phase::Phase;
use anyhow::{Result, anyhow, bail};

pub(crate) mod amsgq;
pub(crate) mod comm;

/// Small control messages carried by the active-message queue. Handlers
/// run inside the transport poller of the receiving unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Message {
    /// A consumer on `origin` orders after the latest producer of `gptr`
    /// in a phase before `phase`. The owner replies with
    /// [`Message::ReleaseDep`] carrying `origin_ref` once ordering is
    /// satisfied.
    RequestInDep {
        gptr: GlobalPtr,
        phase: Phase,
        origin: UnitId,
        origin_ref: u64,
    },

    /// Ordering for the request identified by `origin_ref` is satisfied.
    ReleaseDep { origin_ref: u64 },

    /// Copy-in prefetch request (SENDRECV flavor): the owner shall send
    /// `nbytes` at `gptr` to `origin` under `tag`, ordered by a delayed
    /// input in `phase`.
    SendRequest {
        gptr: GlobalPtr,
        nbytes: u32,
        tag: i32,
        phase: Phase,
        origin: UnitId,
    },
}

const TAG_REQUEST_IN_DEP: u8 = 1;
const TAG_RELEASE_DEP: u8 = 2;
const TAG_SEND_REQUEST: u8 = 3;

fn put_gptr(buf: &mut Vec<u8>, g: &GlobalPtr) {
    buf.extend_from_slice(&g.segment.0.to_le_bytes());
    buf.extend_from_slice(&g.unit.0.to_le_bytes());
    buf.extend_from_slice(&g.team.0.to_le_bytes());
    buf.extend_from_slice(&g.flags.to_le_bytes());
    buf.extend_from_slice(&g.offset.to_le_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        if end > self.buf.len() {
            bail!("truncated message ({} of {} bytes)", self.buf.len(), end);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn gptr(&mut self) -> Result<GlobalPtr> {
        Ok(GlobalPtr {
            segment: SegmentId(i16::from_le_bytes(self.take()?)),
            unit: UnitId(u32::from_le_bytes(self.take()?)),
            team: TeamId(u16::from_le_bytes(self.take()?)),
            flags: u16::from_le_bytes(self.take()?),
            offset: u64::from_le_bytes(self.take()?),
        })
    }
}

impl Message {
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Message::RequestInDep {
                gptr,
                phase,
                origin,
                origin_ref,
            } => {
                buf.push(TAG_REQUEST_IN_DEP);
                put_gptr(buf, gptr);
                buf.extend_from_slice(&phase.0.to_le_bytes());
                buf.extend_from_slice(&origin.0.to_le_bytes());
                buf.extend_from_slice(&origin_ref.to_le_bytes());
            }
            Message::ReleaseDep { origin_ref } => {
                buf.push(TAG_RELEASE_DEP);
                buf.extend_from_slice(&origin_ref.to_le_bytes());
            }
            Message::SendRequest {
                gptr,
                nbytes,
                tag,
                phase,
                origin,
            } => {
                buf.push(TAG_SEND_REQUEST);
                put_gptr(buf, gptr);
                buf.extend_from_slice(&nbytes.to_le_bytes());
                buf.extend_from_slice(&tag.to_le_bytes());
                buf.extend_from_slice(&phase.0.to_le_bytes());
                buf.extend_from_slice(&origin.0.to_le_bytes());
            }
        }
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Message> {
        let (&tag, rest) = payload
            .split_first()
            .ok_or_else(|| anyhow!("empty message"))?;
        let mut r = Reader { buf: rest, pos: 0 };

        let msg = match tag {
            TAG_REQUEST_IN_DEP => Message::RequestInDep {
                gptr: r.gptr()?,
                phase: Phase(i32::from_le_bytes(r.take()?)),
                origin: UnitId(u32::from_le_bytes(r.take()?)),
                origin_ref: u64::from_le_bytes(r.take()?),
            },
            TAG_RELEASE_DEP => Message::ReleaseDep {
                origin_ref: u64::from_le_bytes(r.take()?),
            },
            TAG_SEND_REQUEST => Message::SendRequest {
                gptr: r.gptr()?,
                nbytes: u32::from_le_bytes(r.take()?),
                tag: i32::from_le_bytes(r.take()?),
                phase: Phase(i32::from_le_bytes(r.take()?)),
                origin: UnitId(u32::from_le_bytes(r.take()?)),
            },
            other => bail!("unknown message tag: {other}"),
        };

        if r.pos != rest.len() {
            bail!("trailing bytes in message (tag {tag})");
        }

        Ok(msg)
    }
}
