use std::fmt;

/// Identifies a registered memory segment on a unit. Negative values are
/// reserved; [`SegmentId::LOCAL`] marks raw process-local addresses whose
/// offset field carries the address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub i16);

impl SegmentId {
    pub const LOCAL: SegmentId = SegmentId(-1);

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

/// A unit is one process-level participant of a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl UnitId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Teams are numbered; the all-units team is 0. The dependency engine only
/// forwards the team id to the transport for addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TeamId(pub u16);

impl TeamId {
    pub const ALL: TeamId = TeamId(0);
}

/// A compact record identifying a memory range on a unit.
///
/// The dependency engine consumes only `(segment, offset)` for hashing and
/// `(unit, team)` for remote addressing. For `segment == SegmentId::LOCAL`
/// the offset is a process-local address and the pointer never crosses the
/// process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPtr {
    pub segment: SegmentId,
    pub unit: UnitId,
    pub team: TeamId,
    pub flags: u16,
    pub offset: u64,
}

impl GlobalPtr {
    pub const NULL: GlobalPtr = GlobalPtr {
        segment: SegmentId(0),
        unit: UnitId(0),
        team: TeamId::ALL,
        flags: 0,
        offset: 0,
    };

    /// A pointer to memory of a registered segment.
    pub fn new(segment: SegmentId, unit: UnitId, offset: u64) -> Self {
        Self {
            segment,
            unit,
            team: TeamId::ALL,
            flags: 0,
            offset,
        }
    }

    /// Wraps a process-local address. Used for user-provided copy-in
    /// destination buffers.
    pub fn local(unit: UnitId, addr: *const u8) -> Self {
        Self {
            segment: SegmentId::LOCAL,
            unit,
            team: TeamId::ALL,
            flags: 0,
            offset: addr as u64,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// The dephash key: accesses to the same segment and offset alias.
    pub(crate) fn dep_key(&self) -> (SegmentId, u64) {
        (self.segment, self.offset)
    }
}

impl fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gptr({}:seg{}+{:#x})",
            self.unit, self.segment.0, self.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(GlobalPtr: Send, Sync, Copy);

    #[test]
    fn dep_key_ignores_unit_and_team() {
        let a = GlobalPtr::new(SegmentId(3), UnitId(0), 64);
        let mut b = a;
        b.unit = UnitId(7);
        b.team = TeamId(2);
        assert_eq!(a.dep_key(), b.dep_key());
    }

    #[test]
    fn local_round_trips_the_address() {
        let buf = [0u8; 8];
        let g = GlobalPtr::local(UnitId(1), buf.as_ptr());
        assert!(g.segment.is_local());
        assert_eq!(g.offset, buf.as_ptr() as u64);
    }
}
