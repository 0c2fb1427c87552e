use crate::deps::DepEntry;
use crate::gptr::SegmentId;
use crate::phase::Phase;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type DepKey = (SegmentId, u64);

/// Accesses to one `(segment, offset)` within a parent, linearized in
/// creation order.
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    /// The producer currently being supplanted-into; `In`s bind here.
    pub(crate) latest_producer: Option<Arc<DepEntry>>,
    /// Readers since the latest producer; a new producer orders after
    /// all of them (WAR) and then clears the list.
    pub(crate) readers: Vec<Arc<DepEntry>>,
    /// Producer history in creation (and thus phase) order. Remote
    /// in-dep requests match against this by phase.
    pub(crate) producers: Vec<Arc<DepEntry>>,
}

impl Bucket {
    pub(crate) fn install_producer(&mut self, entry: Arc<DepEntry>) {
        self.readers.clear();
        self.latest_producer = Some(Arc::clone(&entry));
        self.producers.push(entry);
    }

    /// The producer a consumer of `phase` orders after across units: the
    /// latest producer of a strictly earlier phase.
    pub(crate) fn producer_before(&self, phase: Phase) -> Option<&Arc<DepEntry>> {
        self.producers
            .iter()
            .rev()
            .find(|e| e.phase.0 < phase.0 || e.phase.is_any())
    }
}

/// Per-parent index of outstanding accesses, keyed by (segment, offset).
/// Sharding by parent means concurrent children of different parents
/// never collide; within one parent, creation is single-threaded and
/// remote handlers take the parent's hash lock.
#[derive(Debug, Default)]
pub(crate) struct DepHash {
    buckets: HashMap<DepKey, Bucket>,
}

impl DepHash {
    pub(crate) fn bucket_mut(&mut self, key: DepKey) -> &mut Bucket {
        self.buckets.entry(key).or_default()
    }

    pub(crate) fn bucket(&self, key: &DepKey) -> Option<&Bucket> {
        self.buckets.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::DepKind;
    use crate::gptr::{GlobalPtr, UnitId};
    use crate::task::Task;

    fn entry(kind: DepKind, phase: Phase, off: u64) -> Arc<DepEntry> {
        let t = Task::new_root();
        DepEntry::new(kind, phase, GlobalPtr::new(SegmentId(1), UnitId(0), off), &t)
    }

    #[test]
    fn install_producer_clears_readers() {
        let mut b = Bucket::default();
        b.readers.push(entry(DepKind::In, Phase(0), 0));
        b.install_producer(entry(DepKind::Out, Phase(0), 0));
        assert!(b.readers.is_empty());
        assert!(b.latest_producer.is_some());
        assert_eq!(b.producers.len(), 1);
    }

    #[test]
    fn producer_before_matches_by_phase() {
        let mut b = Bucket::default();
        b.install_producer(entry(DepKind::Out, Phase(0), 0));
        b.install_producer(entry(DepKind::Out, Phase(2), 0));

        // A consumer in phase 1 orders after the phase-0 producer.
        assert_eq!(b.producer_before(Phase(1)).unwrap().phase, Phase(0));
        // A consumer in phase 3 orders after the phase-2 producer.
        assert_eq!(b.producer_before(Phase(3)).unwrap().phase, Phase(2));
        // Nothing precedes phase 0.
        assert!(b.producer_before(Phase(0)).is_none());
    }

    #[test]
    fn buckets_are_keyed_by_segment_and_offset() {
        let mut h = DepHash::default();
        h.bucket_mut((SegmentId(1), 0))
            .install_producer(entry(DepKind::Out, Phase(0), 0));
        h.bucket_mut((SegmentId(1), 8))
            .install_producer(entry(DepKind::Out, Phase(0), 8));
        assert_eq!(h.len(), 2);
        assert!(h.bucket(&(SegmentId(2), 0)).is_none());

        h.clear();
        assert_eq!(h.len(), 0);
    }
}
