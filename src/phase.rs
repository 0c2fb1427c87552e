use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

/// Phases are monotonically numbered epochs per process. Tasks created
/// directly under the root task inherit the current phase; everything else
/// is [`Phase::ANY`] and never gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Phase(pub i32);

impl Phase {
    /// Always runnable, regardless of the watermark.
    pub const ANY: Phase = Phase(i32::MIN);
    pub const FIRST: Phase = Phase(0);

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }
}

/// Tracks the current phase, the runnable watermark and per-phase task
/// counts. The watermark gates the release of dependencies and deferred
/// tasks pertaining to later phases.
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    current: AtomicI32,
    runnable: AtomicI32,
    // Outstanding root-child tasks per phase, indexed relative to the
    // first phase of the epoch. Only used for accounting and logging.
    counts: Mutex<Vec<u32>>,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        Self {
            current: AtomicI32::new(Phase::FIRST.0),
            runnable: AtomicI32::new(Phase::FIRST.0),
            counts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn current(&self) -> Phase {
        Phase(self.current.load(Ordering::Acquire))
    }

    pub(crate) fn advance(&self) -> Phase {
        let prev = self.current.fetch_add(1, Ordering::AcqRel);
        Phase(prev + 1)
    }

    pub(crate) fn runnable(&self) -> Phase {
        Phase(self.runnable.load(Ordering::Acquire))
    }

    /// Raises the watermark: all tasks of phases `<= phase` become
    /// eligible. Lowering is only done by [`PhaseTracker::reset`].
    pub(crate) fn set_runnable(&self, phase: Phase) {
        self.runnable.store(phase.0, Ordering::Release);
        tracing::debug!(phase = phase.0, "phase watermark raised");
    }

    pub(crate) fn is_runnable(&self, phase: Phase) -> bool {
        phase.is_any() || phase.0 <= self.runnable.load(Ordering::Acquire)
    }

    /// Accounts a task created in `phase`.
    pub(crate) fn add_task(&self, phase: Phase) {
        if phase.is_any() {
            return;
        }
        let mut counts = self.counts.lock();
        let idx = phase.0.max(0) as usize;
        if counts.len() <= idx {
            counts.resize(idx + 1, 0);
        }
        counts[idx] += 1;
    }

    /// Removes a task accounted by [`PhaseTracker::add_task`].
    pub(crate) fn take_task(&self, phase: Phase) {
        if phase.is_any() {
            return;
        }
        let mut counts = self.counts.lock();
        let idx = phase.0.max(0) as usize;
        if let Some(c) = counts.get_mut(idx) {
            // Tolerates late destruction of tasks from a previous epoch.
            *c = c.saturating_sub(1);
        }
    }

    pub(crate) fn tasks_in_flight(&self) -> u32 {
        self.counts.lock().iter().sum()
    }

    /// Resets the epoch after full quiescence: counter and watermark back
    /// to the first phase.
    pub(crate) fn reset(&self) {
        self.current.store(Phase::FIRST.0, Ordering::Release);
        self.runnable.store(Phase::FIRST.0, Ordering::Release);
        self.counts.lock().clear();
    }
}
