//! Adaptive sampling decision: the first `target` transactions of every
//! window are sampled.

use crate::clock::{self, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free per-window counter.
///
/// Window rollover is a single CAS on the window start; the loser of a
/// rollover race just counts into the fresh window.
pub struct AdaptiveSampler {
    target: u64,
    window_nanos: u64,
    window_start: AtomicU64,
    count: AtomicU64,
}

impl AdaptiveSampler {
    pub fn new(target: u64, window: Duration) -> Self {
        Self {
            target,
            window_nanos: u64::try_from(window.as_nanos()).unwrap_or(u64::MAX).max(1),
            window_start: AtomicU64::new(clock::now().as_nanos()),
            count: AtomicU64::new(0),
        }
    }

    /// Decides whether the transaction starting now is sampled.
    pub fn compute_sampled(&self) -> bool {
        self.compute_sampled_at(clock::now())
    }

    pub(crate) fn compute_sampled_at(&self, now: Timestamp) -> bool {
        let now = now.as_nanos();
        let start = self.window_start.load(Ordering::Acquire);
        if now.saturating_sub(start) >= self.window_nanos
            && self
                .window_start
                .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(0, Ordering::Release);
        }
        self.count.fetch_add(1, Ordering::AcqRel) < self.target
    }

    pub fn target(&self) -> u64 {
        self.target
    }
}

impl std::fmt::Debug for AdaptiveSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSampler")
            .field("target", &self.target)
            .field("window_nanos", &self.window_nanos)
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}
