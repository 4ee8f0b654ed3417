//! Process-wide time source.
//!
//! Real time is anchored once on the wall clock and advanced with [`Instant`],
//! so timestamps taken inside one process never go backwards even if the
//! system clock is adjusted.
//!
//! Tests can freeze time through a single global override:
//!
//! ```rust,ignore
//! let clock = apm_agent::clock::freeze();
//! let t0 = clock.now();
//! clock.advance(Duration::from_secs(5));
//! assert_eq!(apm_agent::clock::now(), t0 + Duration::from_secs(5));
//! ```
//!
//! The returned [`FrozenClock`] holds a global lock, so two tests that freeze
//! time run one after the other instead of fighting over the override.

use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock instant with nanosecond resolution (nanoseconds since the Unix epoch).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const UNIX_EPOCH: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Converts fractional seconds since the epoch. Negative or non-finite
    /// inputs clamp to the epoch.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::UNIX_EPOCH;
        }
        Self((secs * 1e9) as u64)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    pub const fn as_secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Elapsed time since `earlier`, zero if `earlier` is later than `self`.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration_nanos(rhs)))
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

struct Anchor {
    wall: u64,
    instant: Instant,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();
static FROZEN: AtomicBool = AtomicBool::new(false);
static FROZEN_NANOS: AtomicU64 = AtomicU64::new(0);
static FREEZE_LOCK: Mutex<()> = Mutex::new(());

/// Current time: the frozen value while a [`FrozenClock`] is alive, real time otherwise.
#[inline]
pub fn now() -> Timestamp {
    if FROZEN.load(Ordering::Acquire) {
        return Timestamp(FROZEN_NANOS.load(Ordering::Acquire));
    }
    real_now()
}

fn real_now() -> Timestamp {
    let anchor = ANCHOR.get_or_init(|| Anchor {
        wall: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_nanos)
            .unwrap_or(0),
        instant: Instant::now(),
    });
    Timestamp(
        anchor
            .wall
            .saturating_add(duration_nanos(anchor.instant.elapsed())),
    )
}

/// Freezes the global clock at the current real time.
pub fn freeze() -> FrozenClock {
    freeze_at(real_now())
}

/// Freezes the global clock at `at`.
///
/// Blocks while another [`FrozenClock`] is alive.
pub fn freeze_at(at: Timestamp) -> FrozenClock {
    let guard = FREEZE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    FROZEN_NANOS.store(at.0, Ordering::Release);
    FROZEN.store(true, Ordering::Release);
    FrozenClock { _guard: guard }
}

/// Guard for a frozen global clock. Time resumes when it is dropped.
pub struct FrozenClock {
    _guard: MutexGuard<'static, ()>,
}

impl FrozenClock {
    pub fn now(&self) -> Timestamp {
        Timestamp(FROZEN_NANOS.load(Ordering::Acquire))
    }

    /// Moves the frozen clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        FROZEN_NANOS.fetch_add(duration_nanos(by), Ordering::AcqRel);
    }

    pub fn set(&self, at: Timestamp) {
        FROZEN_NANOS.store(at.0, Ordering::Release);
    }
}

impl Drop for FrozenClock {
    fn drop(&mut self) {
        FROZEN.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for FrozenClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenClock").field("now", &self.now()).finish()
    }
}
