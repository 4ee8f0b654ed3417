//! Metric aggregation.
//!
//! A process-wide mapping from `(name, scope)` to a running [`Stats`]
//! accumulator. Recording is lock-sharded: each thread writes into its own
//! shard under a short shard lock, and all shards hang off one generation
//! guarded by an `RwLock`. Writers take the read side (shared, never
//! contended by other writers); `harvest` takes the write side only long
//! enough to swap in an empty generation. A record that races the harvest
//! therefore lands entirely in the old generation or entirely in the new one.
//!
//! Shards are merged outside the lock; merging is commutative and
//! associative, so the shard a value landed in never matters.

use crate::clock::{self, Timestamp};
use crate::invariants::debug_assert_accumulator_populated;
use crate::shard::shard_index;
use crossbeam_utils::CachePadded;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Metric key: a hierarchical name, optionally scoped to a transaction.
///
/// Unscoped entries are process-wide totals; scoped entries hold time spent
/// in `name` while the transaction named by `scope` was running.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl MetricSpec {
    pub fn unscoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Some(scope.into()),
        }
    }
}

/// Running accumulator. Times are in seconds.
///
/// Serialized as `[count, total, exclusive, min, max, sum_of_squares]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub call_count: u64,
    pub total_call_time: f64,
    pub total_exclusive_time: f64,
    pub min_call_time: f64,
    pub max_call_time: f64,
    pub sum_of_squares: f64,
}

impl Stats {
    pub fn from_durations(total: Duration, exclusive: Duration) -> Self {
        let mut stats = Self::default();
        stats.record(total, exclusive);
        stats
    }

    /// Adds one timed call.
    pub fn record(&mut self, total: Duration, exclusive: Duration) {
        self.record_secs(total.as_secs_f64(), exclusive.as_secs_f64());
    }

    fn record_secs(&mut self, total: f64, exclusive: f64) {
        if self.call_count == 0 {
            self.min_call_time = total;
            self.max_call_time = total;
        } else {
            self.min_call_time = self.min_call_time.min(total);
            self.max_call_time = self.max_call_time.max(total);
        }
        self.call_count += 1;
        self.total_call_time += total;
        self.total_exclusive_time += exclusive;
        self.sum_of_squares += total * total;
    }

    /// Folds `other` into `self`: sums counts and times, min of mins, max of maxes.
    pub fn merge(&mut self, other: &Stats) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *other;
            return;
        }
        self.min_call_time = self.min_call_time.min(other.min_call_time);
        self.max_call_time = self.max_call_time.max(other.max_call_time);
        self.call_count += other.call_count;
        self.total_call_time += other.total_call_time;
        self.total_exclusive_time += other.total_exclusive_time;
        self.sum_of_squares += other.sum_of_squares;
    }

    fn is_empty(&self) -> bool {
        self.call_count == 0
            && self.total_call_time == 0.0
            && self.total_exclusive_time == 0.0
    }

    /// Apdex buckets reuse the accumulator layout:
    /// count = satisfying, total = tolerating, exclusive = frustrating,
    /// min = max = T.
    fn record_apdex(&mut self, zone: ApdexZone, apdex_t: Duration) {
        match zone {
            ApdexZone::Satisfying => self.call_count += 1,
            ApdexZone::Tolerating => self.total_call_time += 1.0,
            ApdexZone::Frustrating => self.total_exclusive_time += 1.0,
        }
        self.min_call_time = apdex_t.as_secs_f64();
        self.max_call_time = apdex_t.as_secs_f64();
    }

    pub fn apdex_satisfying(&self) -> u64 {
        self.call_count
    }

    pub fn apdex_tolerating(&self) -> u64 {
        self.total_call_time as u64
    }

    pub fn apdex_frustrating(&self) -> u64 {
        self.total_exclusive_time as u64
    }
}

impl Serialize for Stats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&self.call_count)?;
        tuple.serialize_element(&self.total_call_time)?;
        tuple.serialize_element(&self.total_exclusive_time)?;
        tuple.serialize_element(&self.min_call_time)?;
        tuple.serialize_element(&self.max_call_time)?;
        tuple.serialize_element(&self.sum_of_squares)?;
        tuple.end()
    }
}

/// User satisfaction bucket for a web transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApdexZone {
    Satisfying,
    Tolerating,
    Frustrating,
}

impl ApdexZone {
    /// Satisfying up to T, tolerating up to 4T, frustrating beyond or on error.
    pub fn classify(duration: Duration, apdex_t: Duration, errored: bool) -> Self {
        if errored {
            Self::Frustrating
        } else if duration <= apdex_t {
            Self::Satisfying
        } else if duration <= apdex_t * 4 {
            Self::Tolerating
        } else {
            Self::Frustrating
        }
    }
}

/// Per-name entry: the unscoped total plus one accumulator per scope.
#[derive(Debug, Default)]
struct NameEntry {
    unscoped: Stats,
    scoped: HashMap<String, Stats>,
}

type ShardMap = HashMap<String, NameEntry>;

struct Generation {
    started: Timestamp,
    shards: Box<[CachePadded<Mutex<ShardMap>>]>,
}

impl Generation {
    fn new(shard_count: usize) -> Self {
        Self {
            started: clock::now(),
            shards: (0..shard_count)
                .map(|_| CachePadded::new(Mutex::new(HashMap::new())))
                .collect(),
        }
    }
}

/// Harvested metric data for one window, ordered by `(name, scope)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    pub start: Timestamp,
    pub end: Timestamp,
    entries: BTreeMap<MetricSpec, Stats>,
}

impl MetricSnapshot {
    pub fn get(&self, name: &str, scope: Option<&str>) -> Option<&Stats> {
        self.entries.get(&MetricSpec {
            name: name.to_string(),
            scope: scope.map(str::to_string),
        })
    }

    pub fn unscoped(&self, name: &str) -> Option<&Stats> {
        self.get(name, None)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricSpec, &Stats)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &MetricSpec> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds an older snapshot (e.g. a held backlog) into this one.
    pub fn merge(&mut self, older: MetricSnapshot) {
        if !older.is_empty() {
            self.start = self.start.min(older.start);
        }
        for (spec, stats) in older.entries {
            self.entries.entry(spec).or_default().merge(&stats);
        }
    }

    /// Sum of `call_count` over every entry.
    pub fn total_call_count(&self) -> u64 {
        self.entries.values().map(|s| s.call_count).sum()
    }
}

/// Process-wide metric aggregator.
pub struct MetricAggregator {
    current: RwLock<Generation>,
    shard_count: usize,
}

impl MetricAggregator {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            current: RwLock::new(Generation::new(shard_count)),
            shard_count,
        }
    }

    /// Runs `f` on the calling thread's shard of the current generation.
    #[inline]
    fn with_shard<R>(&self, f: impl FnOnce(&mut ShardMap) -> R) -> R {
        let generation = self.current.read().unwrap_or_else(PoisonError::into_inner);
        let shard = &generation.shards[shard_index(self.shard_count)];
        let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut map)
    }

    fn with_entry<R>(map: &mut ShardMap, name: &str, f: impl FnOnce(&mut NameEntry) -> R) -> R {
        // Look up first so the hit path does not allocate.
        match map.get_mut(name) {
            Some(entry) => f(entry),
            None => f(map.entry(name.to_string()).or_default()),
        }
    }

    fn with_stats<R>(entry: &mut NameEntry, scope: Option<&str>, f: impl FnOnce(&mut Stats) -> R) -> R {
        match scope {
            None => f(&mut entry.unscoped),
            Some(scope) => match entry.scoped.get_mut(scope) {
                Some(stats) => f(stats),
                None => f(entry.scoped.entry(scope.to_string()).or_default()),
            },
        }
    }

    /// Merges one timed call into `(name, scope)`.
    pub fn record(&self, name: &str, scope: Option<&str>, total: Duration, exclusive: Duration) {
        self.with_shard(|map| {
            Self::with_entry(map, name, |entry| {
                Self::with_stats(entry, scope, |stats| {
                    stats.record(total, exclusive);
                    debug_assert_accumulator_populated!(stats);
                });
            });
        });
    }

    /// Records into both the scoped and the unscoped entry for `name`.
    pub fn record_scoped_and_unscoped(
        &self,
        name: &str,
        scope: &str,
        total: Duration,
        exclusive: Duration,
    ) {
        self.with_shard(|map| {
            Self::with_entry(map, name, |entry| {
                entry.unscoped.record(total, exclusive);
                Self::with_stats(entry, Some(scope), |stats| stats.record(total, exclusive));
            });
        });
    }

    /// Category-wide unscoped aggregate: one call whose total and exclusive
    /// time are both the segment's exclusive time, so nested members of the
    /// same category are never double counted.
    pub fn record_rollup(&self, category_name: &str, exclusive: Duration) {
        self.record(category_name, None, exclusive, exclusive);
    }

    /// Adds `count` calls with no time (supportability and error counters).
    pub fn record_count(&self, name: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.with_shard(|map| {
            Self::with_entry(map, name, |entry| entry.unscoped.call_count += count);
        });
    }

    /// Records an arbitrary value (seconds or any unit) as a single call.
    pub fn record_value(&self, name: &str, value: f64) {
        self.with_shard(|map| {
            Self::with_entry(map, name, |entry| entry.unscoped.record_secs(value, value));
        });
    }

    pub fn record_apdex(&self, name: &str, zone: ApdexZone, apdex_t: Duration) {
        self.with_shard(|map| {
            Self::with_entry(map, name, |entry| entry.unscoped.record_apdex(zone, apdex_t));
        });
    }

    /// Atomically takes every accumulator recorded since the last harvest.
    pub fn harvest(&self) -> MetricSnapshot {
        let old = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, Generation::new(self.shard_count))
        };

        let mut snapshot = MetricSnapshot {
            start: old.started,
            end: clock::now(),
            entries: BTreeMap::new(),
        };
        for shard in old.shards.into_vec() {
            let map = CachePadded::into_inner(shard)
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner);
            for (name, entry) in map {
                if !entry.unscoped.is_empty() {
                    snapshot
                        .entries
                        .entry(MetricSpec::unscoped(name.clone()))
                        .or_default()
                        .merge(&entry.unscoped);
                }
                for (scope, stats) in entry.scoped {
                    snapshot
                        .entries
                        .entry(MetricSpec::scoped(name.clone(), scope))
                        .or_default()
                        .merge(&stats);
                }
            }
        }
        snapshot
    }
}

impl std::fmt::Debug for MetricAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricAggregator")
            .field("shards", &self.shard_count)
            .finish()
    }
}
