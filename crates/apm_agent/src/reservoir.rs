//! Priority reservoirs for event sampling.
//!
//! [`Reservoir`] is the plain single-owner structure: a slot vector plus a
//! min-heap over `(priority, slot)`. Once full, a new event replaces the
//! lowest-priority member only if its priority is strictly greater. When
//! several members share the minimum priority, the victim is drawn uniformly
//! among them, so equal-priority late arrivals are not starved by insertion
//! order.
//!
//! [`EventReservoir`] is the shared version used on the hot path. It holds
//! one `Reservoir` per thread-affine shard. The shards draw free slots from a
//! single budget of `C`: a shard may grow only while fewer than `C` events are
//! held in total, and once the budget is spent it can only replace its own
//! minimum. A single busy thread can therefore fill the whole capacity, and
//! the reservoir never holds more than `C` events. At harvest every shard is
//! swapped for an empty one under its own lock, its slots go back to the
//! budget, and the shards are merged into one reservoir of capacity `C`.
//!
//! | Type | Concurrency | Memory |
//! |------|-------------|--------|
//! | `Reservoir` | `&mut self` | `C` events |
//! | `EventReservoir` | per-shard `Mutex` + atomic slot budget | `C` events |

use crate::events::{Prioritized, Priority};
use crate::invariants::{debug_assert_reservoir_bounded, debug_assert_seen_dominates};
use crate::shard::shard_index;
use crossbeam_utils::CachePadded;
use rand::Rng;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// What happened to an offered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Stored in a free slot.
    Inserted,
    /// Stored by evicting a lower-priority member.
    Replaced,
    /// Not stored.
    Rejected,
}

/// Sampling statistics reported with every event harvest so the collector
/// can extrapolate true volume from the sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplingStats {
    #[serde(rename = "reservoir_size")]
    pub capacity: usize,
    #[serde(rename = "events_seen")]
    pub seen: u64,
    #[serde(skip)]
    pub kept: u64,
}

impl SamplingStats {
    /// Events seen but not kept.
    pub fn dropped(&self) -> u64 {
        self.seen.saturating_sub(self.kept)
    }
}

/// Fixed-capacity, priority-weighted sampling buffer.
pub struct Reservoir<T> {
    slots: Vec<T>,
    /// Min-heap of `(priority, slot index)`.
    heap: BinaryHeap<Reverse<(Priority, usize)>>,
    capacity: usize,
    seen: u64,
}

impl<T: Prioritized> Reservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(4096)),
            heap: BinaryHeap::with_capacity(capacity.min(4096)),
            capacity,
            seen: 0,
        }
    }

    /// Offers an event to the reservoir.
    pub fn offer(&mut self, event: T) -> Offer {
        self.offer_within(event, || true)
    }

    /// Like [`offer`](Self::offer), but a free slot is only used if `reserve`
    /// grants it; otherwise the event competes with the current minimum.
    pub(crate) fn offer_within(&mut self, event: T, reserve: impl FnOnce() -> bool) -> Offer {
        self.seen += 1;
        let priority = event.priority();

        if self.slots.len() < self.capacity && reserve() {
            let slot = self.slots.len();
            self.slots.push(event);
            self.heap.push(Reverse((priority, slot)));
            debug_assert_reservoir_bounded!(self.slots.len(), self.capacity);
            return Offer::Inserted;
        }

        let min = match self.heap.peek() {
            Some(Reverse((min, _))) => *min,
            None => return Offer::Rejected, // zero capacity or no budget
        };
        if priority <= min {
            return Offer::Rejected;
        }

        let victim = self.pop_random_minimum(min);
        self.slots[victim] = event;
        self.heap.push(Reverse((priority, victim)));
        debug_assert_reservoir_bounded!(self.slots.len(), self.capacity);
        Offer::Replaced
    }

    /// Pops every heap entry at priority `min`, keeps one at random as the
    /// victim and pushes the rest back.
    fn pop_random_minimum(&mut self, min: Priority) -> usize {
        let mut ties = Vec::new();
        while let Some(Reverse((p, slot))) = self.heap.peek().copied() {
            if p != min {
                break;
            }
            self.heap.pop();
            ties.push(slot);
        }
        let pick = if ties.len() == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..ties.len())
        };
        let victim = ties.swap_remove(pick);
        for slot in ties {
            self.heap.push(Reverse((min, slot)));
        }
        victim
    }

    /// Empties the reservoir, returning its events (highest priority first)
    /// and the statistics for the window.
    pub fn harvest(&mut self) -> (Vec<T>, SamplingStats) {
        self.heap.clear();
        let mut events = std::mem::take(&mut self.slots);
        events.sort_by(|a, b| b.priority().cmp(&a.priority()));

        let stats = SamplingStats {
            capacity: self.capacity,
            seen: std::mem::take(&mut self.seen),
            kept: events.len() as u64,
        };
        debug_assert_seen_dominates!(stats.seen, stats.kept);
        (events, stats)
    }

    /// Lowest priority currently held.
    pub fn min_priority(&self) -> Option<Priority> {
        self.heap.peek().map(|Reverse((p, _))| *p)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offers seen since the last harvest.
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

impl<T> std::fmt::Debug for Reservoir<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservoir")
            .field("capacity", &self.capacity)
            .field("len", &self.slots.len())
            .field("seen", &self.seen)
            .finish()
    }
}

/// Re-offers `events` from several sources into one reservoir of `capacity`.
///
/// `seen` values are summed rather than recounted: events already dropped by
/// a source still count as seen.
pub fn merge_sampled<T: Prioritized>(
    capacity: usize,
    sources: impl IntoIterator<Item = (Vec<T>, SamplingStats)>,
) -> (Vec<T>, SamplingStats) {
    let mut merged = Reservoir::new(capacity);
    let mut seen = 0;
    for (events, stats) in sources {
        seen += stats.seen;
        for event in events {
            merged.offer(event);
        }
    }
    let (events, _) = merged.harvest();
    let stats = SamplingStats {
        capacity,
        seen,
        kept: events.len() as u64,
    };
    debug_assert_seen_dominates!(stats.seen, stats.kept);
    (events, stats)
}

/// Shared, sharded reservoir safe to offer into from many threads.
pub struct EventReservoir<T> {
    shards: Box<[CachePadded<Mutex<Reservoir<T>>>]>,
    /// Slots in use across all shards; never above `capacity`.
    budget: CachePadded<AtomicUsize>,
    capacity: usize,
}

impl<T: Prioritized> EventReservoir<T> {
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| CachePadded::new(Mutex::new(Reservoir::new(capacity))))
            .collect();
        Self {
            shards,
            budget: CachePadded::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Offers into the calling thread's shard.
    pub fn offer(&self, event: T) -> Offer {
        let shard = &self.shards[shard_index(self.shards.len())];
        shard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offer_within(event, || self.reserve_slot())
    }

    fn reserve_slot(&self) -> bool {
        self.budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.capacity).then_some(used + 1)
            })
            .is_ok()
    }

    /// Swaps out every shard and merges them into at most `capacity` events.
    pub fn harvest(&self) -> (Vec<T>, SamplingStats) {
        let taken: Vec<_> = self
            .shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
                let taken = shard.harvest();
                self.budget.fetch_sub(taken.0.len(), Ordering::AcqRel);
                taken
            })
            .collect();
        merge_sampled(self.capacity, taken)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently held across all shards, at most `capacity`.
    pub fn held(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

impl<T> std::fmt::Debug for EventReservoir<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReservoir")
            .field("capacity", &self.capacity)
            .field("shards", &self.shards.len())
            .finish()
    }
}
