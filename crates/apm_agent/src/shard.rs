//! Thread-affine shard selection for the shared aggregation structures.

use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Assigned round-robin the first time a thread records anything.
    static THREAD_SLOT: usize = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

/// Shard for the calling thread, stable for the thread's lifetime.
#[inline]
pub(crate) fn shard_index(shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    THREAD_SLOT.with(|slot| *slot % shard_count)
}
