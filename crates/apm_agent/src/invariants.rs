//! Debug assertion macros for pipeline invariants.
//!
//! Only active in debug builds (`debug_assert!`), so release builds pay nothing.

// =============================================================================
// INV-SEG-01: Exclusive Time Bounded By Total
// =============================================================================

/// Assert that a segment's exclusive time never exceeds its total time.
///
/// **Invariant**: `0 ≤ exclusive ≤ total`
///
/// Used in: `TransactionTracer::end_segment()` and the abnormal-termination flush
macro_rules! debug_assert_exclusive_bounded {
    ($exclusive:expr, $total:expr) => {
        debug_assert!(
            $exclusive <= $total,
            "INV-SEG-01 violated: exclusive {:?} exceeds total {:?}",
            $exclusive,
            $total
        )
    };
}

// =============================================================================
// INV-SEG-02: Stack Discipline
// =============================================================================

/// Assert that the segment being popped is the one on top of the stack.
///
/// **Invariant**: `end_segment(h) → stack.top == h`
macro_rules! debug_assert_stack_top {
    ($popped:expr, $expected:expr) => {
        debug_assert!(
            $popped == $expected,
            "INV-SEG-02 violated: popped segment {:?} but expected {:?}",
            $popped,
            $expected
        )
    };
}

// =============================================================================
// INV-RSV-01: Bounded Reservoir
// =============================================================================

/// Assert that a reservoir never holds more than its capacity.
///
/// **Invariant**: `len ≤ capacity`
macro_rules! debug_assert_reservoir_bounded {
    ($len:expr, $capacity:expr) => {
        debug_assert!(
            $len <= $capacity,
            "INV-RSV-01 violated: reservoir holds {} events, capacity {}",
            $len,
            $capacity
        )
    };
}

// =============================================================================
// INV-RSV-02: Seen Dominates Kept
// =============================================================================

/// **Invariant**: `sampling_stats.seen ≥ sampling_stats.kept`
macro_rules! debug_assert_seen_dominates {
    ($seen:expr, $kept:expr) => {
        debug_assert!(
            $seen >= $kept,
            "INV-RSV-02 violated: kept {} events but only saw {}",
            $kept,
            $seen
        )
    };
}

// =============================================================================
// INV-MET-01: Non-empty Accumulator
// =============================================================================

/// Assert that a timed accumulator has at least one call once present.
///
/// **Invariant**: `present(key) → call_count ≥ 1`
macro_rules! debug_assert_accumulator_populated {
    ($stats:expr) => {
        debug_assert!(
            $stats.call_count >= 1,
            "INV-MET-01 violated: accumulator present with call_count {}",
            $stats.call_count
        )
    };
}

pub(crate) use debug_assert_accumulator_populated;
pub(crate) use debug_assert_exclusive_bounded;
pub(crate) use debug_assert_reservoir_bounded;
pub(crate) use debug_assert_seen_dominates;
pub(crate) use debug_assert_stack_top;
