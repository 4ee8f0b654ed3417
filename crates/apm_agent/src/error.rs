//! Error types for the instrumentation-facing API.

use thiserror::Error;

/// Violations of the begin/end contract the instrumentation layer must follow.
///
/// These are surfaced to the caller and never corrected silently: exclusive
/// time for every ancestor depends on strict stack discipline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TracerError {
    /// A segment or transaction operation was issued with no active transaction.
    #[error("no active transaction in this execution context")]
    NoActiveTransaction,

    /// `begin_transaction` was called while another transaction is active.
    #[error("a transaction is already active in this execution context")]
    TransactionAlreadyActive,

    /// The segment being ended is not the top of the segment stack.
    #[error("segment stack mismatch: expected `{expected}` on top, got `{found}`")]
    SegmentStackMismatch { expected: String, found: String },

    /// The handle belongs to a different transaction.
    #[error("handle does not belong to the active transaction")]
    TransactionMismatch,

    /// The root segment is closed by `end_transaction`, not `end_segment`.
    #[error("the root segment can only be ended by ending the transaction")]
    RootSegmentEnd,

    /// An attribute was rejected.
    #[error(transparent)]
    Attribute(#[from] AttributeError),
}

impl TracerError {
    /// Returns `true` for stack-discipline violations (as opposed to bad input).
    #[inline]
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, Self::Attribute(_))
    }
}

/// Reasons an attribute or event type is rejected at insertion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    #[error("attribute key is empty")]
    EmptyKey,

    #[error("attribute key is {len} bytes, limit is {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("attribute limit of {max} reached")]
    TooManyAttributes { max: usize },

    #[error("numeric attribute value is not finite")]
    NonFiniteNumber,

    #[error("invalid event type `{0}`")]
    InvalidEventType(String),
}
