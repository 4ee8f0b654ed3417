//! Transaction traces: the full segment tree of the slowest transaction in a
//! harvest window.

use crate::clock::Timestamp;
use crate::events::Attributes;
use crate::tracer::{FinishedTransaction, Segment};
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// One node of a trace tree.
///
/// Serialized as `[start_offset_ms, end_offset_ms, name, params, children]`,
/// offsets relative to the transaction start.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceNode {
    pub start_offset: Duration,
    pub end_offset: Duration,
    pub name: String,
    pub exclusive: Duration,
    pub children: Vec<TraceNode>,
}

#[derive(Serialize)]
struct NodeParams {
    exclusive_duration_millis: f64,
}

impl Serialize for TraceNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(5)?;
        tuple.serialize_element(&millis(self.start_offset))?;
        tuple.serialize_element(&millis(self.end_offset))?;
        tuple.serialize_element(&self.name)?;
        tuple.serialize_element(&NodeParams {
            exclusive_duration_millis: self.exclusive.as_secs_f64() * 1000.0,
        })?;
        tuple.serialize_element(&self.children)?;
        tuple.end()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A sampled slow transaction.
///
/// Serialized as `[start_ms, duration_ms, name, root, attributes, guid]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionTrace {
    pub start: Timestamp,
    pub duration: Duration,
    pub name: String,
    pub guid: String,
    pub root: TraceNode,
    pub attributes: Attributes,
    /// Segments left out because of the node limit.
    pub truncated: usize,
}

impl TransactionTrace {
    /// Builds the trace tree in pre-order, keeping at most `max_segments` nodes.
    pub fn from_transaction(txn: &FinishedTransaction, max_segments: usize) -> Self {
        let mut budget = max_segments.max(1);
        let root = convert(&txn.root, txn.start, &mut budget);
        let kept = count(&root);
        Self {
            start: txn.start,
            duration: txn.duration,
            name: txn.name.clone(),
            guid: txn.guid.clone(),
            root,
            attributes: txn.attributes.clone(),
            truncated: txn.root.count().saturating_sub(kept),
        }
    }

    pub fn segment_count(&self) -> usize {
        count(&self.root)
    }
}

fn convert(segment: &Segment, origin: Timestamp, budget: &mut usize) -> TraceNode {
    *budget -= 1;
    let mut children = Vec::new();
    for child in &segment.children {
        if *budget == 0 {
            break;
        }
        children.push(convert(child, origin, budget));
    }
    TraceNode {
        start_offset: segment.start.saturating_duration_since(origin),
        end_offset: segment.end.saturating_duration_since(origin),
        name: segment.name.clone(),
        exclusive: segment.exclusive,
        children,
    }
}

fn count(node: &TraceNode) -> usize {
    1 + node.children.iter().map(count).sum::<usize>()
}

impl Serialize for TransactionTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&self.start.as_millis())?;
        tuple.serialize_element(&millis(self.duration))?;
        tuple.serialize_element(&self.name)?;
        tuple.serialize_element(&self.root)?;
        tuple.serialize_element(&self.attributes)?;
        tuple.serialize_element(&self.guid)?;
        tuple.end()
    }
}

/// Keeps the slowest transaction at or above the threshold for each window.
pub struct TransactionSampler {
    enabled: bool,
    threshold: Duration,
    max_segments: usize,
    slowest: Mutex<Option<TransactionTrace>>,
}

impl TransactionSampler {
    pub fn new(enabled: bool, threshold: Duration, max_segments: usize) -> Self {
        Self {
            enabled,
            threshold,
            max_segments,
            slowest: Mutex::new(None),
        }
    }

    /// Returns `true` if `txn` became the window's trace.
    pub fn offer(&self, txn: &FinishedTransaction) -> bool {
        if !self.enabled || txn.duration < self.threshold {
            return false;
        }
        let mut slowest = self.slowest.lock().unwrap_or_else(PoisonError::into_inner);
        if slowest.as_ref().is_some_and(|t| t.duration >= txn.duration) {
            return false;
        }
        *slowest = Some(TransactionTrace::from_transaction(txn, self.max_segments));
        true
    }

    pub fn harvest(&self) -> Option<TransactionTrace> {
        self.slowest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

impl std::fmt::Debug for TransactionSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSampler")
            .field("enabled", &self.enabled)
            .field("threshold", &self.threshold)
            .field("max_segments", &self.max_segments)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::tracer::{TransactionCategory, TransactionTracer};
    use serde_json::json;

    fn transaction(name: &str, children: usize, each: Duration) -> FinishedTransaction {
        let clock = clock::freeze_at(Timestamp::from_secs_f64(100.0));
        let mut txn = TransactionTracer::new(name, TransactionCategory::Web);
        for i in 0..children {
            let seg = txn.begin_segment(&format!("Custom/step{i}")).unwrap();
            clock.advance(each);
            txn.end_segment(seg).unwrap();
        }
        txn.finish()
    }

    #[test]
    fn test_keeps_only_slowest_over_threshold() {
        let sampler = TransactionSampler::new(true, Duration::from_secs(1), 100);
        assert!(!sampler.offer(&transaction("fast", 1, Duration::from_millis(10))));
        assert!(sampler.offer(&transaction("slow", 2, Duration::from_secs(1))));
        assert!(sampler.offer(&transaction("slower", 3, Duration::from_secs(1))));
        assert!(!sampler.offer(&transaction("slow_again", 2, Duration::from_secs(1))));

        let trace = sampler.harvest().unwrap();
        assert_eq!(trace.name, "Controller/slower");
        assert!(sampler.harvest().is_none());
    }

    #[test]
    fn test_trace_is_truncated_at_node_limit() {
        let txn = transaction("big", 10, Duration::from_millis(5));
        let trace = TransactionTrace::from_transaction(&txn, 4);
        assert_eq!(trace.segment_count(), 4);
        assert_eq!(trace.truncated, 7);
    }

    #[test]
    fn test_node_wire_shape() {
        let txn = transaction("shape", 1, Duration::from_millis(250));
        let trace = TransactionTrace::from_transaction(&txn, 100);
        let value = serde_json::to_value(&trace.root).unwrap();
        assert_eq!(
            value,
            json!([
                0,
                250,
                "Controller/shape",
                {"exclusive_duration_millis": 0.0},
                [[0, 250, "Custom/step0", {"exclusive_duration_millis": 250.0}, []]]
            ])
        );
    }
}
