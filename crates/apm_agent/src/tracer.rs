//! Segment tracer: the per-execution-context stack of open segments.
//!
//! A [`TransactionTracer`] is owned by exactly one execution context and is
//! mutated through `&mut self`, so the hot path takes no locks. Segments live
//! in an arena; parents are referenced by index (a non-owning back link used
//! only for exclusive-time accounting) while children are owned by their
//! parent's child list.
//!
//! Exclusive time is computed when a segment ends:
//!
//! ```text
//! exclusive = total − Σ total(direct children), clamped at zero
//! ```
//!
//! Because every child ends before its parent (strict stack discipline), the
//! exclusive times of a whole tree always sum to the root's total.
//!
//! When the transaction finishes the arena is converted into an owned,
//! immutable [`Segment`] tree inside a [`FinishedTransaction`].
//!
//! The arena is capped by a segment limit. Segments begun past the limit are
//! not recorded: their handles still follow stack discipline, but their time
//! stays in the nearest recorded ancestor's exclusive time.

use crate::clock::{self, Timestamp};
use crate::error::{AttributeError, TracerError};
use crate::errors::NoticedError;
use crate::events::{AttributeValue, Attributes, Priority};
use crate::config::AttributeLimits;
use crate::invariants::{debug_assert_exclusive_bounded, debug_assert_stack_top};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

/// Handle returned by `begin_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    pub(crate) id: TransactionId,
}

impl TransactionHandle {
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

/// Handle returned by `begin_segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle {
    txn: TransactionId,
    /// Arena index; for an unrecorded segment, its nearest recorded ancestor.
    index: usize,
    /// Nesting level among unrecorded segments; 0 for recorded ones.
    overflow: usize,
}

/// Kind of unit of work; decides the transaction name prefix and which
/// intrinsic metrics are recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionCategory {
    /// A serviced request (`Controller/...`).
    Web,
    /// Background work (`OtherTransaction/...`).
    Background,
    /// Any other prefix.
    Custom(String),
}

impl TransactionCategory {
    pub fn prefix(&self) -> &str {
        match self {
            Self::Web => "Controller",
            Self::Background => "OtherTransaction",
            Self::Custom(prefix) => prefix,
        }
    }

    pub fn is_web(&self) -> bool {
        matches!(self, Self::Web)
    }
}

impl From<&str> for TransactionCategory {
    fn from(s: &str) -> Self {
        match s {
            "Controller" | "Web" | "web" => Self::Web,
            "OtherTransaction" | "Background" | "background" => Self::Background,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// `"{prefix}/{name}"`, without doubling a leading slash.
pub(crate) fn qualified_name(category: &TransactionCategory, name: &str) -> String {
    format!("{}/{}", category.prefix(), name.trim_start_matches('/'))
}

struct SegmentNode {
    name: String,
    guid: String,
    start: Timestamp,
    end: Option<Timestamp>,
    /// Back link into the arena; `None` for the root.
    parent: Option<usize>,
    children: Vec<usize>,
    /// Σ total(direct children) accumulated as children end.
    children_total: Duration,
    exclusive: Duration,
}

impl SegmentNode {
    fn new(name: String, start: Timestamp, parent: Option<usize>) -> Self {
        Self {
            name,
            guid: new_guid(),
            start,
            end: None,
            parent,
            children: Vec::new(),
            children_total: Duration::ZERO,
            exclusive: Duration::ZERO,
        }
    }
}

/// Random 16-hex-digit identifier.
pub(crate) fn new_guid() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn new_trace_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// A finished segment: an owned, immutable tree node.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub guid: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub exclusive: Duration,
    pub children: Vec<Segment>,
}

impl Segment {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    /// Depth-first walk (pre-order) with each node's parent.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Segment, Option<&'a Segment>)) {
        fn go<'a>(
            node: &'a Segment,
            parent: Option<&'a Segment>,
            f: &mut impl FnMut(&'a Segment, Option<&'a Segment>),
        ) {
            f(node, parent);
            for child in &node.children {
                go(child, Some(node), f);
            }
        }
        go(self, None, f);
    }

    /// Number of nodes in this subtree.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Segment::count).sum::<usize>()
    }
}

/// A completed transaction, handed to the aggregator and reservoirs.
#[derive(Debug, Clone)]
pub struct FinishedTransaction {
    pub name: String,
    pub category: TransactionCategory,
    pub guid: String,
    pub trace_id: String,
    pub start: Timestamp,
    pub duration: Duration,
    /// Root segment; its name is the final transaction name.
    pub root: Segment,
    pub attributes: Attributes,
    pub errors: Vec<NoticedError>,
    pub queue_start: Option<Timestamp>,
    pub priority: Priority,
    pub sampled: bool,
    /// Segments that were still open and had to be closed by the flush.
    pub abandoned_segments: usize,
    /// Segments begun past the segment limit and left out of the tree.
    pub dropped_segments: usize,
}

impl FinishedTransaction {
    /// `true` if any noticed error was not expected.
    pub fn is_error(&self) -> bool {
        self.errors.iter().any(|e| !e.description.expected)
    }

    /// Time spent queued before the transaction started, if known.
    pub fn queue_duration(&self) -> Option<Duration> {
        self.queue_start
            .map(|q| self.start.saturating_duration_since(q))
    }
}

/// The active transaction of one execution context.
pub struct TransactionTracer {
    id: TransactionId,
    name: String,
    category: TransactionCategory,
    guid: String,
    trace_id: String,
    nodes: Vec<SegmentNode>,
    /// Indices of open segments; `stack[0]` is the root.
    stack: Vec<usize>,
    attributes: Attributes,
    errors: Vec<NoticedError>,
    queue_start: Option<Timestamp>,
    priority: Priority,
    sampled: bool,
    segment_limit: usize,
    /// Unrecorded segments currently open on top of `stack`.
    overflow_depth: usize,
    dropped_segments: usize,
}

impl TransactionTracer {
    /// Starts a transaction; its root segment opens now.
    pub fn new(name: &str, category: TransactionCategory) -> Self {
        let id = TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed));
        let name = qualified_name(&category, name);
        let root = SegmentNode::new(name.clone(), clock::now(), None);
        Self {
            id,
            name,
            category,
            guid: root.guid.clone(),
            trace_id: new_trace_id(),
            nodes: vec![root],
            stack: vec![0],
            attributes: Attributes::new(),
            errors: Vec::new(),
            queue_start: None,
            priority: Priority::random(),
            sampled: false,
            segment_limit: usize::MAX,
            overflow_depth: 0,
            dropped_segments: 0,
        }
    }

    /// Caps the number of recorded segments, root included.
    pub fn with_segment_limit(mut self, limit: usize) -> Self {
        self.segment_limit = limit.max(1);
        self
    }

    pub fn handle(&self) -> TransactionHandle {
        TransactionHandle { id: self.id }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &TransactionCategory {
        &self.category
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Number of open segments, root included.
    pub fn depth(&self) -> usize {
        self.stack.len() + self.overflow_depth
    }

    /// Segments recorded so far, root included.
    pub fn segment_count(&self) -> usize {
        self.nodes.len()
    }

    /// Opens a segment as a child of the current top of stack.
    pub fn begin_segment(&mut self, name: &str) -> Result<SegmentHandle, TracerError> {
        let parent = *self.stack.last().ok_or(TracerError::NoActiveTransaction)?;
        if self.overflow_depth > 0 || self.nodes.len() >= self.segment_limit {
            self.overflow_depth += 1;
            self.dropped_segments += 1;
            return Ok(SegmentHandle {
                txn: self.id,
                index: parent,
                overflow: self.overflow_depth,
            });
        }
        let index = self.nodes.len();
        self.nodes
            .push(SegmentNode::new(name.to_string(), clock::now(), Some(parent)));
        self.nodes[parent].children.push(index);
        self.stack.push(index);
        Ok(SegmentHandle {
            txn: self.id,
            index,
            overflow: 0,
        })
    }

    /// Closes the segment on top of the stack.
    ///
    /// Fails without touching any state if `handle` is not the top.
    pub fn end_segment(&mut self, handle: SegmentHandle) -> Result<(), TracerError> {
        if handle.txn != self.id {
            return Err(TracerError::TransactionMismatch);
        }
        let top = *self.stack.last().ok_or(TracerError::NoActiveTransaction)?;
        if handle.overflow > 0 || self.overflow_depth > 0 {
            return self.end_unrecorded(handle, top);
        }
        if handle.index == 0 {
            return Err(TracerError::RootSegmentEnd);
        }
        if top != handle.index {
            return Err(TracerError::SegmentStackMismatch {
                expected: self.nodes[top].name.clone(),
                found: self
                    .nodes
                    .get(handle.index)
                    .map_or_else(|| "<unknown>".to_string(), |n| n.name.clone()),
            });
        }
        let popped = self.pop_at(clock::now());
        debug_assert_stack_top!(popped, Some(handle.index));
        Ok(())
    }

    fn end_unrecorded(&mut self, handle: SegmentHandle, top: usize) -> Result<(), TracerError> {
        if handle.overflow == self.overflow_depth && handle.index == top {
            self.overflow_depth -= 1;
            return Ok(());
        }
        let expected = if self.overflow_depth > 0 {
            "<unrecorded segment>".to_string()
        } else {
            self.nodes[top].name.clone()
        };
        let found = if handle.overflow > 0 {
            "<unrecorded segment>".to_string()
        } else {
            self.nodes
                .get(handle.index)
                .map_or_else(|| "<unknown>".to_string(), |n| n.name.clone())
        };
        Err(TracerError::SegmentStackMismatch { expected, found })
    }

    /// Pops the top segment, stamping `end` and computing exclusive time.
    fn pop_at(&mut self, end: Timestamp) -> Option<usize> {
        let index = self.stack.pop()?;
        let node = &mut self.nodes[index];
        let end = end.max(node.start);
        node.end = Some(end);
        let total = end.saturating_duration_since(node.start);
        node.exclusive = total.saturating_sub(node.children_total);
        debug_assert_exclusive_bounded!(node.exclusive, total);

        if let Some(parent) = node.parent {
            self.nodes[parent].children_total += total;
        }
        Some(index)
    }

    /// Handle of the innermost open segment.
    pub fn current_segment(&self) -> Option<SegmentHandle> {
        self.stack.last().map(|&index| SegmentHandle {
            txn: self.id,
            index,
            overflow: self.overflow_depth,
        })
    }

    /// Identifier of the innermost open recorded segment.
    pub fn current_span_id(&self) -> Option<&str> {
        self.stack.last().map(|&i| self.nodes[i].guid.as_str())
    }

    /// Renames the transaction. The last call before finishing wins.
    pub fn set_name(&mut self, name: &str, category: TransactionCategory) {
        self.name = qualified_name(&category, name);
        self.category = category;
    }

    pub fn add_attribute(
        &mut self,
        key: &str,
        value: impl Into<AttributeValue>,
        limits: &AttributeLimits,
    ) -> Result<(), AttributeError> {
        self.attributes.try_insert(key, value, limits)
    }

    pub fn set_queue_start(&mut self, at: Timestamp) {
        self.queue_start = Some(at);
    }

    /// Marks the transaction sampled and lifts its priority.
    pub fn force_sample(&mut self) {
        self.sampled = true;
        self.priority = self.priority.boosted();
    }

    pub(crate) fn notice_error(&mut self, mut error: NoticedError) {
        error.span_id = self.current_span_id().map(str::to_string);
        if !error.description.expected {
            self.priority = self.priority.boosted();
        }
        self.errors.push(error);
    }

    /// Ends the transaction, closing every still-open segment innermost-first
    /// at the current time.
    pub fn finish(self) -> FinishedTransaction {
        self.finish_at(clock::now())
    }

    pub(crate) fn finish_at(mut self, end: Timestamp) -> FinishedTransaction {
        let abandoned_segments = self.stack.len().saturating_sub(1) + self.overflow_depth;
        self.overflow_depth = 0;
        while self.pop_at(end).is_some() {}
        self.nodes[0].name.clone_from(&self.name);

        let mut slots: Vec<Option<SegmentNode>> = self.nodes.into_iter().map(Some).collect();
        let root = build_tree(&mut slots, 0).unwrap_or_else(|| Segment {
            name: self.name.clone(),
            guid: self.guid.clone(),
            start: end,
            end,
            exclusive: Duration::ZERO,
            children: Vec::new(),
        });
        FinishedTransaction {
            name: self.name,
            category: self.category,
            guid: self.guid,
            trace_id: self.trace_id,
            start: root.start,
            duration: root.duration(),
            root,
            attributes: self.attributes,
            errors: self.errors,
            queue_start: self.queue_start,
            priority: self.priority,
            sampled: self.sampled,
            abandoned_segments,
            dropped_segments: self.dropped_segments,
        }
    }
}

/// Moves arena nodes into an owned tree. Children always have larger
/// indices than their parent, so every slot is taken exactly once.
fn build_tree(slots: &mut [Option<SegmentNode>], index: usize) -> Option<Segment> {
    let node = slots.get_mut(index)?.take()?;
    let children = node
        .children
        .iter()
        .filter_map(|&child| build_tree(slots, child))
        .collect();
    Some(Segment {
        name: node.name,
        guid: node.guid,
        start: node.start,
        end: node.end.unwrap_or(node.start),
        exclusive: node.exclusive,
        children,
    })
}

impl std::fmt::Debug for TransactionTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTracer")
            .field("name", &self.name)
            .field("depth", &self.stack.len())
            .field("segments", &self.nodes.len())
            .field("dropped", &self.dropped_segments)
            .finish()
    }
}
