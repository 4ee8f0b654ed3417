//! Event data model: attributes, priorities and the four event kinds.
//!
//! Every event carries an intrinsic map and a custom map; transaction, error
//! and span events add an agent map. On the wire each event is a JSON array
//! of those maps, in that order. All maps are present even when empty.

use crate::config::AttributeLimits;
use crate::error::AttributeError;
use rand::Rng;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Ordered string-keyed attribute map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, AttributeValue>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an agent-controlled attribute without validation.
    pub(crate) fn insert_intrinsic(&mut self, key: &str, value: impl Into<AttributeValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Validates and inserts a user-supplied attribute.
    ///
    /// String values longer than the limit are truncated rather than rejected.
    pub fn try_insert(
        &mut self,
        key: &str,
        value: impl Into<AttributeValue>,
        limits: &AttributeLimits,
    ) -> Result<(), AttributeError> {
        if key.is_empty() {
            return Err(AttributeError::EmptyKey);
        }
        if key.len() > limits.max_key_bytes {
            return Err(AttributeError::KeyTooLong {
                len: key.len(),
                max: limits.max_key_bytes,
            });
        }
        if self.0.len() >= limits.max_custom_attributes && !self.0.contains_key(key) {
            return Err(AttributeError::TooManyAttributes {
                max: limits.max_custom_attributes,
            });
        }
        let value = match value.into() {
            AttributeValue::Float(f) if !f.is_finite() => {
                return Err(AttributeError::NonFiniteNumber)
            }
            AttributeValue::String(s) => {
                AttributeValue::String(truncate_utf8(s, limits.max_value_bytes))
            }
            other => other,
        };
        self.0.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }

    /// Copies entries from `other` that are not already present.
    pub(crate) fn extend_missing(&mut self, other: &Attributes) {
        for (k, v) in &other.0 {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

fn truncate_utf8(mut s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}

/// Sampling priority. Ordinary values are in `[0, 1)`; sampled or errored
/// work is boosted into `[1, 2)` so ordinary traffic can never evict it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(f64);

impl Priority {
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    /// Uniform random priority in `[0, 1)`, truncated to six decimals.
    pub fn random() -> Self {
        let raw: f64 = rand::thread_rng().gen();
        Self((raw * 1e6).floor() / 1e6)
    }

    /// Lifts an ordinary priority above every ordinary priority. Idempotent.
    pub fn boosted(self) -> Self {
        if self.is_boosted() {
            self
        } else {
            Self(self.0 + 1.0)
        }
    }

    pub fn is_boosted(self) -> bool {
        self.0 >= 1.0
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Anything a priority reservoir can hold.
pub trait Prioritized {
    fn priority(&self) -> Priority;
}

/// Which reservoir an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transaction,
    Error,
    Custom,
    Span,
}

/// One finished transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub intrinsics: Attributes,
    pub custom: Attributes,
    pub agent: Attributes,
    pub priority: Priority,
}

/// One noticed error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub intrinsics: Attributes,
    pub custom: Attributes,
    pub agent: Attributes,
    pub priority: Priority,
}

/// A user-submitted event of an arbitrary type.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub intrinsics: Attributes,
    pub custom: Attributes,
    pub priority: Priority,
}

/// One segment of a sampled transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub intrinsics: Attributes,
    pub custom: Attributes,
    pub agent: Attributes,
    pub priority: Priority,
}

macro_rules! impl_prioritized {
    ($($ty:ty),*) => {
        $(impl Prioritized for $ty {
            fn priority(&self) -> Priority {
                self.priority
            }
        })*
    };
}

impl_prioritized!(TransactionEvent, ErrorEvent, CustomEvent, SpanEvent);

macro_rules! impl_three_map_serialize {
    ($($ty:ty),*) => {
        $(impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element(&self.intrinsics)?;
                tuple.serialize_element(&self.custom)?;
                tuple.serialize_element(&self.agent)?;
                tuple.end()
            }
        })*
    };
}

impl_three_map_serialize!(TransactionEvent, ErrorEvent, SpanEvent);

impl Serialize for CustomEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.intrinsics)?;
        tuple.serialize_element(&self.custom)?;
        tuple.end()
    }
}

/// Any event, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Transaction(TransactionEvent),
    Error(ErrorEvent),
    Custom(CustomEvent),
    Span(SpanEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Transaction(_) => EventKind::Transaction,
            Self::Error(_) => EventKind::Error,
            Self::Custom(_) => EventKind::Custom,
            Self::Span(_) => EventKind::Span,
        }
    }

    pub fn intrinsics(&self) -> &Attributes {
        match self {
            Self::Transaction(e) => &e.intrinsics,
            Self::Error(e) => &e.intrinsics,
            Self::Custom(e) => &e.intrinsics,
            Self::Span(e) => &e.intrinsics,
        }
    }

    pub fn custom(&self) -> &Attributes {
        match self {
            Self::Transaction(e) => &e.custom,
            Self::Error(e) => &e.custom,
            Self::Custom(e) => &e.custom,
            Self::Span(e) => &e.custom,
        }
    }
}

impl Prioritized for Event {
    fn priority(&self) -> Priority {
        match self {
            Self::Transaction(e) => e.priority,
            Self::Error(e) => e.priority,
            Self::Custom(e) => e.priority,
            Self::Span(e) => e.priority,
        }
    }
}

impl From<TransactionEvent> for Event {
    fn from(e: TransactionEvent) -> Self {
        Self::Transaction(e)
    }
}

impl From<ErrorEvent> for Event {
    fn from(e: ErrorEvent) -> Self {
        Self::Error(e)
    }
}

impl From<CustomEvent> for Event {
    fn from(e: CustomEvent) -> Self {
        Self::Custom(e)
    }
}

impl From<SpanEvent> for Event {
    fn from(e: SpanEvent) -> Self {
        Self::Span(e)
    }
}

/// Checks a custom event type: non-empty, at most 255 bytes, and only
/// alphanumerics, `_`, `:` or spaces.
pub(crate) fn validate_event_type(event_type: &str) -> Result<(), AttributeError> {
    let valid = !event_type.is_empty()
        && event_type.len() <= 255
        && event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | ' '));
    if valid {
        Ok(())
    } else {
        Err(AttributeError::InvalidEventType(event_type.to_string()))
    }
}
