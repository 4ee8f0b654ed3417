//! Noticed application errors and the bounded error-trace collector.
//!
//! Application failures are data, not agent failures: noticing one never
//! changes the host's control flow.

use crate::clock::{self, Timestamp};
use crate::config::ErrorCollectorConfig;
use crate::events::Attributes;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// What the host reports about a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescription {
    pub class: String,
    pub message: String,
    /// Expected errors are reported but do not mark the transaction errored.
    pub expected: bool,
}

impl ErrorDescription {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            expected: false,
        }
    }

    /// Describes any `std::error::Error`, using the short type name as class.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }

    pub fn with_expected(mut self, expected: bool) -> Self {
        self.expected = expected;
        self
    }
}

/// `core::num::ParseIntError` → `ParseIntError`; generic arguments are dropped.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// An error captured by the agent, waiting to be turned into an event.
#[derive(Debug, Clone)]
pub struct NoticedError {
    pub description: ErrorDescription,
    pub timestamp: Timestamp,
    pub attributes: Attributes,
    /// Innermost open segment when the error was noticed.
    pub span_id: Option<String>,
}

impl NoticedError {
    pub fn new(description: ErrorDescription, attributes: Attributes) -> Self {
        Self {
            description,
            timestamp: clock::now(),
            attributes,
            span_id: None,
        }
    }
}

/// One error trace on the `error_data` endpoint.
///
/// Serialized as `[timestamp_ms, transaction_name, message, class, params]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTrace {
    pub timestamp: Timestamp,
    pub transaction_name: String,
    pub message: String,
    pub class: String,
    pub expected: bool,
    pub attributes: Attributes,
}

impl ErrorTrace {
    pub fn from_noticed(error: &NoticedError, transaction_name: &str) -> Self {
        Self {
            timestamp: error.timestamp,
            transaction_name: transaction_name.to_string(),
            message: error.description.message.clone(),
            class: error.description.class.clone(),
            expected: error.description.expected,
            attributes: error.attributes.clone(),
        }
    }
}

#[derive(Serialize)]
struct TraceParams<'a> {
    #[serde(rename = "userAttributes")]
    user: &'a Attributes,
    intrinsics: TraceIntrinsics,
}

#[derive(Serialize)]
struct TraceIntrinsics {
    #[serde(rename = "error.expected")]
    expected: bool,
}

impl Serialize for ErrorTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(5)?;
        tuple.serialize_element(&self.timestamp.as_millis())?;
        tuple.serialize_element(&self.transaction_name)?;
        tuple.serialize_element(&self.message)?;
        tuple.serialize_element(&self.class)?;
        tuple.serialize_element(&TraceParams {
            user: &self.attributes,
            intrinsics: TraceIntrinsics {
                expected: self.expected,
            },
        })?;
        tuple.end()
    }
}

/// Error traces for one harvest window, capped at `max_traces`.
pub struct ErrorCollector {
    config: ErrorCollectorConfig,
    traces: Mutex<Vec<ErrorTrace>>,
    dropped: AtomicU64,
}

impl ErrorCollector {
    pub fn new(config: ErrorCollectorConfig) -> Self {
        Self {
            config,
            traces: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Applies the ignore and expected class lists. `None` means drop.
    pub fn classify(&self, mut description: ErrorDescription) -> Option<ErrorDescription> {
        if !self.config.enabled || self.config.ignore_classes.contains(&description.class) {
            return None;
        }
        if self.config.expected_classes.contains(&description.class) {
            description.expected = true;
        }
        Some(description)
    }

    /// Keeps the trace unless the window is already full.
    pub fn record(&self, trace: ErrorTrace) -> bool {
        let mut traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        if traces.len() >= self.config.max_traces {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        traces.push(trace);
        true
    }

    pub fn harvest(&self) -> Vec<ErrorTrace> {
        let mut traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *traces)
    }

    pub fn max_traces(&self) -> usize {
        self.config.max_traces
    }

    /// Traces rejected because the window was full, since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ErrorCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = self
            .traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ErrorCollector")
            .field("held", &held)
            .field("max_traces", &self.config.max_traces)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trace(name: &str) -> ErrorTrace {
        ErrorTrace::from_noticed(
            &NoticedError::new(ErrorDescription::new("RuntimeError", "boom"), Attributes::new()),
            name,
        )
    }

    #[test]
    fn test_from_error_uses_short_type_name() {
        let err = "x".parse::<u32>().unwrap_err();
        let desc = ErrorDescription::from_error(&err);
        assert_eq!(desc.class, "ParseIntError");
        assert!(!desc.expected);
    }

    #[test]
    fn test_classify_ignores_and_marks_expected() {
        let collector = ErrorCollector::new(ErrorCollectorConfig {
            ignore_classes: vec!["NotFound".into()],
            expected_classes: vec!["Timeout".into()],
            ..ErrorCollectorConfig::default()
        });
        assert!(collector.classify(ErrorDescription::new("NotFound", "")).is_none());
        assert!(collector.classify(ErrorDescription::new("Timeout", "")).unwrap().expected);
        assert!(!collector.classify(ErrorDescription::new("Other", "")).unwrap().expected);
    }

    #[test]
    fn test_collector_is_bounded_per_window() {
        let collector = ErrorCollector::new(ErrorCollectorConfig {
            max_traces: 2,
            ..ErrorCollectorConfig::default()
        });
        assert!(collector.record(trace("a")));
        assert!(collector.record(trace("b")));
        assert!(!collector.record(trace("c")));
        assert_eq!(collector.dropped(), 1);

        assert_eq!(collector.harvest().len(), 2);
        assert!(collector.record(trace("d")));
    }

    #[test]
    fn test_error_trace_wire_shape() {
        let t = ErrorTrace {
            timestamp: Timestamp::from_secs_f64(2.5),
            transaction_name: "Controller/users/show".into(),
            message: "boom".into(),
            class: "RuntimeError".into(),
            expected: false,
            attributes: Attributes::new(),
        };
        assert_eq!(
            serde_json::to_value(&t).unwrap(),
            json!([
                2500,
                "Controller/users/show",
                "boom",
                "RuntimeError",
                {"userAttributes": {}, "intrinsics": {"error.expected": false}}
            ])
        );
    }
}
