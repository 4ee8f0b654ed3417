//! Transaction recorder: turns finished transactions into metrics, events,
//! traces and error traces.
//!
//! The recorder owns every process-wide structure the hot path writes to.
//! Everything here takes `&self`; the shared structures do their own
//! sharded locking, so recording from many threads never funnels through a
//! single lock.

use crate::clock::{self, Timestamp};
use crate::config::AgentConfig;
use crate::error::AttributeError;
use crate::errors::{ErrorCollector, ErrorDescription, ErrorTrace, NoticedError};
use crate::events::{
    validate_event_type, AttributeValue, Attributes, CustomEvent, ErrorEvent, Priority, SpanEvent,
    TransactionEvent,
};
use crate::metrics::{ApdexZone, MetricAggregator};
use crate::reservoir::EventReservoir;
use crate::sampler::AdaptiveSampler;
use crate::trace::TransactionSampler;
use crate::tracer::{FinishedTransaction, Segment, TransactionCategory, TransactionTracer};
use tracing::debug;

/// Transaction name used for errors noticed outside any transaction.
pub const UNKNOWN_TRANSACTION: &str = "Unknown";

/// Shared sink for finished work.
pub struct TransactionRecorder {
    pub(crate) config: AgentConfig,
    pub(crate) metrics: MetricAggregator,
    pub(crate) transaction_events: EventReservoir<TransactionEvent>,
    pub(crate) custom_events: EventReservoir<CustomEvent>,
    pub(crate) error_events: EventReservoir<ErrorEvent>,
    pub(crate) span_events: EventReservoir<SpanEvent>,
    pub(crate) traces: TransactionSampler,
    pub(crate) errors: ErrorCollector,
    pub(crate) sampler: AdaptiveSampler,
}

impl TransactionRecorder {
    pub fn new(config: AgentConfig) -> Self {
        let shards = config.reservoirs.shards.max(1);
        let r = &config.reservoirs;
        Self {
            metrics: MetricAggregator::new(shards),
            transaction_events: EventReservoir::new(r.transaction_events, shards),
            custom_events: EventReservoir::new(r.custom_events, shards),
            error_events: EventReservoir::new(r.error_events, shards),
            span_events: EventReservoir::new(r.span_events, shards),
            traces: TransactionSampler::new(
                config.transaction_tracer.enabled,
                config.trace_threshold(),
                config.transaction_tracer.max_segments,
            ),
            errors: ErrorCollector::new(config.error_collector.clone()),
            sampler: AdaptiveSampler::new(config.sampling.target, config.sampling.window),
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricAggregator {
        &self.metrics
    }

    /// Opens a tracer with the sampling decision already made, so events
    /// recorded during the transaction carry its final priority.
    pub fn start_transaction(&self, name: &str, category: TransactionCategory) -> TransactionTracer {
        let mut tracer = TransactionTracer::new(name, category)
            .with_segment_limit(self.config.transaction_tracer.max_tracked_segments);
        if self.sampler.compute_sampled() {
            tracer.force_sample();
        }
        tracer
    }

    /// Records everything derived from one finished transaction.
    pub fn record(&self, mut txn: FinishedTransaction) {
        if txn.sampled || txn.is_error() {
            txn.priority = txn.priority.boosted();
        }
        if txn.abandoned_segments > 0 {
            debug!(
                transaction = %txn.name,
                open_segments = txn.abandoned_segments,
                "transaction ended with open segments"
            );
        }
        if txn.dropped_segments > 0 {
            debug!(
                transaction = %txn.name,
                dropped = txn.dropped_segments,
                "segment limit reached"
            );
        }

        self.record_metrics(&txn);
        self.record_errors(&txn);
        self.transaction_events.offer(transaction_event(&txn));
        if txn.sampled && self.config.sampling.span_events_enabled {
            for span in span_events(&txn) {
                self.span_events.offer(span);
            }
        }
        self.traces.offer(&txn);
    }

    fn record_metrics(&self, txn: &FinishedTransaction) {
        let m = &self.metrics;
        let name = txn.name.as_str();

        m.record(name, None, txn.duration, txn.root.exclusive);

        txn.root.walk(&mut |segment, parent| {
            if parent.is_none() {
                return;
            }
            let total = segment.duration();
            if segment.name == name {
                let nested = format!("Nested/{}", segment.name);
                m.record_scoped_and_unscoped(&nested, name, total, segment.exclusive);
            } else {
                m.record_scoped_and_unscoped(&segment.name, name, total, segment.exclusive);
            }
            if let Some(rollup) = self.config.rollup_for(&segment.name) {
                m.record_rollup(rollup, segment.exclusive);
            }
        });

        match txn.category {
            TransactionCategory::Web => {
                m.record("HttpDispatcher", None, txn.duration, txn.duration);
                let zone = ApdexZone::classify(txn.duration, self.config.apdex_t, txn.is_error());
                m.record_apdex("Apdex", zone, self.config.apdex_t);
                let short = name.strip_prefix("Controller/").unwrap_or(name);
                m.record_apdex(&format!("Apdex/{short}"), zone, self.config.apdex_t);
            }
            TransactionCategory::Background => {
                m.record("OtherTransaction/all", None, txn.duration, txn.root.exclusive);
            }
            TransactionCategory::Custom(_) => {}
        }

        if let Some(queued) = txn.queue_duration() {
            m.record("WebFrontend/QueueTime", None, queued, queued);
        }
    }

    fn record_errors(&self, txn: &FinishedTransaction) {
        for error in &txn.errors {
            if !error.description.expected {
                self.record_error_metrics(Some(txn));
            }
            self.errors.record(ErrorTrace::from_noticed(error, &txn.name));
            self.error_events.offer(error_event(error, Some(txn), txn.priority));
        }
    }

    fn record_error_metrics(&self, txn: Option<&FinishedTransaction>) {
        let m = &self.metrics;
        m.record_count("Errors/all", 1);
        match txn {
            Some(txn) => {
                let split = if txn.category.is_web() {
                    "Errors/allWeb"
                } else {
                    "Errors/allOther"
                };
                m.record_count(split, 1);
                m.record_count(&format!("Errors/{}", txn.name), 1);
            }
            None => m.record_count("Errors/allOther", 1),
        }
    }

    /// Records an error noticed with no active transaction.
    pub(crate) fn record_standalone_error(&self, error: &NoticedError) {
        if !error.description.expected {
            self.record_error_metrics(None);
        }
        self.errors
            .record(ErrorTrace::from_noticed(error, UNKNOWN_TRANSACTION));
        self.error_events
            .offer(error_event(error, None, Priority::random()));
    }

    /// Applies the collector's class lists; `None` when the error is ignored.
    pub(crate) fn classify_error(&self, description: ErrorDescription) -> Option<ErrorDescription> {
        self.errors.classify(description)
    }

    /// Validates and stores a user-submitted event.
    pub(crate) fn record_custom_event<K, V>(
        &self,
        event_type: &str,
        attributes: impl IntoIterator<Item = (K, V)>,
        priority: Priority,
    ) -> Result<(), AttributeError>
    where
        K: AsRef<str>,
        V: Into<AttributeValue>,
    {
        validate_event_type(event_type)?;
        let mut custom = Attributes::new();
        for (key, value) in attributes {
            custom.try_insert(key.as_ref(), value, &self.config.attributes)?;
        }

        let mut intrinsics = Attributes::new();
        intrinsics.insert_intrinsic("type", event_type);
        intrinsics.insert_intrinsic("timestamp", secs_i64(clock::now()));
        self.custom_events.offer(CustomEvent {
            intrinsics,
            custom,
            priority,
        });
        Ok(())
    }

    pub(crate) fn record_metric(&self, name: &str, value: f64) {
        self.metrics.record_value(name, value);
    }
}

impl std::fmt::Debug for TransactionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRecorder")
            .field("app_name", &self.config.app_name)
            .field("metrics", &self.metrics)
            .field("transaction_events", &self.transaction_events)
            .field("error_events", &self.error_events)
            .finish_non_exhaustive()
    }
}

fn secs_i64(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_secs()).unwrap_or(i64::MAX)
}

fn millis_i64(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

fn transaction_event(txn: &FinishedTransaction) -> TransactionEvent {
    let mut i = Attributes::new();
    i.insert_intrinsic("type", "Transaction");
    i.insert_intrinsic("timestamp", txn.start.as_secs_f64());
    i.insert_intrinsic("name", txn.name.as_str());
    i.insert_intrinsic("duration", txn.duration.as_secs_f64());
    i.insert_intrinsic("error", txn.is_error());
    i.insert_intrinsic("priority", txn.priority.value());
    if let Some(queued) = txn.queue_duration() {
        i.insert_intrinsic("queueDuration", queued.as_secs_f64());
    }
    TransactionEvent {
        intrinsics: i,
        custom: txn.attributes.clone(),
        agent: Attributes::new(),
        priority: txn.priority,
    }
}

fn error_event(
    error: &NoticedError,
    txn: Option<&FinishedTransaction>,
    priority: Priority,
) -> ErrorEvent {
    let d = &error.description;
    let mut i = Attributes::new();
    i.insert_intrinsic("type", "TransactionError");
    i.insert_intrinsic("error.class", d.class.as_str());
    i.insert_intrinsic("error.message", d.message.as_str());
    i.insert_intrinsic("error.expected", d.expected);
    i.insert_intrinsic("timestamp", error.timestamp.as_secs_f64());
    i.insert_intrinsic("priority", priority.value());
    if let Some(span_id) = &error.span_id {
        i.insert_intrinsic("spanId", span_id.as_str());
    }

    let mut custom = error.attributes.clone();
    match txn {
        Some(txn) => {
            i.insert_intrinsic("transactionName", txn.name.as_str());
            i.insert_intrinsic("duration", txn.duration.as_secs_f64());
            custom.extend_missing(&txn.attributes);
        }
        None => i.insert_intrinsic("transactionName", UNKNOWN_TRANSACTION),
    }
    ErrorEvent {
        intrinsics: i,
        custom,
        agent: Attributes::new(),
        priority,
    }
}

fn span_events(txn: &FinishedTransaction) -> Vec<SpanEvent> {
    let mut spans = Vec::with_capacity(txn.root.count());
    txn.root.walk(&mut |segment: &Segment, parent: Option<&Segment>| {
        let mut i = Attributes::new();
        i.insert_intrinsic("type", "Span");
        i.insert_intrinsic("traceId", txn.trace_id.as_str());
        i.insert_intrinsic("guid", segment.guid.as_str());
        i.insert_intrinsic("transactionId", txn.guid.as_str());
        i.insert_intrinsic("sampled", txn.sampled);
        i.insert_intrinsic("priority", txn.priority.value());
        i.insert_intrinsic("timestamp", millis_i64(segment.start));
        i.insert_intrinsic("duration", segment.duration().as_secs_f64());
        i.insert_intrinsic("name", segment.name.as_str());
        i.insert_intrinsic("category", "generic");
        match parent {
            Some(parent) => i.insert_intrinsic("parentId", parent.guid.as_str()),
            None => i.insert_intrinsic("nr.entryPoint", true),
        }
        spans.push(SpanEvent {
            intrinsics: i,
            custom: Attributes::new(),
            agent: Attributes::new(),
            priority: txn.priority,
        });
    });
    spans
}

/// Parses a request-queue header value into the time the request was queued.
///
/// Accepts `t=<value>` or a bare number, in seconds, milliseconds or
/// microseconds since the epoch (the unit is inferred from magnitude).
pub fn parse_queue_start(header: &str) -> Option<Timestamp> {
    // Anything past ~year 5138 in seconds is taken as a finer unit.
    const SECS_CUTOFF: f64 = 1e11;

    let raw = header.trim();
    let raw = raw.strip_prefix("t=").unwrap_or(raw).trim();
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let secs = if value > SECS_CUTOFF * 1e3 {
        value / 1e6
    } else if value > SECS_CUTOFF {
        value / 1e3
    } else {
        value
    };
    Some(Timestamp::from_secs_f64(secs))
}
