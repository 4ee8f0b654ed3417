//! Agent configuration.
//!
//! Every section has a `Default` matching the collector's usual limits and
//! derives serde so a host can load it from whatever format it already uses.

use crate::harvest::DataType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Application name reported to the collector.
    pub app_name: String,
    /// Agent run identifier, first element of every payload.
    pub run_id: String,
    /// Apdex threshold T.
    pub apdex_t: Duration,
    pub harvest: HarvestConfig,
    pub reservoirs: ReservoirConfig,
    pub transaction_tracer: TransactionTracerConfig,
    pub error_collector: ErrorCollectorConfig,
    pub sampling: SamplingConfig,
    pub attributes: AttributeLimits,
    /// Segment-name prefixes that roll up into a category-wide metric.
    /// First matching prefix wins.
    pub rollups: Vec<RollupRule>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_name: "My Application".to_string(),
            run_id: String::new(),
            apdex_t: Duration::from_millis(500),
            harvest: HarvestConfig::default(),
            reservoirs: ReservoirConfig::default(),
            transaction_tracer: TransactionTracerConfig::default(),
            error_collector: ErrorCollectorConfig::default(),
            sampling: SamplingConfig::default(),
            attributes: AttributeLimits::default(),
            rollups: vec![
                RollupRule::new("Middleware/", "Middleware/all"),
                RollupRule::new("Datastore/", "Datastore/all"),
                RollupRule::new("External/", "External/all"),
            ],
        }
    }
}

impl AgentConfig {
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_apdex_t(mut self, apdex_t: Duration) -> Self {
        self.apdex_t = apdex_t;
        self
    }

    pub fn with_harvest(mut self, harvest: HarvestConfig) -> Self {
        self.harvest = harvest;
        self
    }

    pub fn with_reservoirs(mut self, reservoirs: ReservoirConfig) -> Self {
        self.reservoirs = reservoirs;
        self
    }

    pub fn with_transaction_tracer(mut self, tracer: TransactionTracerConfig) -> Self {
        self.transaction_tracer = tracer;
        self
    }

    pub fn with_error_collector(mut self, errors: ErrorCollectorConfig) -> Self {
        self.error_collector = errors;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Effective transaction trace threshold (4 × apdex_t unless set).
    pub fn trace_threshold(&self) -> Duration {
        self.transaction_tracer
            .threshold
            .unwrap_or(self.apdex_t * 4)
    }

    /// Rollup metric for a segment name, if any prefix matches.
    pub fn rollup_for(&self, segment_name: &str) -> Option<&str> {
        self.rollups
            .iter()
            .find(|rule| segment_name.starts_with(rule.prefix.as_str()))
            .map(|rule| rule.rollup.as_str())
    }
}

/// A segment-name prefix and the unscoped metric it rolls into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupRule {
    pub prefix: String,
    pub rollup: String,
}

impl RollupRule {
    pub fn new(prefix: impl Into<String>, rollup: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            rollup: rollup.into(),
        }
    }
}

/// Harvest periods and delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub metrics_period: Duration,
    pub transaction_traces_period: Duration,
    pub error_traces_period: Duration,
    pub transaction_events_period: Duration,
    pub custom_events_period: Duration,
    pub error_events_period: Duration,
    pub span_events_period: Duration,
    /// Upper bound on a single `deliver` call.
    pub delivery_timeout: Duration,
    /// Consecutive fatal failures before a data type is deactivated.
    pub max_consecutive_fatal: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            metrics_period: Duration::from_secs(60),
            transaction_traces_period: Duration::from_secs(60),
            error_traces_period: Duration::from_secs(60),
            transaction_events_period: Duration::from_secs(5),
            custom_events_period: Duration::from_secs(5),
            error_events_period: Duration::from_secs(5),
            span_events_period: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(10),
            max_consecutive_fatal: 3,
        }
    }
}

impl HarvestConfig {
    /// Creates a configuration where every data type shares `period`.
    pub fn uniform(period: Duration) -> Self {
        Self {
            metrics_period: period,
            transaction_traces_period: period,
            error_traces_period: period,
            transaction_events_period: period,
            custom_events_period: period,
            error_events_period: period,
            span_events_period: period,
            ..Self::default()
        }
    }

    pub fn period(&self, data_type: DataType) -> Duration {
        match data_type {
            DataType::Metrics => self.metrics_period,
            DataType::TransactionTraces => self.transaction_traces_period,
            DataType::ErrorTraces => self.error_traces_period,
            DataType::TransactionEvents => self.transaction_events_period,
            DataType::CustomEvents => self.custom_events_period,
            DataType::ErrorEvents => self.error_events_period,
            DataType::SpanEvents => self.span_events_period,
        }
    }

    pub fn with_period(mut self, data_type: DataType, period: Duration) -> Self {
        let slot = match data_type {
            DataType::Metrics => &mut self.metrics_period,
            DataType::TransactionTraces => &mut self.transaction_traces_period,
            DataType::ErrorTraces => &mut self.error_traces_period,
            DataType::TransactionEvents => &mut self.transaction_events_period,
            DataType::CustomEvents => &mut self.custom_events_period,
            DataType::ErrorEvents => &mut self.error_events_period,
            DataType::SpanEvents => &mut self.span_events_period,
        };
        *slot = period;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_max_consecutive_fatal(mut self, max: u32) -> Self {
        self.max_consecutive_fatal = max;
        self
    }
}

/// Capacities of the four event reservoirs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservoirConfig {
    pub transaction_events: usize,
    pub custom_events: usize,
    pub error_events: usize,
    pub span_events: usize,
    /// Thread-affine shards per reservoir. Shards share one slot budget of
    /// the reservoir's capacity and are merged by priority at harvest.
    pub shards: usize,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            transaction_events: 1200,
            custom_events: 1200,
            error_events: 100,
            span_events: 2000,
            shards: default_shards(),
        }
    }
}

impl ReservoirConfig {
    /// Capacity for an event data type; zero for non-event types.
    pub fn capacity(&self, data_type: DataType) -> usize {
        match data_type {
            DataType::TransactionEvents => self.transaction_events,
            DataType::CustomEvents => self.custom_events,
            DataType::ErrorEvents => self.error_events,
            DataType::SpanEvents => self.span_events,
            _ => 0,
        }
    }

    /// Uses `capacity` for every event type.
    pub fn uniform(capacity: usize) -> Self {
        Self {
            transaction_events: capacity,
            custom_events: capacity,
            error_events: capacity,
            span_events: capacity,
            ..Self::default()
        }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }
}

pub(crate) fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4)
}

/// Transaction trace (slow transaction sample) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionTracerConfig {
    pub enabled: bool,
    /// Minimum duration for a trace; `None` means 4 × apdex_t.
    pub threshold: Option<Duration>,
    /// Segment nodes kept in one trace; deeper work is dropped from the tree.
    pub max_segments: usize,
    /// Segments recorded per transaction. Time spent in segments past the
    /// limit is charged to the nearest recorded ancestor.
    pub max_tracked_segments: usize,
}

impl Default for TransactionTracerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: None,
            max_segments: 2000,
            max_tracked_segments: 10_000,
        }
    }
}

/// Error trace and error event settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCollectorConfig {
    pub enabled: bool,
    /// Error traces kept per harvest.
    pub max_traces: usize,
    /// Error classes dropped entirely.
    pub ignore_classes: Vec<String>,
    /// Error classes reported with `error.expected = true`; they do not
    /// mark the transaction as errored.
    pub expected_classes: Vec<String>,
}

impl Default for ErrorCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_traces: 20,
            ignore_classes: Vec::new(),
            expected_classes: Vec::new(),
        }
    }
}

/// Adaptive sampling and span event settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Transactions marked sampled per window.
    pub target: u64,
    pub window: Duration,
    pub span_events_enabled: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            target: 10,
            window: Duration::from_secs(60),
            span_events_enabled: true,
        }
    }
}

/// Limits applied to user-supplied attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeLimits {
    pub max_key_bytes: usize,
    /// Longer string values are truncated on a char boundary.
    pub max_value_bytes: usize,
    pub max_custom_attributes: usize,
}

impl Default for AttributeLimits {
    fn default() -> Self {
        Self {
            max_key_bytes: 255,
            max_value_bytes: 255,
            max_custom_attributes: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_threshold_defaults_to_four_apdex() {
        let config = AgentConfig::default().with_apdex_t(Duration::from_millis(250));
        assert_eq!(config.trace_threshold(), Duration::from_secs(1));
    }

    #[test]
    fn test_rollup_first_match_wins() {
        let mut config = AgentConfig::default();
        config
            .rollups
            .insert(0, RollupRule::new("Middleware/Rack/", "Rack/all"));

        assert_eq!(config.rollup_for("Middleware/Rack/One/call"), Some("Rack/all"));
        assert_eq!(config.rollup_for("Middleware/Sinatra/x"), Some("Middleware/all"));
        assert_eq!(config.rollup_for("Custom/thing"), None);
    }

    #[test]
    fn test_periods_are_independent() {
        let harvest = HarvestConfig::default()
            .with_period(DataType::SpanEvents, Duration::from_secs(1));
        assert_eq!(harvest.period(DataType::SpanEvents), Duration::from_secs(1));
        assert_eq!(harvest.period(DataType::Metrics), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"app_name":"shop","reservoirs":{"error_events":7}}"#)
                .unwrap();
        assert_eq!(config.app_name, "shop");
        assert_eq!(config.reservoirs.error_events, 7);
        assert_eq!(config.reservoirs.custom_events, 1200);
        assert_eq!(config.harvest.max_consecutive_fatal, 3);
    }
}
