//! APM Agent Core
//!
//! The tracing, aggregation and sampling pipeline of an application
//! performance monitoring agent. Instrumentation hooks open and close
//! segments; finished transactions are rolled into scoped metrics and
//! priority-sampled events; a harvest cycle periodically ships everything to
//! a collector with retry, backlog merging and deactivation on fatal errors.
//!
//! ```text
//! hooks ─▶ TransactionTracer ─▶ TransactionRecorder ─┬▶ MetricAggregator ─┐
//!                                                    ├▶ EventReservoir ×4 ├▶ HarvestCycle ─▶ Transport
//!                                                    ├▶ TransactionSampler│
//!                                                    └▶ ErrorCollector ───┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let agent = Agent::new(AgentConfig::default());
//! let txn = agent.begin_transaction("users/show", TransactionCategory::Web)?;
//! let seg = agent.begin_segment("Datastore/users/select")?;
//! agent.end_segment(seg)?;
//! agent.end_transaction(txn)?;
//!
//! let cycle = agent.start_harvest(Arc::new(StdoutTransport::new(false)));
//! cycle.shutdown().await?;
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod errors;
pub mod events;
pub mod harvest;
mod invariants;
pub mod metrics;
pub mod payload;
pub mod recorder;
pub mod reservoir;
pub mod sampler;
mod shard;
pub mod trace;
pub mod tracer;
pub mod transport;

// Re-export main types
pub use agent::{Agent, TransactionGuard};
pub use clock::{FrozenClock, Timestamp};
pub use config::{
    AgentConfig, AttributeLimits, ErrorCollectorConfig, HarvestConfig, ReservoirConfig,
    RollupRule, SamplingConfig, TransactionTracerConfig,
};
pub use error::{AttributeError, TracerError};
pub use errors::{ErrorCollector, ErrorDescription, ErrorTrace};
pub use events::{
    AttributeValue, Attributes, CustomEvent, ErrorEvent, Event, EventKind, Prioritized, Priority,
    SpanEvent, TransactionEvent,
};
pub use harvest::{DataType, HarvestCycle, HarvestError, HarvestOutcome, HarvestStats, Harvested};
pub use metrics::{ApdexZone, MetricAggregator, MetricSnapshot, MetricSpec, Stats};
pub use recorder::{parse_queue_start, TransactionRecorder};
pub use reservoir::{EventReservoir, Offer, Reservoir, SamplingStats};
pub use sampler::AdaptiveSampler;
pub use trace::{TraceNode, TransactionSampler, TransactionTrace};
pub use tracer::{
    FinishedTransaction, Segment, SegmentHandle, TransactionCategory, TransactionHandle,
    TransactionId, TransactionTracer,
};
pub use transport::{
    DeliveryError, JsonFileTransport, NullTransport, StdoutTransport, Transport, TransportBoxed,
};
