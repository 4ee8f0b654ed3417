//! Harvest cycle: timer-driven snapshot, serialize and deliver.
//!
//! Every data type runs on its own lane with its own period, backlog and
//! fatal-failure counter. A lane step is:
//!
//! 1. Take the current data from the recorder (atomic swap).
//! 2. Merge in the backlog held from a previous retryable failure, bounded
//!    the same way live data is (events re-offered into a reservoir of the
//!    same capacity, metrics merged accumulator-wise).
//! 3. Encode and deliver under `delivery_timeout`.
//! 4. Success clears the backlog; a retryable failure holds the data; a
//!    fatal failure drops it and, after `max_consecutive_fatal` in a row,
//!    deactivates the lane until the cycle is restarted.

use crate::config::HarvestConfig;
use crate::errors::ErrorTrace;
use crate::events::Event;
use crate::metrics::MetricSnapshot;
use crate::payload;
use crate::recorder::TransactionRecorder;
use crate::reservoir::{merge_sampled, SamplingStats};
use crate::trace::TransactionTrace;
use crate::transport::{DeliveryError, TransportBoxed};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// The seven independently harvested data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Metrics,
    TransactionTraces,
    ErrorTraces,
    TransactionEvents,
    CustomEvents,
    ErrorEvents,
    SpanEvents,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::Metrics,
        DataType::TransactionTraces,
        DataType::ErrorTraces,
        DataType::TransactionEvents,
        DataType::CustomEvents,
        DataType::ErrorEvents,
        DataType::SpanEvents,
    ];

    /// Collector endpoint name.
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Metrics => "metric_data",
            Self::TransactionTraces => "transaction_sample_data",
            Self::ErrorTraces => "error_data",
            Self::TransactionEvents => "analytic_event_data",
            Self::CustomEvents => "custom_event_data",
            Self::ErrorEvents => "error_event_data",
            Self::SpanEvents => "span_event_data",
        }
    }

    pub const fn is_event(self) -> bool {
        matches!(
            self,
            Self::TransactionEvents | Self::CustomEvents | Self::ErrorEvents | Self::SpanEvents
        )
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// One data type's harvested snapshot.
#[derive(Debug, Clone)]
pub enum Harvested {
    Metrics(MetricSnapshot),
    Traces(Vec<TransactionTrace>),
    ErrorTraces(Vec<ErrorTrace>),
    Events {
        events: Vec<Event>,
        stats: SamplingStats,
    },
}

impl Harvested {
    /// Swaps out everything recorded for `data_type` since the last take.
    pub fn take(recorder: &TransactionRecorder, data_type: DataType) -> Self {
        fn events<T: Into<Event>>((events, stats): (Vec<T>, SamplingStats)) -> Harvested {
            Harvested::Events {
                events: events.into_iter().map(Into::into).collect(),
                stats,
            }
        }

        match data_type {
            DataType::Metrics => Self::Metrics(recorder.metrics.harvest()),
            DataType::TransactionTraces => {
                Self::Traces(recorder.traces.harvest().into_iter().collect())
            }
            DataType::ErrorTraces => Self::ErrorTraces(recorder.errors.harvest()),
            DataType::TransactionEvents => events(recorder.transaction_events.harvest()),
            DataType::CustomEvents => events(recorder.custom_events.harvest()),
            DataType::ErrorEvents => events(recorder.error_events.harvest()),
            DataType::SpanEvents => events(recorder.span_events.harvest()),
        }
    }

    /// Items that would be delivered (metric entries, traces or events).
    pub fn len(&self) -> usize {
        match self {
            Self::Metrics(snapshot) => snapshot.len(),
            Self::Traces(traces) => traces.len(),
            Self::ErrorTraces(traces) => traces.len(),
            Self::Events { events, .. } => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges a held backlog into this (newer) harvest without exceeding
    /// the bound live data is held to.
    fn absorb(&mut self, older: Harvested, bound: usize) {
        match (self, older) {
            (Self::Metrics(current), Self::Metrics(older)) => current.merge(older),
            (Self::Traces(current), Self::Traces(older)) => {
                current.extend(older);
                current.sort_by(|a, b| b.duration.cmp(&a.duration));
                current.truncate(1);
            }
            (Self::ErrorTraces(current), Self::ErrorTraces(older)) => {
                let mut merged = older;
                merged.append(current);
                merged.truncate(bound);
                *current = merged;
            }
            (
                Self::Events { events, stats },
                Self::Events {
                    events: old_events,
                    stats: old_stats,
                },
            ) => {
                let (merged, merged_stats) = merge_sampled(
                    bound,
                    [
                        (std::mem::take(events), *stats),
                        (old_events, old_stats),
                    ],
                );
                *events = merged;
                *stats = merged_stats;
            }
            (_, older) => {
                debug!(kind = ?std::mem::discriminant(&older), "discarding mismatched backlog");
            }
        }
    }
}

/// What one lane step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// Nothing to send.
    Empty,
    Delivered { items: usize },
    /// Retryable failure; held for the next cycle.
    Held { items: usize },
    /// Fatal failure; data discarded.
    Dropped { items: usize },
    /// Lane deactivated; data taken and discarded.
    Inactive,
}

/// Delivery statistics for one data type (atomics, readable concurrently).
#[derive(Debug, Default)]
pub struct HarvestStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub retryable_failures: AtomicU64,
    pub fatal_failures: AtomicU64,
    pub items_sent: AtomicU64,
    /// Items currently held as backlog.
    pub held_items: AtomicU64,
}

impl HarvestStats {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn retryable_failures(&self) -> u64 {
        self.retryable_failures.load(Ordering::Relaxed)
    }

    pub fn fatal_failures(&self) -> u64 {
        self.fatal_failures.load(Ordering::Relaxed)
    }

    pub fn items_sent(&self) -> u64 {
        self.items_sent.load(Ordering::Relaxed)
    }

    pub fn held_items(&self) -> u64 {
        self.held_items.load(Ordering::Relaxed)
    }

    fn record_success(&self, items: usize) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.items_sent.fetch_add(items as u64, Ordering::Relaxed);
        self.held_items.store(0, Ordering::Relaxed);
    }

    fn record_retryable(&self, held: usize) {
        self.retryable_failures.fetch_add(1, Ordering::Relaxed);
        self.held_items.store(held as u64, Ordering::Relaxed);
    }

    fn record_fatal(&self) {
        self.fatal_failures.fetch_add(1, Ordering::Relaxed);
        self.held_items.store(0, Ordering::Relaxed);
    }
}

/// Error types for the harvest cycle itself.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("harvest task failed: {0}")]
    TaskFailed(String),
}

#[derive(Default)]
struct LaneState {
    backlog: Option<Harvested>,
    consecutive_fatal: u32,
}

struct Lane {
    data_type: DataType,
    active: AtomicBool,
    state: Mutex<LaneState>,
    stats: HarvestStats,
}

impl Lane {
    fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            active: AtomicBool::new(true),
            state: Mutex::new(LaneState::default()),
            stats: HarvestStats::default(),
        }
    }
}

struct Shared {
    recorder: Arc<TransactionRecorder>,
    transport: Arc<dyn TransportBoxed>,
    config: HarvestConfig,
    run_id: String,
    lanes: Vec<Lane>,
}

impl Shared {
    fn lane(&self, data_type: DataType) -> &Lane {
        &self.lanes[data_type.index()]
    }

    /// Upper bound a merged backlog is held to.
    fn bound(&self, data_type: DataType) -> usize {
        match data_type {
            DataType::ErrorTraces => self.recorder.errors.max_traces(),
            DataType::TransactionTraces => 1,
            other => self.recorder.config.reservoirs.capacity(other),
        }
    }

    async fn harvest_lane(&self, data_type: DataType) -> HarvestOutcome {
        let lane = self.lane(data_type);
        let mut state = lane.state.lock().await;

        let mut data = Harvested::take(&self.recorder, data_type);
        if !lane.active.load(Ordering::Acquire) {
            return HarvestOutcome::Inactive;
        }
        if let Some(backlog) = state.backlog.take() {
            data.absorb(backlog, self.bound(data_type));
        }
        let items = data.len();
        if items == 0 {
            lane.stats.held_items.store(0, Ordering::Relaxed);
            return HarvestOutcome::Empty;
        }

        lane.stats.attempts.fetch_add(1, Ordering::Relaxed);
        let result = match payload::encode(&self.run_id, &data) {
            Ok(bytes) => {
                let delivery = self.transport.deliver_boxed(data_type, bytes);
                match tokio::time::timeout(self.config.delivery_timeout, delivery).await {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::Timeout),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                state.consecutive_fatal = 0;
                lane.stats.record_success(items);
                if let Harvested::Events { stats, .. } = &data {
                    self.record_supportability(data_type, stats.seen, items);
                }
                debug!(endpoint = %data_type, items, "harvest delivered");
                HarvestOutcome::Delivered { items }
            }
            Err(e) if e.is_retryable() => {
                warn!(endpoint = %data_type, items, error = %e, "delivery failed, holding data for next harvest");
                lane.stats.record_retryable(items);
                state.backlog = Some(data);
                HarvestOutcome::Held { items }
            }
            Err(e) => {
                state.consecutive_fatal += 1;
                lane.stats.record_fatal();
                warn!(
                    endpoint = %data_type,
                    items,
                    error = %e,
                    consecutive = state.consecutive_fatal,
                    "delivery rejected, dropping data"
                );
                if state.consecutive_fatal >= self.config.max_consecutive_fatal {
                    lane.active.store(false, Ordering::Release);
                    warn!(endpoint = %data_type, "deactivating data type until harvest restart");
                }
                HarvestOutcome::Dropped { items }
            }
        }
    }

    fn record_supportability(&self, data_type: DataType, seen: u64, sent: usize) {
        let metrics = &self.recorder.metrics;
        let endpoint = data_type.endpoint();
        metrics.record_count(&format!("Supportability/Events/{endpoint}/Seen"), seen);
        metrics.record_count(&format!("Supportability/Events/{endpoint}/Sent"), sent as u64);
    }
}

/// Order used by `harvest_all`: metrics last, so supportability metrics
/// recorded by the event lanes go out in the same pass.
const HARVEST_ALL_ORDER: [DataType; 7] = [
    DataType::TransactionEvents,
    DataType::CustomEvents,
    DataType::ErrorEvents,
    DataType::SpanEvents,
    DataType::TransactionTraces,
    DataType::ErrorTraces,
    DataType::Metrics,
];

/// Orchestrates periodic harvests for every data type.
///
/// Deactivation state lives here, so creating a new cycle reactivates every
/// data type.
pub struct HarvestCycle {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl HarvestCycle {
    /// Creates a cycle without timers; harvests run only on demand.
    pub fn manual(
        recorder: Arc<TransactionRecorder>,
        transport: Arc<dyn TransportBoxed>,
    ) -> Self {
        let config = recorder.config.harvest.clone();
        let run_id = recorder.config.run_id.clone();
        Self {
            shared: Arc::new(Shared {
                recorder,
                transport,
                config,
                run_id,
                lanes: DataType::ALL.iter().map(|&t| Lane::new(t)).collect(),
            }),
            tasks: Vec::new(),
            shutdown_tx: None,
        }
    }

    /// Creates a cycle and spawns one timer task per data type.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(recorder: Arc<TransactionRecorder>, transport: Arc<dyn TransportBoxed>) -> Self {
        let mut cycle = Self::manual(recorder, transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for data_type in DataType::ALL {
            let shared = Arc::clone(&cycle.shared);
            let mut shutdown_rx = shutdown_rx.clone();
            let period = shared.config.period(data_type);

            cycle.tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            shared.harvest_lane(data_type).await;
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }));
        }

        cycle.shutdown_tx = Some(shutdown_tx);
        debug!(transport = cycle.shared.transport.name(), "harvest cycle started");
        cycle
    }

    /// Harvests one data type immediately.
    pub async fn harvest_now(&self, data_type: DataType) -> HarvestOutcome {
        self.shared.harvest_lane(data_type).await
    }

    /// Harvests every data type immediately.
    pub async fn harvest_all(&self) -> Vec<(DataType, HarvestOutcome)> {
        let mut outcomes = Vec::with_capacity(HARVEST_ALL_ORDER.len());
        for data_type in HARVEST_ALL_ORDER {
            outcomes.push((data_type, self.shared.harvest_lane(data_type).await));
        }
        outcomes
    }

    pub fn stats(&self, data_type: DataType) -> &HarvestStats {
        &self.shared.lane(data_type).stats
    }

    pub fn is_active(&self, data_type: DataType) -> bool {
        self.shared.lane(data_type).active.load(Ordering::Acquire)
    }

    /// Stops the timers and performs a final harvest of every active type.
    pub async fn shutdown(mut self) -> Result<Vec<(DataType, HarvestOutcome)>, HarvestError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for task in self.tasks.drain(..) {
            task.await
                .map_err(|e| HarvestError::TaskFailed(e.to_string()))?;
        }
        let outcomes = self.harvest_all().await;
        debug!(transport = self.shared.transport.name(), "harvest cycle stopped");
        Ok(outcomes)
    }
}

impl fmt::Debug for HarvestCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active: Vec<_> = self
            .shared
            .lanes
            .iter()
            .filter(|l| l.active.load(Ordering::Relaxed))
            .map(|l| l.data_type)
            .collect();
        f.debug_struct("HarvestCycle")
            .field("transport", &self.shared.transport.name())
            .field("active", &active)
            .field("timers", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ReservoirConfig};
    use crate::events::Priority;
    use crate::transport::TestTransport;
    use std::time::Duration;

    fn setup(config: AgentConfig) -> (Arc<TransactionRecorder>, Arc<TestTransport>, HarvestCycle) {
        let recorder = Arc::new(TransactionRecorder::new(config));
        let transport = Arc::new(TestTransport::new());
        let cycle = HarvestCycle::manual(Arc::clone(&recorder), transport.clone());
        (recorder, transport, cycle)
    }

    fn custom(recorder: &TransactionRecorder, n: usize) {
        for i in 0..n {
            recorder
                .record_custom_event("Thing", [("i", i as i64)], Priority::random())
                .unwrap();
        }
    }

    #[test]
    fn test_endpoints() {
        let endpoints: Vec<_> = DataType::ALL.iter().map(|t| t.endpoint()).collect();
        assert_eq!(
            endpoints,
            vec![
                "metric_data",
                "transaction_sample_data",
                "error_data",
                "analytic_event_data",
                "custom_event_data",
                "error_event_data",
                "span_event_data"
            ]
        );
        assert!(DataType::SpanEvents.is_event());
        assert!(!DataType::Metrics.is_event());
    }

    #[tokio::test]
    async fn test_empty_lane_sends_nothing() {
        let (_recorder, transport, cycle) = setup(AgentConfig::default());
        assert_eq!(cycle.harvest_now(DataType::CustomEvents).await, HarvestOutcome::Empty);
        assert!(transport.delivered(DataType::CustomEvents).is_empty());
        assert_eq!(cycle.stats(DataType::CustomEvents).attempts(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_holds_and_merges() {
        let (recorder, transport, cycle) = setup(AgentConfig::default());
        transport.script([Err(DeliveryError::Retryable("503".into()))]);

        custom(&recorder, 2);
        assert_eq!(
            cycle.harvest_now(DataType::CustomEvents).await,
            HarvestOutcome::Held { items: 2 }
        );
        assert_eq!(cycle.stats(DataType::CustomEvents).held_items(), 2);

        custom(&recorder, 3);
        assert_eq!(
            cycle.harvest_now(DataType::CustomEvents).await,
            HarvestOutcome::Delivered { items: 5 }
        );
        let payloads = transport.delivered(DataType::CustomEvents);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0][1]["events_seen"], 5);
        assert_eq!(cycle.stats(DataType::CustomEvents).held_items(), 0);
    }

    #[tokio::test]
    async fn test_backlog_merge_respects_capacity() {
        let config = AgentConfig::default().with_reservoirs(ReservoirConfig::uniform(4).with_shards(1));
        let (recorder, transport, cycle) = setup(config);
        transport.script([Err(DeliveryError::Timeout)]);

        custom(&recorder, 4);
        cycle.harvest_now(DataType::CustomEvents).await;
        custom(&recorder, 4);
        assert_eq!(
            cycle.harvest_now(DataType::CustomEvents).await,
            HarvestOutcome::Delivered { items: 4 }
        );
        let payload = &transport.delivered(DataType::CustomEvents)[0];
        assert_eq!(payload[1]["events_seen"], 8);
        assert_eq!(payload[1]["reservoir_size"], 4);
    }

    #[tokio::test]
    async fn test_consecutive_fatal_deactivates_lane() {
        let config = AgentConfig::default()
            .with_harvest(HarvestConfig::default().with_max_consecutive_fatal(2));
        let (recorder, transport, cycle) = setup(config);
        transport.script([
            Err(DeliveryError::Fatal("413".into())),
            Err(DeliveryError::Fatal("413".into())),
        ]);

        custom(&recorder, 1);
        assert_eq!(
            cycle.harvest_now(DataType::CustomEvents).await,
            HarvestOutcome::Dropped { items: 1 }
        );
        assert!(cycle.is_active(DataType::CustomEvents));

        custom(&recorder, 1);
        cycle.harvest_now(DataType::CustomEvents).await;
        assert!(!cycle.is_active(DataType::CustomEvents));

        custom(&recorder, 1);
        assert_eq!(cycle.harvest_now(DataType::CustomEvents).await, HarvestOutcome::Inactive);
        assert!(cycle.is_active(DataType::Metrics));
        assert_eq!(cycle.stats(DataType::CustomEvents).fatal_failures(), 2);

        // a fresh cycle reactivates the lane
        let fresh = HarvestCycle::manual(recorder.clone(), transport.clone());
        assert!(fresh.is_active(DataType::CustomEvents));
    }

    #[tokio::test]
    async fn test_success_resets_fatal_counter() {
        let config = AgentConfig::default()
            .with_harvest(HarvestConfig::default().with_max_consecutive_fatal(2));
        let (recorder, transport, cycle) = setup(config);
        transport.script([
            Err(DeliveryError::Fatal("x".into())),
            Ok(()),
            Err(DeliveryError::Fatal("x".into())),
        ]);
        for _ in 0..3 {
            custom(&recorder, 1);
            cycle.harvest_now(DataType::CustomEvents).await;
        }
        assert!(cycle.is_active(DataType::CustomEvents));
    }

    #[tokio::test]
    async fn test_supportability_metrics_follow_event_harvest() {
        let (recorder, transport, cycle) = setup(AgentConfig::default());
        custom(&recorder, 3);
        let outcomes = cycle.harvest_all().await;
        assert_eq!(outcomes.last().map(|(t, _)| *t), Some(DataType::Metrics));

        let metric_payload = &transport.delivered(DataType::Metrics)[0];
        let names: Vec<String> = metric_payload[3]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry[0]["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"Supportability/Events/custom_event_data/Seen".to_string()));
        assert!(names.contains(&"Supportability/Events/custom_event_data/Sent".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_harvests_each_type_on_its_period() {
        let config = AgentConfig::default().with_harvest(
            HarvestConfig::uniform(Duration::from_secs(60))
                .with_period(DataType::CustomEvents, Duration::from_secs(5)),
        );
        let recorder = Arc::new(TransactionRecorder::new(config));
        let transport = Arc::new(TestTransport::new());
        let cycle = HarvestCycle::start(Arc::clone(&recorder), transport.clone());

        custom(&recorder, 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.delivered(DataType::CustomEvents).len(), 1);
        assert!(transport.delivered(DataType::Metrics).is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.delivered(DataType::Metrics).len(), 1);

        cycle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out_and_holds() {
        struct Stall;
        impl crate::transport::Transport for Stall {
            async fn deliver(&self, _: DataType, _: Vec<u8>) -> Result<(), DeliveryError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            fn name(&self) -> &str {
                "stall"
            }
        }

        let recorder = Arc::new(TransactionRecorder::new(AgentConfig::default()));
        let cycle = HarvestCycle::manual(Arc::clone(&recorder), Arc::new(Stall));
        custom(&recorder, 2);
        assert_eq!(
            cycle.harvest_now(DataType::CustomEvents).await,
            HarvestOutcome::Held { items: 2 }
        );
        assert_eq!(cycle.stats(DataType::CustomEvents).retryable_failures(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_harvest() {
        let (recorder, transport, _) = setup(AgentConfig::default());
        let cycle = HarvestCycle::start(Arc::clone(&recorder), transport.clone());
        custom(&recorder, 2);
        let outcomes = cycle.shutdown().await.unwrap();
        assert!(outcomes.contains(&(DataType::CustomEvents, HarvestOutcome::Delivered { items: 2 })));
        assert_eq!(transport.delivered(DataType::CustomEvents).len(), 1);
    }
}
