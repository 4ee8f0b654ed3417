//! The instrumentation-facing agent.
//!
//! Each thread has its own active transaction, kept in a thread-local slot
//! keyed by agent, so two agents (or two tests) in one process never see each
//! other's segment stacks. Hosts that move work between threads can use the
//! explicit [`TransactionTracer`] context object instead via
//! [`Agent::start_tracer`] / [`Agent::finish_tracer`].
//!
//! `begin_transaction` returns a [`TransactionGuard`]. If the thread unwinds
//! past the guard, the transaction is closed and recorded as it stands so the
//! slot is free for the next one.

use crate::clock::Timestamp;
use crate::config::AgentConfig;
use crate::error::{AttributeError, TracerError};
use crate::errors::{ErrorDescription, NoticedError};
use crate::events::{AttributeValue, Attributes, Priority};
use crate::harvest::{DataType, HarvestCycle, Harvested};
use crate::recorder::TransactionRecorder;
use crate::tracer::{SegmentHandle, TransactionCategory, TransactionHandle, TransactionTracer};
use crate::transport::TransportBoxed;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE: RefCell<Vec<(u64, TransactionTracer)>> = const { RefCell::new(Vec::new()) };
}

/// Proof of an active transaction on this thread, consumed by
/// [`Agent::end_transaction`].
///
/// Dropped during a panic, it ends the transaction at the unwind point.
/// Dropped any other way, the transaction stays active.
#[must_use = "pass the guard to `end_transaction`"]
#[derive(Debug)]
pub struct TransactionGuard {
    handle: TransactionHandle,
    agent: Option<Agent>,
}

impl TransactionGuard {
    pub fn handle(&self) -> TransactionHandle {
        self.handle
    }

    fn disarm(&mut self) {
        self.agent = None;
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if let Some(agent) = self.agent.take() {
            if std::thread::panicking() {
                agent.finish_unwound(self.handle);
            }
        }
    }
}

/// Cheap to clone; clones share all recorded data.
#[derive(Clone)]
pub struct Agent {
    id: u64,
    recorder: Arc<TransactionRecorder>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            recorder: Arc::new(TransactionRecorder::new(config)),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        self.recorder.config()
    }

    pub fn recorder(&self) -> &Arc<TransactionRecorder> {
        &self.recorder
    }

    /// Runs `f` on this thread's active transaction, if any.
    fn with_active<R>(&self, f: impl FnOnce(&mut TransactionTracer) -> R) -> Option<R> {
        ACTIVE
            .try_with(|slots| {
                let mut slots = slots.borrow_mut();
                slots
                    .iter_mut()
                    .find(|(id, _)| *id == self.id)
                    .map(|(_, tracer)| f(tracer))
            })
            .ok()
            .flatten()
    }

    fn take_active(&self) -> Option<TransactionTracer> {
        ACTIVE
            .try_with(|slots| {
                let mut slots = slots.try_borrow_mut().ok()?;
                let pos = slots.iter().position(|(id, _)| *id == self.id)?;
                Some(slots.swap_remove(pos).1)
            })
            .ok()
            .flatten()
    }

    /// Records the active transaction left behind by an unwinding guard.
    fn finish_unwound(&self, handle: TransactionHandle) {
        if self.with_active(|t| t.handle() == handle) != Some(true) {
            return;
        }
        if let Some(tracer) = self.take_active() {
            debug!(transaction = tracer.name(), "ending transaction during unwind");
            self.recorder.record(tracer.finish());
        }
    }

    /// `true` if this thread has an active transaction for this agent.
    pub fn in_active_transaction(&self) -> bool {
        self.with_active(|_| ()).is_some()
    }

    // ------------------------------------------------------------------
    // Hook API
    // ------------------------------------------------------------------

    /// Starts a transaction on the current thread.
    pub fn begin_transaction(
        &self,
        name: &str,
        category: TransactionCategory,
    ) -> Result<TransactionGuard, TracerError> {
        if self.in_active_transaction() {
            debug!(name, "begin_transaction while a transaction is active");
            return Err(TracerError::TransactionAlreadyActive);
        }
        let tracer = self.recorder.start_transaction(name, category);
        let handle = tracer.handle();
        ACTIVE
            .try_with(|slots| slots.borrow_mut().push((self.id, tracer)))
            .map_err(|_| TracerError::NoActiveTransaction)?;
        Ok(TransactionGuard {
            handle,
            agent: Some(self.clone()),
        })
    }

    pub fn begin_segment(&self, name: &str) -> Result<SegmentHandle, TracerError> {
        self.with_active(|t| t.begin_segment(name))
            .unwrap_or(Err(TracerError::NoActiveTransaction))
    }

    pub fn end_segment(&self, handle: SegmentHandle) -> Result<(), TracerError> {
        let result = self
            .with_active(|t| t.end_segment(handle))
            .unwrap_or(Err(TracerError::NoActiveTransaction));
        if let Err(e) = &result {
            debug!(error = %e, "end_segment rejected");
        }
        result
    }

    /// Ends the active transaction, closing any open segments, and records it.
    pub fn end_transaction(&self, mut guard: TransactionGuard) -> Result<(), TracerError> {
        guard.disarm();
        let handle = guard.handle;
        let owns = self
            .with_active(|t| t.handle() == handle)
            .ok_or(TracerError::NoActiveTransaction)?;
        if !owns {
            return Err(TracerError::TransactionMismatch);
        }
        if let Some(tracer) = self.take_active() {
            self.recorder.record(tracer.finish());
        }
        Ok(())
    }

    /// Renames the active transaction; the last call before it ends wins.
    pub fn set_transaction_name(
        &self,
        name: &str,
        category: TransactionCategory,
    ) -> Result<(), TracerError> {
        self.with_active(|t| t.set_name(name, category))
            .ok_or(TracerError::NoActiveTransaction)
    }

    pub fn add_custom_attribute(
        &self,
        key: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<(), TracerError> {
        let limits = &self.config().attributes;
        self.with_active(|t| t.add_attribute(key, value, limits))
            .ok_or(TracerError::NoActiveTransaction)?
            .map_err(TracerError::from)
    }

    /// Records when the request was first queued upstream.
    pub fn set_request_queue_start(&self, at: Timestamp) -> Result<(), TracerError> {
        self.with_active(|t| t.set_queue_start(at))
            .ok_or(TracerError::NoActiveTransaction)
    }

    /// Marks the active transaction sampled.
    pub fn force_sample(&self) -> Result<(), TracerError> {
        self.with_active(TransactionTracer::force_sample)
            .ok_or(TracerError::NoActiveTransaction)
    }

    /// Identifier of the innermost open segment.
    pub fn current_span_id(&self) -> Option<String> {
        self.with_active(|t| t.current_span_id().map(str::to_string))
            .flatten()
    }

    /// Records a user-defined event. Inside a transaction it shares the
    /// transaction's priority.
    pub fn record_custom_event<K, V>(
        &self,
        event_type: &str,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), AttributeError>
    where
        K: AsRef<str>,
        V: Into<AttributeValue>,
    {
        let priority = self
            .with_active(|t| t.priority())
            .unwrap_or_else(Priority::random);
        self.recorder
            .record_custom_event(event_type, attributes, priority)
    }

    /// Notices an application error. Never fails and never changes the
    /// caller's control flow; invalid attributes are skipped.
    pub fn notice_error<K, V>(
        &self,
        description: ErrorDescription,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) where
        K: AsRef<str>,
        V: Into<AttributeValue>,
    {
        let Some(description) = self.recorder.classify_error(description) else {
            return;
        };
        let limits = &self.config().attributes;
        let mut attrs = Attributes::new();
        for (key, value) in attributes {
            if let Err(e) = attrs.try_insert(key.as_ref(), value, limits) {
                debug!(error = %e, "skipping error attribute");
            }
        }
        let error = NoticedError::new(description, attrs);

        // Left in `pending` when no transaction is active.
        let mut pending = Some(error);
        self.with_active(|t| {
            if let Some(error) = pending.take() {
                t.notice_error(error);
            }
        });
        if let Some(error) = pending {
            self.recorder.record_standalone_error(&error);
        }
    }

    /// Records an unscoped custom value metric.
    pub fn record_metric(&self, name: &str, value: f64) {
        self.recorder.record_metric(name, value);
    }

    /// Runs `f` inside a new transaction.
    ///
    /// If `f` panics, the panic is noticed as an error, every open segment
    /// is closed at the panic time, the transaction is recorded and the
    /// panic resumes unchanged. If a transaction is already active, `f`
    /// simply runs inside it.
    pub fn in_transaction<R>(
        &self,
        name: &str,
        category: TransactionCategory,
        f: impl FnOnce() -> R,
    ) -> R {
        let Ok(guard) = self.begin_transaction(name, category) else {
            return f();
        };
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = self.end_transaction(guard);
                value
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                debug!(transaction = name, panic = %message, "transaction panicked");
                let none: [(&str, AttributeValue); 0] = [];
                self.notice_error(ErrorDescription::new("panic", message), none);
                let _ = self.end_transaction(guard);
                panic::resume_unwind(payload)
            }
        }
    }

    // ------------------------------------------------------------------
    // Explicit context
    // ------------------------------------------------------------------

    /// Starts a transaction held by the caller rather than the thread.
    pub fn start_tracer(&self, name: &str, category: TransactionCategory) -> TransactionTracer {
        self.recorder.start_transaction(name, category)
    }

    /// Notices an error on a caller-held transaction.
    pub fn notice_tracer_error(&self, tracer: &mut TransactionTracer, description: ErrorDescription) {
        if let Some(description) = self.recorder.classify_error(description) {
            tracer.notice_error(NoticedError::new(description, Attributes::new()));
        }
    }

    pub fn finish_tracer(&self, tracer: TransactionTracer) {
        self.recorder.record(tracer.finish());
    }

    // ------------------------------------------------------------------
    // Harvest
    // ------------------------------------------------------------------

    /// Takes everything recorded for `data_type` since the last harvest.
    pub fn harvest(&self, data_type: DataType) -> Harvested {
        Harvested::take(&self.recorder, data_type)
    }

    /// Starts the periodic harvest cycle. Must be called within a tokio runtime.
    pub fn start_harvest(&self, transport: Arc<dyn TransportBoxed>) -> HarvestCycle {
        HarvestCycle::start(Arc::clone(&self.recorder), transport)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("app_name", &self.config().app_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use std::time::Duration;

    fn agent() -> Agent {
        Agent::new(AgentConfig::default())
    }

    fn metrics(agent: &Agent) -> crate::metrics::MetricSnapshot {
        match agent.harvest(DataType::Metrics) {
            Harvested::Metrics(snapshot) => snapshot,
            other => panic!("unexpected harvest {other:?}"),
        }
    }

    #[test]
    fn test_segment_outside_transaction_fails() {
        let agent = agent();
        assert_eq!(agent.begin_segment("x"), Err(TracerError::NoActiveTransaction));
    }

    #[test]
    fn test_second_begin_is_rejected() {
        let agent = agent();
        let txn = agent.begin_transaction("a", TransactionCategory::Web).unwrap();
        assert!(matches!(
            agent.begin_transaction("b", TransactionCategory::Web),
            Err(TracerError::TransactionAlreadyActive)
        ));
        agent.end_transaction(txn).unwrap();
        assert!(!agent.in_active_transaction());
    }

    #[test]
    fn test_agents_do_not_share_thread_state() {
        let a = agent();
        let b = agent();
        let txn = a.begin_transaction("a", TransactionCategory::Web).unwrap();
        assert!(!b.in_active_transaction());
        let other = b.begin_transaction("b", TransactionCategory::Web).unwrap();
        b.end_transaction(other).unwrap();
        assert!(a.in_active_transaction());
        a.end_transaction(txn).unwrap();
        assert!(!a.in_active_transaction());
    }

    #[test]
    fn test_guard_from_another_agent_is_rejected() {
        let a = agent();
        let b = agent();
        let txn = a.begin_transaction("a", TransactionCategory::Web).unwrap();
        let _other = b.begin_transaction("b", TransactionCategory::Web).unwrap();
        assert_eq!(b.end_transaction(txn), Err(TracerError::TransactionMismatch));
        assert!(a.in_active_transaction());
        assert!(b.in_active_transaction());
    }

    #[test]
    fn test_panic_through_hooks_frees_the_thread() {
        let agent = agent();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _txn = agent.begin_transaction("req1", TransactionCategory::Web).unwrap();
            let _seg = agent.begin_segment("Custom/work").unwrap();
            panic!("handler failed");
        }));
        assert!(result.is_err());
        assert!(!agent.in_active_transaction());

        let txn = agent.begin_transaction("req2", TransactionCategory::Web).unwrap();
        agent.end_transaction(txn).unwrap();

        let snapshot = metrics(&agent);
        assert!(snapshot.unscoped("Controller/req1").is_some());
        assert!(snapshot.get("Custom/work", Some("Controller/req1")).is_some());
        assert!(snapshot.unscoped("Controller/req2").is_some());
    }

    #[test]
    fn test_mismatched_end_does_not_touch_metrics() {
        let agent = agent();
        let txn = agent.begin_transaction("a", TransactionCategory::Web).unwrap();
        let outer = agent.begin_segment("Custom/outer").unwrap();
        let _inner = agent.begin_segment("Custom/inner").unwrap();
        assert!(matches!(
            agent.end_segment(outer),
            Err(TracerError::SegmentStackMismatch { .. })
        ));
        assert!(metrics(&agent).is_empty());
        agent.end_transaction(txn).unwrap();
    }

    #[test]
    fn test_queue_time_metric() {
        let clock = clock::freeze();
        let agent = agent();
        let queued = clock.now();
        clock.advance(Duration::from_secs(5));

        let txn = agent.begin_transaction("a", TransactionCategory::Web).unwrap();
        agent.set_request_queue_start(queued).unwrap();
        agent.end_transaction(txn).unwrap();

        let snapshot = metrics(&agent);
        let queue = snapshot.unscoped("WebFrontend/QueueTime").unwrap();
        assert_eq!(queue.call_count, 1);
        assert!((queue.total_call_time - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_notice_error_outside_transaction() {
        let agent = agent();
        agent.notice_error(ErrorDescription::new("IOError", "disk"), [("path", "/tmp")]);

        let Harvested::Events { events, .. } = agent.harvest(DataType::ErrorEvents) else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].intrinsics().get("transactionName"),
            Some(&AttributeValue::from("Unknown"))
        );
        assert_eq!(events[0].custom().get("path"), Some(&AttributeValue::from("/tmp")));
    }

    #[test]
    fn test_in_transaction_panic_is_recorded_and_resumed() {
        let agent = agent();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            agent.in_transaction("boom", TransactionCategory::Background, || {
                let _seg = agent.begin_segment("Custom/work").unwrap();
                panic!("kaboom");
            })
        }));
        assert!(result.is_err());
        assert!(!agent.in_active_transaction());

        let snapshot = metrics(&agent);
        assert!(snapshot.unscoped("OtherTransaction/boom").is_some());
        assert!(snapshot.get("Custom/work", Some("OtherTransaction/boom")).is_some());
        assert_eq!(snapshot.unscoped("Errors/all").unwrap().call_count, 1);

        let Harvested::Events { events, .. } = agent.harvest(DataType::ErrorEvents) else {
            panic!("expected events");
        };
        assert_eq!(
            events[0].intrinsics().get("error.message"),
            Some(&AttributeValue::from("kaboom"))
        );
    }

    #[test]
    fn test_in_transaction_returns_value() {
        let agent = agent();
        let v = agent.in_transaction("ok", TransactionCategory::Web, || 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_explicit_tracer_context() {
        let agent = agent();
        let mut tracer = agent.start_tracer("job", TransactionCategory::Background);
        let seg = tracer.begin_segment("Custom/step").unwrap();
        tracer.end_segment(seg).unwrap();
        agent.notice_tracer_error(&mut tracer, ErrorDescription::new("E", "m"));
        agent.finish_tracer(tracer);

        let snapshot = metrics(&agent);
        assert!(snapshot.unscoped("Custom/step").is_some());
        assert_eq!(snapshot.unscoped("Errors/allOther").unwrap().call_count, 1);
    }
}
