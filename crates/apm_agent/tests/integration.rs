use apm_agent::clock::{self, FrozenClock};
use apm_agent::{
    Agent, AgentConfig, DataType, DeliveryError, ErrorDescription, HarvestCycle, HarvestOutcome,
    Harvested, JsonFileTransport, MetricSnapshot, Transport, TransactionCategory,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingTransport {
    payloads: Mutex<Vec<(DataType, Value)>>,
    failures: Mutex<Vec<DeliveryError>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            payloads: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn fail_next(&self, error: DeliveryError) {
        self.failures.lock().unwrap().push(error);
    }

    fn payloads(&self, data_type: DataType) -> Vec<Value> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == data_type)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl Transport for RecordingTransport {
    async fn deliver(&self, data_type: DataType, payload: Vec<u8>) -> Result<(), DeliveryError> {
        if let Some(error) = self.failures.lock().unwrap().pop() {
            return Err(error);
        }
        let value: Value = serde_json::from_slice(&payload).unwrap();
        self.payloads.lock().unwrap().push((data_type, value));
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

fn metrics(agent: &Agent) -> MetricSnapshot {
    match agent.harvest(DataType::Metrics) {
        Harvested::Metrics(snapshot) => snapshot,
        other => panic!("unexpected harvest {other:?}"),
    }
}

fn metric_keys(snapshot: &MetricSnapshot) -> BTreeSet<(String, Option<String>)> {
    snapshot
        .names()
        .filter(|spec| !spec.name.starts_with("Supportability/"))
        .map(|spec| (spec.name.clone(), spec.scope.clone()))
        .collect()
}

fn object_keys(value: &Value) -> BTreeSet<&str> {
    value
        .as_object()
        .map(|o| o.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

fn keys(unscoped: &[&str], scoped: &[(&str, &str)]) -> BTreeSet<(String, Option<String>)> {
    unscoped
        .iter()
        .map(|n| (n.to_string(), None))
        .chain(
            scoped
                .iter()
                .map(|(n, s)| (n.to_string(), Some(s.to_string()))),
        )
        .collect()
}

// =============================================================================
// Middleware chain
// =============================================================================

/// One stage of a request-processing chain: does `own` seconds of work,
/// then hands off to `next` unless it returns early.
fn stage(
    agent: &Agent,
    clock: &FrozenClock,
    name: &str,
    own: f64,
    next: Option<&dyn Fn()>,
) {
    let seg = agent.begin_segment(&format!("Middleware/Rack/{name}/call")).unwrap();
    clock.advance(Duration::from_secs_f64(own));
    match next {
        Some(next) => next(),
        None => agent
            .set_transaction_name(&format!("Middleware/Rack/{name}/call"), TransactionCategory::Web)
            .unwrap(),
    }
    agent.end_segment(seg).unwrap();
}

fn app(agent: &Agent, clock: &FrozenClock) {
    agent
        .set_transaction_name("Rack/ExampleApp/call", TransactionCategory::Web)
        .unwrap();
    let seg = agent.begin_segment("Controller/Rack/ExampleApp/call").unwrap();
    clock.advance(Duration::from_millis(100));
    agent.end_segment(seg).unwrap();
}

#[test]
fn test_middlewares_record_metrics() {
    let clock = clock::freeze();
    let agent = Agent::new(AgentConfig::default());

    let txn = agent
        .begin_transaction("Rack/request", TransactionCategory::Web)
        .unwrap();
    stage(&agent, &clock, "MiddlewareOne", 0.01, Some(&|| {
        stage(&agent, &clock, "MiddlewareTwo", 0.01, Some(&|| app(&agent, &clock)));
    }));
    agent.end_transaction(txn).unwrap();

    let txn_name = "Controller/Rack/ExampleApp/call";
    assert_eq!(
        metric_keys(&metrics(&agent)),
        keys(
            &[
                "Apdex",
                "HttpDispatcher",
                "Middleware/all",
                "Apdex/Rack/ExampleApp/call",
                "Controller/Rack/ExampleApp/call",
                "Middleware/Rack/MiddlewareOne/call",
                "Middleware/Rack/MiddlewareTwo/call",
                "Nested/Controller/Rack/ExampleApp/call",
            ],
            &[
                ("Middleware/Rack/MiddlewareOne/call", txn_name),
                ("Middleware/Rack/MiddlewareTwo/call", txn_name),
                ("Nested/Controller/Rack/ExampleApp/call", txn_name),
            ],
        )
    );
}

#[test]
fn test_middleware_that_returns_early_records_rollup() {
    let clock = clock::freeze();
    let agent = Agent::new(AgentConfig::default());

    let txn = agent
        .begin_transaction("Rack/request", TransactionCategory::Web)
        .unwrap();
    stage(&agent, &clock, "MiddlewareOne", 1.0, Some(&|| {
        stage(&agent, &clock, "MiddlewareTwo", 2.0, None);
    }));
    agent.end_transaction(txn).unwrap();

    let snapshot = metrics(&agent);
    let txn_name = "Controller/Middleware/Rack/MiddlewareTwo/call";
    assert_eq!(
        metric_keys(&snapshot),
        keys(
            &[
                "Apdex",
                "HttpDispatcher",
                "Middleware/all",
                "Apdex/Middleware/Rack/MiddlewareTwo/call",
                "Controller/Middleware/Rack/MiddlewareTwo/call",
                "Middleware/Rack/MiddlewareOne/call",
                "Middleware/Rack/MiddlewareTwo/call",
            ],
            &[
                ("Middleware/Rack/MiddlewareOne/call", txn_name),
                ("Middleware/Rack/MiddlewareTwo/call", txn_name),
            ],
        )
    );

    let rollup = snapshot.unscoped("Middleware/all").unwrap();
    assert_eq!(rollup.call_count, 2);
    assert!((rollup.total_exclusive_time - 3.0).abs() < 1e-9);

    let one = snapshot.unscoped("Middleware/Rack/MiddlewareOne/call").unwrap();
    let two = snapshot.unscoped("Middleware/Rack/MiddlewareTwo/call").unwrap();
    assert!(
        (rollup.total_exclusive_time - (one.total_exclusive_time + two.total_exclusive_time)).abs()
            < 1e-9
    );
}

#[test]
fn test_sibling_segments_rollup_total() {
    let clock = clock::freeze();
    let agent = Agent::new(AgentConfig::default());

    let txn = agent.begin_transaction("root", TransactionCategory::Web).unwrap();
    let s1 = agent.begin_segment("Middleware/S1").unwrap();
    clock.advance(Duration::from_secs(2));
    agent.end_segment(s1).unwrap();
    let s2 = agent.begin_segment("Middleware/S2").unwrap();
    clock.advance(Duration::from_secs(1));
    agent.end_segment(s2).unwrap();
    agent.end_transaction(txn).unwrap();

    let snapshot = metrics(&agent);
    let root = snapshot.unscoped("Controller/root").unwrap();
    assert!((root.total_call_time - 3.0).abs() < 1e-9);
    assert_eq!(root.total_exclusive_time, 0.0);
    assert!((snapshot.unscoped("Middleware/S1").unwrap().total_exclusive_time - 2.0).abs() < 1e-9);
    assert!((snapshot.unscoped("Middleware/S2").unwrap().total_exclusive_time - 1.0).abs() < 1e-9);
    assert!((snapshot.unscoped("Middleware/all").unwrap().total_call_time - 3.0).abs() < 1e-9);
}

#[test]
fn test_middlewares_record_queue_time() {
    let clock = clock::freeze();
    let agent = Agent::new(AgentConfig::default());
    let header = format!("t={}", clock.now().as_secs_f64());
    clock.advance(Duration::from_secs(5));

    let txn = agent.begin_transaction("Rack/App/call", TransactionCategory::Web).unwrap();
    let queued = apm_agent::parse_queue_start(&header).unwrap();
    agent.set_request_queue_start(queued).unwrap();
    agent.end_transaction(txn).unwrap();

    let queue = metrics(&agent);
    let queue = queue.unscoped("WebFrontend/QueueTime").unwrap();
    assert!((queue.total_call_time - 5.0).abs() < 1e-3);
}

// =============================================================================
// Marshalling
// =============================================================================

#[tokio::test]
async fn test_custom_event_payload() {
    let clock = clock::freeze_at(apm_agent::Timestamp::from_secs_f64(1_700_000_000.0));
    let agent = Agent::new(AgentConfig::default().with_run_id("run-7"));
    let transport = Arc::new(RecordingTransport::new());
    let cycle = HarvestCycle::manual(Arc::clone(agent.recorder()), transport.clone());

    agent
        .record_custom_event("CustomEventType", [("foo", "bar"), ("baz", "qux")])
        .unwrap();
    drop(clock);

    assert_eq!(
        cycle.harvest_now(DataType::CustomEvents).await,
        HarvestOutcome::Delivered { items: 1 }
    );
    let payload = &transport.payloads(DataType::CustomEvents)[0];
    assert_eq!(payload[0], "run-7");
    assert_eq!(payload[1], json!({"reservoir_size": 1200, "events_seen": 1}));
    assert_eq!(
        payload[2],
        json!([[
            {"type": "CustomEventType", "timestamp": 1_700_000_000},
            {"foo": "bar", "baz": "qux"}
        ]])
    );
}

#[tokio::test]
async fn test_transaction_and_error_event_payloads() {
    let agent = Agent::new(AgentConfig::default());
    let transport = Arc::new(RecordingTransport::new());
    let cycle = HarvestCycle::manual(Arc::clone(agent.recorder()), transport.clone());

    let txn = agent.begin_transaction("users/show", TransactionCategory::Web).unwrap();
    agent.add_custom_attribute("user", 42).unwrap();
    let seg = agent.begin_segment("Datastore/users/select").unwrap();
    agent.notice_error(ErrorDescription::new("RuntimeError", "boom"), [("query", "select")]);
    agent.end_segment(seg).unwrap();
    agent.end_transaction(txn).unwrap();

    cycle.harvest_all().await;

    let txn_event = &transport.payloads(DataType::TransactionEvents)[0][2][0];
    assert_eq!(
        object_keys(&txn_event[0]),
        BTreeSet::from(["duration", "error", "name", "priority", "timestamp", "type"])
    );
    assert_eq!(txn_event[0]["type"], "Transaction");
    assert_eq!(txn_event[0]["name"], "Controller/users/show");
    assert_eq!(txn_event[0]["error"], true);
    assert!(txn_event[0]["priority"].as_f64().unwrap() >= 1.0);
    assert_eq!(txn_event[1], json!({"user": 42}));
    assert_eq!(txn_event[2], json!({}));

    let err_event = &transport.payloads(DataType::ErrorEvents)[0][2][0];
    assert_eq!(err_event.as_array().unwrap().len(), 3);
    assert_eq!(
        object_keys(&err_event[0]),
        BTreeSet::from([
            "duration",
            "error.class",
            "error.expected",
            "error.message",
            "priority",
            "spanId",
            "timestamp",
            "transactionName",
            "type",
        ])
    );
    assert_eq!(err_event[0]["type"], "TransactionError");
    assert_eq!(err_event[0]["error.class"], "RuntimeError");
    assert_eq!(err_event[0]["error.message"], "boom");
    assert_eq!(err_event[0]["error.expected"], false);
    assert_eq!(err_event[0]["transactionName"], "Controller/users/show");
    assert!(err_event[0]["spanId"].is_string());
    assert_eq!(err_event[1], json!({"query": "select", "user": 42}));

    let error_trace = &transport.payloads(DataType::ErrorTraces)[0][1][0];
    assert_eq!(error_trace[1], "Controller/users/show");
    assert_eq!(error_trace[3], "RuntimeError");

    let spans = &transport.payloads(DataType::SpanEvents)[0][2];
    assert_eq!(spans.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_slow_transaction_trace_payload() {
    let clock = clock::freeze();
    let agent = Agent::new(AgentConfig::default());
    let transport = Arc::new(RecordingTransport::new());
    let cycle = HarvestCycle::manual(Arc::clone(agent.recorder()), transport.clone());

    let txn = agent.begin_transaction("slow", TransactionCategory::Web).unwrap();
    let seg = agent.begin_segment("External/api/GET").unwrap();
    clock.advance(Duration::from_secs(3));
    agent.end_segment(seg).unwrap();
    agent.end_transaction(txn).unwrap();
    drop(clock);

    cycle.harvest_now(DataType::TransactionTraces).await;
    let trace = &transport.payloads(DataType::TransactionTraces)[0][1][0];
    assert_eq!(trace[1], 3000);
    assert_eq!(trace[2], "Controller/slow");
    let root = &trace[3];
    assert_eq!(root[4][0][2], "External/api/GET");
    assert_eq!(root[4][0][1], 3000);
}

// =============================================================================
// Delivery failures
// =============================================================================

#[tokio::test]
async fn test_retry_then_deliver_merged_metrics() {
    let agent = Agent::new(AgentConfig::default());
    let transport = Arc::new(RecordingTransport::new());
    let cycle = HarvestCycle::manual(Arc::clone(agent.recorder()), transport.clone());

    agent.record_metric("Custom/value", 1.0);
    transport.fail_next(DeliveryError::Retryable("connection reset".into()));
    assert!(matches!(
        cycle.harvest_now(DataType::Metrics).await,
        HarvestOutcome::Held { .. }
    ));

    agent.record_metric("Custom/value", 2.0);
    assert!(matches!(
        cycle.harvest_now(DataType::Metrics).await,
        HarvestOutcome::Delivered { .. }
    ));

    let payload = &transport.payloads(DataType::Metrics)[0];
    let entry = payload[3]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e[0]["name"] == "Custom/value")
        .unwrap();
    assert_eq!(entry[1][0], 2);
    assert_eq!(entry[1][1], 3.0);
    assert_eq!(cycle.stats(DataType::Metrics).retryable_failures(), 1);
}

#[tokio::test]
async fn test_fatal_failures_deactivate_until_restart() {
    let agent = Agent::new(AgentConfig::default());
    let transport = Arc::new(RecordingTransport::new());
    let cycle = HarvestCycle::manual(Arc::clone(agent.recorder()), transport.clone());

    for _ in 0..3 {
        agent.record_metric("Custom/value", 1.0);
        transport.fail_next(DeliveryError::Fatal("410 Gone".into()));
        assert!(matches!(
            cycle.harvest_now(DataType::Metrics).await,
            HarvestOutcome::Dropped { .. }
        ));
    }
    assert!(!cycle.is_active(DataType::Metrics));
    agent.record_metric("Custom/value", 1.0);
    assert_eq!(cycle.harvest_now(DataType::Metrics).await, HarvestOutcome::Inactive);
    assert!(transport.payloads(DataType::Metrics).is_empty());

    let restarted = HarvestCycle::manual(Arc::clone(agent.recorder()), transport.clone());
    agent.record_metric("Custom/value", 1.0);
    assert!(matches!(
        restarted.harvest_now(DataType::Metrics).await,
        HarvestOutcome::Delivered { .. }
    ));
}

#[tokio::test]
async fn test_json_file_transport_end_to_end() {
    let dir = std::env::temp_dir().join(format!("apm_agent_it_{}", std::process::id()));
    let agent = Agent::new(AgentConfig::default());
    let transport = Arc::new(JsonFileTransport::new(&dir));
    let cycle = agent.start_harvest(transport.clone());

    agent.in_transaction("job", TransactionCategory::Background, || {
        let seg = agent.begin_segment("Custom/work").unwrap();
        agent.end_segment(seg).unwrap();
    });
    cycle.shutdown().await.unwrap();

    let written = std::fs::read_to_string(transport.path_for(DataType::Metrics)).unwrap();
    let value: Value = serde_json::from_str(&written).unwrap();
    let names: Vec<&str> = value[3]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e[0]["name"].as_str())
        .collect();
    assert!(names.contains(&"OtherTransaction/job"));
    assert!(names.contains(&"OtherTransaction/all"));
    std::fs::remove_dir_all(&dir).ok();
}
