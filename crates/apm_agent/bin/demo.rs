//! # APM Agent Demo
//!
//! Drives the agent core end to end: worker threads serve simulated web
//! requests through a middleware chain, a background job runner records
//! `OtherTransaction`s, and the harvest cycle ships everything to a flaky
//! collector.
//!
//! ## Features Demonstrated
//!
//! ### 1. Segment Tracing
//! - Nested middleware segments with an early return in the chain
//! - Datastore and external segments rolled up into `Datastore/all` and `External/all`
//! - Request queue time from an `X-Request-Start` header
//!
//! ### 2. Events and Errors
//! - Transaction, span and custom events in priority reservoirs
//! - Noticed errors (some expected) producing error events and traces
//!
//! ### 3. Harvest Cycle
//! - Per-data-type periods on a tokio runtime
//! - `FlakyCollector` failing some deliveries so data is held and merged
//! - Final harvest on shutdown
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (2 workers, 50 requests each)
//! cargo run -p apm_agent --bin demo --release -- --quick
//!
//! # Full mode (8 workers, 500 requests each)
//! cargo run -p apm_agent --bin demo --release
//!
//! # Verbose mode (print every payload)
//! cargo run -p apm_agent --bin demo --release -- --verbose
//! ```

use apm_agent::{
    parse_queue_start, Agent, AgentConfig, DataType, DeliveryError, ErrorDescription,
    HarvestConfig, HarvestOutcome, StdoutTransport, TransactionCategory, Transport,
};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

// =============================================================================
// FLAKY COLLECTOR (demonstrating the Transport trait)
// =============================================================================

/// Wraps stdout delivery and fails a fraction of calls.
struct FlakyCollector {
    inner: StdoutTransport,
    retryable_rate: f64,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl FlakyCollector {
    fn new(verbose: bool, retryable_rate: f64) -> Self {
        Self {
            inner: StdoutTransport::new(verbose),
            retryable_rate,
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl Transport for FlakyCollector {
    fn deliver(
        &self,
        data_type: DataType,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let fail = rand::thread_rng().gen_bool(self.retryable_rate);
        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if fail {
                return Err(DeliveryError::Retryable(format!(
                    "collector unavailable for {}",
                    data_type.endpoint()
                )));
            }
            self.inner.deliver(data_type, payload).await
        }
    }

    fn name(&self) -> &str {
        "flaky-collector"
    }
}

// =============================================================================
// SIMULATED APPLICATION
// =============================================================================

const MIDDLEWARE: [&str; 3] = ["Authenticate", "Session", "Router"];

fn sleep_micros(rng: &mut impl Rng, max: u64) {
    thread::sleep(Duration::from_micros(rng.gen_range(10..max)));
}

fn serve_request(agent: &Agent, rng: &mut impl Rng, request: usize) {
    let Ok(txn) = agent.begin_transaction("Controller/users/show", TransactionCategory::Web)
    else {
        return;
    };

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
        .saturating_sub(rng.gen_range(1..20));
    if let Some(queued) = parse_queue_start(&format!("t={millis}")) {
        let _ = agent.set_request_queue_start(queued);
    }
    let _ = agent.add_custom_attribute("request.id", request as i64);

    // Every tenth request is rejected by the first middleware.
    let depth = if request % 10 == 0 { 1 } else { MIDDLEWARE.len() };
    let mut open = Vec::with_capacity(depth);
    for name in &MIDDLEWARE[..depth] {
        if let Ok(seg) = agent.begin_segment(&format!("Middleware/{name}/call")) {
            open.push(seg);
        }
        sleep_micros(rng, 100);
    }

    if depth == MIDDLEWARE.len() {
        if let Ok(seg) = agent.begin_segment("Datastore/users/select") {
            sleep_micros(rng, 800);
            let _ = agent.end_segment(seg);
        }
        if rng.gen_bool(0.3) {
            if let Ok(seg) = agent.begin_segment("External/auth.example.com/GET") {
                sleep_micros(rng, 1_500);
                let _ = agent.end_segment(seg);
            }
        }
        if rng.gen_bool(0.05) {
            agent.notice_error(
                ErrorDescription::new("ActiveRecord::RecordNotFound", "user not found")
                    .with_expected(rng.gen_bool(0.5)),
                [("user.id", request as i64)],
            );
        }
    }

    for seg in open.into_iter().rev() {
        let _ = agent.end_segment(seg);
    }
    let _ = agent.end_transaction(txn);
}

fn run_job(agent: &Agent, rng: &mut impl Rng, job: usize) {
    let _ = agent.in_transaction("Jobs/ReportMailer", TransactionCategory::Background, || {
        if let Ok(seg) = agent.begin_segment("Datastore/reports/select") {
            sleep_micros(rng, 2_000);
            let _ = agent.end_segment(seg);
        }
        agent.record_custom_event(
            "ReportSent",
            [("job", job as i64), ("recipients", rng.gen_range(1..50))],
        )
    });
    agent.record_metric("Custom/Reports/queueDepth", rng.gen_range(0.0..100.0));
}

// =============================================================================
// MAIN APPLICATION
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let verbose = args.contains(&"--verbose".to_string());
    let quick = args.contains(&"--quick".to_string());

    let (workers, requests_per_worker) = if quick { (2, 50) } else { (8, 500) };

    println!("Demo Configuration:");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Verbose output: {}", verbose);
    println!("   Workers: {}", workers);
    println!("   Requests per worker: {}", requests_per_worker);
    println!();

    // =========================================================================
    // PHASE 1: Agent and harvest cycle
    // =========================================================================

    let config = AgentConfig::default()
        .with_app_name("demo-app")
        .with_run_id("demo-run-1")
        .with_harvest(
            HarvestConfig::uniform(Duration::from_millis(500))
                .with_period(DataType::Metrics, Duration::from_secs(1))
                .with_delivery_timeout(Duration::from_secs(2)),
        );
    let agent = Agent::new(config);
    let collector = Arc::new(FlakyCollector::new(verbose, 0.2));
    let cycle = agent.start_harvest(collector.clone());
    info!(workers, requests_per_worker, "harvest cycle started");

    // =========================================================================
    // PHASE 2: Simulated traffic
    // =========================================================================

    let start = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let agent = agent.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..requests_per_worker {
                    let request = w * requests_per_worker + i;
                    serve_request(&agent, &mut rng, request);
                    if i % 25 == 0 {
                        run_job(&agent, &mut rng, request);
                    }
                }
            })
        })
        .collect();

    let panicked = tokio::task::spawn_blocking(move || {
        handles
            .into_iter()
            .map(thread::JoinHandle::join)
            .filter(Result::is_err)
            .count()
    })
    .await?;
    let elapsed = start.elapsed();
    info!(panicked, ?elapsed, "traffic finished");

    // =========================================================================
    // PHASE 3: Shutdown with a final harvest
    // =========================================================================

    let final_outcomes = cycle.shutdown().await?;

    println!();
    println!("Final harvest:");
    for (data_type, outcome) in &final_outcomes {
        let line = match outcome {
            HarvestOutcome::Empty => "empty".to_string(),
            HarvestOutcome::Delivered { items } => format!("delivered {items}"),
            HarvestOutcome::Held { items } => format!("held {items} (lost at exit)"),
            HarvestOutcome::Dropped { items } => format!("dropped {items}"),
            HarvestOutcome::Inactive => "inactive".to_string(),
        };
        println!("   {:<28} {}", data_type.endpoint(), line);
    }

    println!();
    println!("Collector:");
    println!("   Attempts: {}", collector.attempts.load(Ordering::Relaxed));
    println!("   Simulated failures: {}", collector.failures.load(Ordering::Relaxed));
    println!(
        "   Requests: {} in {:.2?}",
        workers * requests_per_worker,
        elapsed
    );

    Ok(())
}
