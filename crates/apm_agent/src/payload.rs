//! JSON wire payloads, one shape per endpoint family.
//!
//! | Endpoint | Shape |
//! |----------|-------|
//! | `metric_data` | `[run_id, start_s, end_s, [[spec, stats], ...]]` |
//! | `transaction_sample_data` | `[run_id, [trace, ...]]` |
//! | `error_data` | `[run_id, [error_trace, ...]]` |
//! | `*_event_data` | `[run_id, {reservoir_size, events_seen}, [event, ...]]` |

use crate::harvest::Harvested;
use crate::metrics::{MetricSnapshot, MetricSpec, Stats};
use crate::transport::DeliveryError;

/// Encodes harvested data for delivery.
pub fn encode(run_id: &str, data: &Harvested) -> Result<Vec<u8>, DeliveryError> {
    let bytes = match data {
        Harvested::Metrics(snapshot) => serde_json::to_vec(&metric_body(run_id, snapshot)),
        Harvested::Traces(traces) => serde_json::to_vec(&(run_id, traces)),
        Harvested::ErrorTraces(traces) => serde_json::to_vec(&(run_id, traces)),
        Harvested::Events { events, stats } => serde_json::to_vec(&(run_id, stats, events)),
    };
    bytes.map_err(|e| DeliveryError::Serialization(e.to_string()))
}

fn metric_body<'a>(
    run_id: &'a str,
    snapshot: &'a MetricSnapshot,
) -> (&'a str, f64, f64, Vec<(&'a MetricSpec, &'a Stats)>) {
    (
        run_id,
        snapshot.start.as_secs_f64(),
        snapshot.end.as_secs_f64(),
        snapshot.iter().collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Attributes, CustomEvent, Event, Priority};
    use crate::metrics::MetricAggregator;
    use crate::reservoir::SamplingStats;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn decode(data: &Harvested) -> Value {
        serde_json::from_slice(&encode("run-1", data).unwrap()).unwrap()
    }

    #[test]
    fn test_metric_payload_shape() {
        let agg = MetricAggregator::new(1);
        agg.record("Custom/a", Some("Controller/x"), Duration::from_secs(2), Duration::from_secs(1));
        let value = decode(&Harvested::Metrics(agg.harvest()));

        assert_eq!(value[0], "run-1");
        assert!(value[1].is_f64());
        assert_eq!(
            value[3],
            json!([[{"name": "Custom/a", "scope": "Controller/x"}, [1, 2.0, 1.0, 2.0, 2.0, 4.0]]])
        );
    }

    #[test]
    fn test_event_payload_carries_sampling_stats() {
        let mut intrinsics = Attributes::new();
        intrinsics.insert_intrinsic("type", "Purchase");
        let event = Event::Custom(CustomEvent {
            intrinsics,
            custom: Attributes::new(),
            priority: Priority::new(0.3),
        });
        let stats = SamplingStats {
            capacity: 10,
            seen: 4,
            kept: 1,
        };
        let value = decode(&Harvested::Events {
            events: vec![event],
            stats,
        });
        assert_eq!(
            value,
            json!(["run-1", {"reservoir_size": 10, "events_seen": 4}, [[{"type": "Purchase"}, {}]]])
        );
    }

    #[test]
    fn test_empty_trace_payloads() {
        assert_eq!(decode(&Harvested::Traces(Vec::new())), json!(["run-1", []]));
        assert_eq!(decode(&Harvested::ErrorTraces(Vec::new())), json!(["run-1", []]));
    }
}
