//! Engine metrics through the `metrics` facade.
//!
//! The core only emits; installing a recorder (Prometheus or otherwise) is the
//! host process's business. Without a recorder every call here is a no-op.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleetlog_core::telemetry::metrics::IngestMetrics;
//!
//! let timer = IngestMetrics::start("robot");
//! // ... handle the report ...
//! timer.finish("accepted");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;
use std::time::Instant;

static DESCRIBE: Once = Once::new();

/// Register descriptions for every metric the engine emits.
///
/// Safe to call more than once; only the first call registers.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        // Ingestion
        describe_counter!("fleetlog_reports_total", "Reports submitted, by entity type and outcome");
        describe_histogram!(
            "fleetlog_report_duration_seconds",
            "Time spent handling one report"
        );
        describe_counter!("fleetlog_commands_total", "Task commands submitted, by kind and outcome");

        // Logs
        describe_counter!("fleetlog_task_events_total", "Events appended to task logs");
        describe_counter!("fleetlog_task_phases_total", "Phases appended to task logs");
        describe_counter!(
            "fleetlog_stale_transitions_total",
            "Status-bearing events appended after a terminal event"
        );
        describe_counter!("fleetlog_robot_entries_total", "Entries appended to fleet robot logs");

        // Health
        describe_counter!("fleetlog_health_transitions_total", "Health status changes");
        describe_gauge!("fleetlog_unhealthy_entities", "Entities currently unhealthy");

        // Broadcast
        describe_gauge!("fleetlog_subscribers", "Live subscriptions");
        describe_counter!("fleetlog_deltas_published_total", "Deltas handed to the broadcaster");
        describe_counter!("fleetlog_deltas_delivered_total", "Deltas enqueued to a subscriber");
        describe_counter!(
            "fleetlog_backpressure_closures_total",
            "Subscriptions closed because their buffer was full"
        );

        // Storage
        describe_counter!("fleetlog_storage_failures_total", "Durable store operations that failed");

        // Errors
        describe_counter!("fleetlog_errors_total", "Errors constructed, by code");
    });
}

/// Report ingestion counters and latency.
pub struct IngestMetrics;

impl IngestMetrics {
    /// Count one report outcome.
    pub fn record(entity_type: &str, outcome: &'static str) {
        counter!(
            "fleetlog_reports_total",
            "entity_type" => entity_type.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    /// Start timing a report.
    pub fn start(entity_type: &str) -> IngestTimer {
        IngestTimer {
            start: Instant::now(),
            entity_type: entity_type.to_string(),
        }
    }

    /// Count one task command outcome.
    pub fn command(kind: &'static str, outcome: &'static str) {
        counter!(
            "fleetlog_commands_total",
            "kind" => kind,
            "outcome" => outcome,
        )
        .increment(1);
    }
}

/// Timer for one report; records latency and outcome when finished.
pub struct IngestTimer {
    start: Instant,
    entity_type: String,
}

impl IngestTimer {
    /// Finish timing and record the outcome.
    pub fn finish(self, outcome: &'static str) {
        histogram!(
            "fleetlog_report_duration_seconds",
            "entity_type" => self.entity_type.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
        IngestMetrics::record(&self.entity_type, outcome);
    }
}

/// Task and fleet log counters.
pub struct LogMetrics;

impl LogMetrics {
    pub fn event_appended(kind: &'static str) {
        counter!("fleetlog_task_events_total", "kind" => kind).increment(1);
    }

    pub fn phase_appended() {
        counter!("fleetlog_task_phases_total").increment(1);
    }

    pub fn stale_transition(kind: &'static str) {
        counter!("fleetlog_stale_transitions_total", "kind" => kind).increment(1);
    }

    pub fn robot_entry_appended(fleet: &str) {
        counter!("fleetlog_robot_entries_total", "fleet" => fleet.to_string()).increment(1);
    }
}

/// Health tracker gauges and counters.
pub struct HealthMetrics;

impl HealthMetrics {
    pub fn transition(entity_type: &str, to: &'static str) {
        counter!(
            "fleetlog_health_transitions_total",
            "entity_type" => entity_type.to_string(),
            "to" => to,
        )
        .increment(1);
    }

    pub fn set_unhealthy(count: usize) {
        gauge!("fleetlog_unhealthy_entities").set(count as f64);
    }
}

/// Broadcaster counters.
pub struct BroadcastMetrics;

impl BroadcastMetrics {
    pub fn set_subscribers(count: usize) {
        gauge!("fleetlog_subscribers").set(count as f64);
    }

    pub fn published(kind: &'static str) {
        counter!("fleetlog_deltas_published_total", "kind" => kind).increment(1);
    }

    pub fn delivered(count: u64) {
        counter!("fleetlog_deltas_delivered_total").increment(count);
    }

    pub fn backpressure_closed() {
        counter!("fleetlog_backpressure_closures_total").increment(1);
    }
}

/// Durable store failures.
pub struct StorageMetrics;

impl StorageMetrics {
    pub fn failure(operation: &'static str) {
        counter!("fleetlog_storage_failures_total", "operation" => operation).increment(1);
    }
}
