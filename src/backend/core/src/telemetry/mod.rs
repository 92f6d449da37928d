//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing-subscriber` with JSON/pretty/compact output and per-module levels
//! - **Metrics**: counters, gauges and histograms through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use fleetlog_core::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{
    describe_metrics, BroadcastMetrics, HealthMetrics, IngestMetrics, IngestTimer, LogMetrics,
    StorageMetrics,
};
