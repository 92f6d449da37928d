//! Fleet log aggregation.
//!
//! - `entry`: fleet log records and their journal form
//! - `log`: per-fleet logs nesting one sub-log per robot

pub mod entry;
pub mod log;

pub use entry::{FleetEntry, FleetJournal, FleetLogRecord, FleetSummary, LogTier, RobotLogSummary};
pub use log::FleetLog;
