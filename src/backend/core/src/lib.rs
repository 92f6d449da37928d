#![allow(clippy::result_large_err)]
//! # Fleetlog Core
//!
//! Live fleet state aggregation and hierarchical task audit log.
//!
//! ## Architecture
//!
//! - **State**: latest accepted record per robot, door, lift, workcell and fleet, ordered by source sequence numbers
//! - **Health**: recency-based health per entity with a background sweep
//! - **Events**: task → phase → event audit log with derived task status
//! - **Fleet**: per-fleet log with per-robot sub-logs and a roster
//! - **Broadcast**: filtered change subscriptions with bounded per-subscriber buffers
//! - **Ingest**: report validation and dispatch/cancel commands
//! - **Storage**: durable checkpoints and append-only journals (in-memory or sled)
//! - **Engine**: the facade that wires everything together and recovers it on open
//! - **Pagination**: scope-bound cursors over logs and listings
//! - **Telemetry**: structured logging and metrics

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fleet;
pub mod health;
pub mod ingest;
pub mod pagination;
pub mod state;
pub mod storage;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, FleetError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broadcast::{
        CloseReason, Delta, Notification, Subscription, SubscriptionFilter, Topic,
    };
    pub use crate::config::{Config, EngineConfig, StorageBackend, StorageConfig};
    pub use crate::engine::{FleetEngine, RecoveryReport};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, FleetError, Result};
    pub use crate::events::{
        AppendOutcome, EventKind, EventRecord, PhaseSummary, TaskEvent, TaskMeta, TaskQuery,
        TaskStatus, TaskSummary,
    };
    pub use crate::fleet::{FleetEntry, FleetLogRecord, FleetSummary, LogTier, RobotLogSummary};
    pub use crate::health::{Health, HealthStatus, HealthTransition};
    pub use crate::ingest::{CommandOutcome, Inbound, InboundOutcome, RawReport, SubmitOutcome, TaskCommand};
    pub use crate::pagination::{Page, PageRequest};
    pub use crate::state::{EntityKey, EntityKind, EntityRecord, EntityState, StateDelta};
}
