//! Task, phase and event records of the hierarchical audit log.
//!
//! This module provides:
//! - `TaskId` and `TaskStatus`
//! - the closed set of event kinds and which task status each one implies
//! - `EventRecord`, the immutable leaf of the log
//! - `TaskJournal`, the durable form of every log mutation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::FleetError;

// =============================================================================
// Task IDs
// =============================================================================

/// Identifier of a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Task Status
// =============================================================================

/// Overall status of a task, derived from its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Terminal statuses are sticky.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(FleetError::invalid_field(
                "status",
                format!("unknown task status '{}'", other),
            )),
        }
    }
}

// =============================================================================
// Event Kinds
// =============================================================================

/// Every kind of event a task log can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Task is waiting for a robot
    Queued,
    /// A fleet/robot was chosen; payload carries `fleet` and `robot`
    Assigned,
    Started,
    Progress,
    /// Free-form audit note
    Log,
    /// Robot state observed while working on the task
    RobotState,
    Completed,
    Failed,
    Canceled,
}

impl EventKind {
    /// Status this kind moves the task to, or `None` if it carries no status.
    pub fn status_effect(&self) -> Option<TaskStatus> {
        match self {
            Self::Queued => Some(TaskStatus::Queued),
            Self::Started | Self::Progress => Some(TaskStatus::Active),
            Self::Completed => Some(TaskStatus::Completed),
            Self::Failed => Some(TaskStatus::Failed),
            Self::Canceled => Some(TaskStatus::Canceled),
            Self::Assigned | Self::Log | Self::RobotState => None,
        }
    }

    pub fn is_status_bearing(&self) -> bool {
        self.status_effect().is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status_effect().is_some_and(|status| status.is_terminal())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Log => "log",
            Self::RobotState => "robot_state",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "started" => Ok(Self::Started),
            "progress" => Ok(Self::Progress),
            "log" => Ok(Self::Log),
            "robot_state" => Ok(Self::RobotState),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(FleetError::invalid_field(
                "kind",
                format!("unknown event kind '{}'", other),
            )),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,

    /// When the event occurred at its source
    pub timestamp: DateTime<Utc>,

    /// Opaque payload, stored verbatim
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,

    /// Correlation ID for joining with fleet logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl TaskEvent {
    /// A new event of `kind` happening now.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
            correlation_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// An appended, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub task_id: TaskId,
    pub phase: u32,
    /// Per-task sequence number, strictly increasing from 1
    pub seq: u64,
    pub appended_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TaskEvent,
}

/// Dispatch metadata recorded when a task is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Dispatch request body, stored verbatim
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub request: serde_json::Value,
}

impl TaskMeta {
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            category: None,
            requester: None,
            created_at: Utc::now(),
            request: serde_json::Value::Null,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_request(mut self, request: serde_json::Value) -> Self {
        self.request = request;
        self
    }
}

// =============================================================================
// Journal
// =============================================================================

/// Durable form of one task log mutation, in the order it was committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskJournal {
    Created(TaskMeta),
    PhaseAppended { index: u32, at: DateTime<Utc> },
    EventAppended(EventRecord),
}

impl TaskJournal {
    /// Drop entries superseded by a retry.
    ///
    /// A write reported as failed may still have landed in the stream. The
    /// retry reuses the creation, phase index or seq the failed write claimed,
    /// so of two entries claiming the same slot the later one is committed.
    pub fn settle(journal: Vec<TaskJournal>) -> Vec<TaskJournal> {
        let mut kept: Vec<Option<TaskJournal>> = Vec::with_capacity(journal.len());
        let mut created: Option<usize> = None;
        let mut phases: HashMap<u32, usize> = HashMap::new();
        let mut events: HashMap<u64, usize> = HashMap::new();

        for entry in journal {
            let position = kept.len();
            let superseded = match &entry {
                // Only a creation with nothing after it can have been retried.
                TaskJournal::Created(_) => match created {
                    Some(_) if kept.iter().flatten().count() == 1 => created.replace(position),
                    Some(_) => None,
                    None => created.replace(position),
                },
                TaskJournal::PhaseAppended { index, .. } => phases.insert(*index, position),
                TaskJournal::EventAppended(record) => events.insert(record.seq, position),
            };
            if let Some(earlier) = superseded {
                kept[earlier] = None;
            }
            kept.push(Some(entry));
        }
        kept.into_iter().flatten().collect()
    }
}
