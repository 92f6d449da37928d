//! Status folding over task events.
//!
//! Task and phase status are never stored directly: they are folded from the
//! event sequence. An aggregate starts at its `Default` state and folds each
//! event via `apply`; given the same events the result is deterministic, which
//! is what makes replay after a restart produce the pre-crash view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{EventKind, EventRecord, TaskStatus};

// =============================================================================
// Aggregate Trait
// =============================================================================

/// State reconstructed from a sequence of event records.
pub trait Aggregate: Default {
    /// Fold one record. Must not perform I/O or fail: every persisted record
    /// is valid by definition.
    fn apply(&mut self, record: &EventRecord) -> Transition;

    /// Rebuild from scratch.
    fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a EventRecord>,
    {
        let mut aggregate = Self::default();
        for record in records {
            aggregate.apply(record);
        }
        aggregate
    }
}

/// What an appended event did to the task's derived status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Transition {
    /// Status-bearing event folded in.
    Applied { from: TaskStatus, to: TaskStatus },
    /// Event carries no status.
    NoStatusChange,
    /// Status-bearing event after a terminal one. Stored for audit; status unchanged.
    Stale { status: TaskStatus, attempted: TaskStatus },
}

impl Transition {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

// =============================================================================
// Task Aggregate
// =============================================================================

/// Per-phase fold state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseFold {
    /// Status of the last status-bearing event in this phase
    pub status: Option<TaskStatus>,
    pub event_count: u64,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
}

/// Reconstructed task view derived from its events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskAggregate {
    /// First terminal status seen; sticky once set
    pub terminal: Option<TaskStatus>,
    pub phases: Vec<PhaseFold>,
    pub assigned_fleet: Option<String>,
    pub assigned_robot: Option<String>,
    /// Timestamp of the first `started` event
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp of the terminal event
    pub finished_at: Option<DateTime<Utc>>,
    pub last_seq: u64,
    pub event_count: u64,
    pub stale_count: u64,
}

impl TaskAggregate {
    /// Derived task status.
    ///
    /// A terminal event wins outright. Otherwise the latest phase's last
    /// status-bearing event decides, falling back to earlier phases when the
    /// latest has none yet. A task with no status-bearing events is queued.
    pub fn status(&self) -> TaskStatus {
        if let Some(terminal) = self.terminal {
            return terminal;
        }
        self.phases
            .iter()
            .rev()
            .find_map(|phase| phase.status)
            .unwrap_or(TaskStatus::Queued)
    }

    /// Derived status of one phase; `Queued` until it has a status-bearing event.
    pub fn phase_status(&self, phase: u32) -> Option<TaskStatus> {
        self.phases
            .get(phase as usize)
            .map(|fold| fold.status.unwrap_or(TaskStatus::Queued))
    }

    fn ensure_phase(&mut self, phase: u32) -> &mut PhaseFold {
        let index = phase as usize;
        if self.phases.len() <= index {
            self.phases.resize_with(index + 1, PhaseFold::default);
        }
        &mut self.phases[index]
    }

    /// Register a phase created with no events yet.
    pub fn add_phase(&mut self, phase: u32) {
        self.ensure_phase(phase);
    }

    fn record_assignment(&mut self, payload: &serde_json::Value) {
        if let Some(fleet) = payload.get("fleet").and_then(|v| v.as_str()) {
            self.assigned_fleet = Some(fleet.to_string());
        }
        if let Some(robot) = payload.get("robot").and_then(|v| v.as_str()) {
            self.assigned_robot = Some(robot.to_string());
        }
    }
}

impl Aggregate for TaskAggregate {
    fn apply(&mut self, record: &EventRecord) -> Transition {
        let before = self.status();
        let kind = record.event.kind;

        self.event_count += 1;
        self.last_seq = self.last_seq.max(record.seq);
        {
            let phase = self.ensure_phase(record.phase);
            phase.event_count += 1;
            phase.first_seq.get_or_insert(record.seq);
            phase.last_seq = Some(record.seq);
        }

        if kind == EventKind::Assigned {
            self.record_assignment(&record.event.payload);
        }

        let Some(effect) = kind.status_effect() else {
            return Transition::NoStatusChange;
        };

        if let Some(status) = self.terminal {
            self.stale_count += 1;
            return Transition::Stale {
                status,
                attempted: effect,
            };
        }

        self.ensure_phase(record.phase).status = Some(effect);
        if kind == EventKind::Started && self.started_at.is_none() {
            self.started_at = Some(record.event.timestamp);
        }
        if effect.is_terminal() {
            self.terminal = Some(effect);
            self.finished_at = Some(record.event.timestamp);
        }

        Transition::Applied {
            from: before,
            to: self.status(),
        }
    }
}
