//! Deltas and subscription filters.

use serde::{Deserialize, Serialize};

use crate::events::{EventRecord, TaskId, TaskStatus, TaskSummary};
use crate::fleet::FleetLogRecord;
use crate::health::HealthTransition;
use crate::state::{EntityKey, EntityKind, StateDelta};

/// A change pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum Delta {
    State(StateDelta),
    Health(HealthTransition),
    TaskCreated(TaskSummary),
    PhaseAppended {
        task_id: TaskId,
        phase: u32,
    },
    TaskEvent {
        record: EventRecord,
        /// Derived task status after the event
        status: TaskStatus,
        /// Arrived after a terminal event and left the status unchanged
        #[serde(default)]
        stale: bool,
    },
    FleetLog(FleetLogRecord),
}

impl Delta {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::State(_) => "state",
            Self::Health(_) => "health",
            Self::TaskCreated(_) => "task_created",
            Self::PhaseAppended { .. } => "phase_appended",
            Self::TaskEvent { .. } => "task_event",
            Self::FleetLog(_) => "fleet_log",
        }
    }

    /// Entity this delta is about, for state and health deltas.
    pub fn entity(&self) -> Option<&EntityKey> {
        match self {
            Self::State(delta) => Some(&delta.key),
            Self::Health(transition) => Some(&transition.key),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskCreated(summary) => Some(&summary.task_id),
            Self::PhaseAppended { task_id, .. } => Some(task_id),
            Self::TaskEvent { record, .. } => Some(&record.task_id),
            _ => None,
        }
    }
}

/// One thing a subscriber can follow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Topic {
    /// State and health of every entity of a kind
    Kind { kind: EntityKind },
    /// State and health of one entity
    Entity { key: EntityKey },
    /// Every task delta
    Tasks,
    Task { task_id: TaskId },
    /// Every log entry of a fleet
    Fleet { fleet: String },
    /// One robot's fleet log entries
    Robot { fleet: String, robot: String },
}

impl Topic {
    pub fn matches(&self, delta: &Delta) -> bool {
        match self {
            Self::Kind { kind } => delta.entity().is_some_and(|key| key.kind == *kind),
            Self::Entity { key } => delta.entity() == Some(key),
            Self::Tasks => delta.task_id().is_some(),
            Self::Task { task_id } => delta.task_id() == Some(task_id),
            Self::Fleet { fleet } => {
                matches!(delta, Delta::FleetLog(record) if &record.fleet == fleet)
            }
            Self::Robot { fleet, robot } => matches!(
                delta,
                Delta::FleetLog(record)
                    if &record.fleet == fleet && record.robot.as_ref() == Some(robot)
            ),
        }
    }
}

/// Set of topics; a delta passes if any topic matches. No topics means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: Topic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn kind(self, kind: EntityKind) -> Self {
        self.topic(Topic::Kind { kind })
    }

    pub fn entity(self, key: EntityKey) -> Self {
        self.topic(Topic::Entity { key })
    }

    pub fn task(self, task_id: impl Into<TaskId>) -> Self {
        self.topic(Topic::Task {
            task_id: task_id.into(),
        })
    }

    pub fn tasks(self) -> Self {
        self.topic(Topic::Tasks)
    }

    pub fn fleet(self, fleet: impl Into<String>) -> Self {
        self.topic(Topic::Fleet {
            fleet: fleet.into(),
        })
    }

    pub fn robot(self, fleet: impl Into<String>, robot: impl Into<String>) -> Self {
        self.topic(Topic::Robot {
            fleet: fleet.into(),
            robot: robot.into(),
        })
    }

    pub fn matches(&self, delta: &Delta) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|topic| topic.matches(delta))
    }
}
