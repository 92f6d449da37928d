//! Ingestion dispatcher: validation, routing and the paired durable writes.
//!
//! Every accepted report is made durable exactly once before it becomes
//! visible:
//!
//! | Entity | Durable commit point | Best effort |
//! |--------|----------------------|-------------|
//! | robot  | fleet log entry on `fleet/<fleet>` | checkpoint, task `robot_state` event |
//! | fleet  | checkpoint | roster registration |
//! | others | checkpoint | - |
//!
//! The commit point runs under the entity's writer lock before the in-memory
//! record is replaced, so a failed write leaves both the record and the log
//! untouched. Best-effort writes are logged on failure and rebuilt on restart.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::command::{CommandOutcome, TaskCommand};
use super::report::RawReport;
use crate::broadcast::{Delta, DeltaSink};
use crate::error::Result;
use crate::events::{EventKind, TaskEvent, TaskLog, TaskMeta};
use crate::fleet::{FleetEntry, FleetLog};
use crate::health::HealthTracker;
use crate::state::{EntityKey, EntityRecord, EntityState, RecordStore, StateDelta, UpsertOutcome};
use crate::storage::{checkpoint_key, DurableStore, DurableStoreExt};
use crate::telemetry::{IngestMetrics, StorageMetrics};

/// Result of submitting a valid report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted { delta: StateDelta },
    /// Not newer than the last accepted report; nothing changed
    Discarded {
        key: EntityKey,
        seq: u64,
        last_seq: u64,
    },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Accepted { delta } => &delta.key,
            Self::Discarded { key, .. } => key,
        }
    }
}

/// Anything the dispatcher accepts, as read off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Report(RawReport),
    Command(TaskCommand),
}

/// Robot status change worth recording on the robot's current task.
struct TaskNote {
    task_id: String,
    event: TaskEvent,
}

/// Routes reports and commands to the store, the logs and the broadcaster.
pub struct Dispatcher {
    store: Arc<dyn DurableStore>,
    records: Arc<RecordStore>,
    health: Arc<HealthTracker>,
    tasks: Arc<TaskLog>,
    fleets: Arc<FleetLog>,
    sink: Arc<dyn DeltaSink>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DurableStore>,
        records: Arc<RecordStore>,
        health: Arc<HealthTracker>,
        tasks: Arc<TaskLog>,
        fleets: Arc<FleetLog>,
        sink: Arc<dyn DeltaSink>,
    ) -> Self {
        Self {
            store,
            records,
            health,
            tasks,
            fleets,
            sink,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reports
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate and apply one report.
    ///
    /// Malformed reports fail with an invalid-report error and change
    /// nothing. A report that is not newer than the entity's last accepted
    /// one is discarded silently and still counts as a sign of life.
    #[instrument(skip(self, report), fields(entity_type = %report.entity_type, entity_id = %report.entity_id))]
    pub fn submit(&self, report: &RawReport) -> Result<SubmitOutcome> {
        let timer = IngestMetrics::start(&report.entity_type);

        let candidate = match report.validate() {
            Ok(candidate) => candidate,
            Err(e) => {
                timer.finish("invalid");
                warn!(error = %e, "Rejected malformed report");
                return Err(e);
            }
        };
        let key = candidate.key.clone();
        let seq = candidate.seq;
        let reported_at = candidate.reported_at;
        let roster = match &candidate.state {
            EntityState::Fleet(fleet) => Some(fleet.robots.clone()),
            _ => None,
        };

        let mut task_note = None;
        let result = self.records.upsert_with(
            candidate,
            |record, previous| self.persist(record, previous, &mut task_note),
            |delta| self.after_commit(delta, roster),
        );

        let outcome = match result {
            Ok(UpsertOutcome::Accepted(delta)) => SubmitOutcome::Accepted { delta },
            Ok(UpsertOutcome::Stale { last_seq }) => {
                self.health.observe(&key, reported_at);
                SubmitOutcome::Discarded {
                    key: key.clone(),
                    seq,
                    last_seq,
                }
            }
            Err(e) => {
                timer.finish("storage_error");
                return Err(e);
            }
        };

        if outcome.is_accepted() {
            if let Some(note) = task_note {
                self.record_on_task(&key, note);
            }
            timer.finish("accepted");
            debug!(entity = %key, seq, "Report accepted");
        } else {
            timer.finish("discarded");
            debug!(entity = %key, seq, "Report discarded as stale");
        }
        Ok(outcome)
    }

    /// Durable commit for one accepted record.
    fn persist(
        &self,
        record: &EntityRecord,
        previous: Option<&EntityRecord>,
        task_note: &mut Option<TaskNote>,
    ) -> Result<()> {
        match &record.state {
            EntityState::Robot(robot) => {
                self.fleets
                    .append_robot_entry(&robot.fleet, &record.key.id, FleetEntry::State(record.clone()))?;
                if let Err(e) = self.store.put_json(&checkpoint_key(&record.key), record) {
                    StorageMetrics::failure("checkpoint");
                    warn!(entity = %record.key, error = %e, "Checkpoint write failed; fleet log holds the record");
                }

                let before = previous.and_then(|p| p.state.as_robot());
                let changed = before.map_or(true, |b| b.mode != robot.mode || b.task_id != robot.task_id);
                if let (true, Some(task_id)) = (changed, &robot.task_id) {
                    *task_note = Some(TaskNote {
                        task_id: task_id.clone(),
                        event: TaskEvent::new(EventKind::RobotState)
                            .at(record.reported_at)
                            .with_payload(serde_json::json!({
                                "robot": record.key.id,
                                "fleet": robot.fleet,
                                "mode": robot.mode,
                                "battery_percent": robot.battery_percent,
                            })),
                    });
                }
                Ok(())
            }
            _ => self
                .store
                .put_json(&checkpoint_key(&record.key), record)
                .map_err(|e| {
                    StorageMetrics::failure("checkpoint");
                    tracing::error!(entity = %record.key, error = %e, "Checkpoint write failed");
                    e
                }),
        }
    }

    /// Runs under the entity's writer lock once the record is visible.
    fn after_commit(&self, delta: &StateDelta, roster: Option<Vec<String>>) {
        self.sink.emit(Delta::State(delta.clone()));
        self.health.observe(&delta.key, delta.reported_at);
        if let Some(robots) = roster {
            if let Err(e) = self.fleets.register_roster(&delta.key.id, &robots) {
                warn!(fleet = %delta.key.id, error = %e, "Fleet roster registration failed");
            }
        }
    }

    /// Note a robot's mode change on the task it reports working on.
    fn record_on_task(&self, robot: &EntityKey, note: TaskNote) {
        match self
            .tasks
            .append_to_latest_phase(&note.task_id, note.event, false)
        {
            Ok(outcome) => {
                debug!(robot = %robot, task_id = %note.task_id, seq = outcome.seq(), "Robot state noted on task");
            }
            Err(e) if e.is_not_found() => {
                debug!(robot = %robot, task_id = %note.task_id, "Robot reports a task the log does not hold");
            }
            Err(e) => {
                warn!(robot = %robot, task_id = %note.task_id, error = %e, "Failed to note robot state on task");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, command), fields(command = command.kind(), task_id = command.task_id()))]
    pub fn submit_command(&self, command: TaskCommand) -> Result<CommandOutcome> {
        let kind = command.kind();
        let result = command.validate().and_then(|()| self.apply_command(command));
        match &result {
            Ok(_) => IngestMetrics::command(kind, "ok"),
            Err(e) if e.is_invalid_report() => IngestMetrics::command(kind, "invalid"),
            Err(e) if e.is_not_found() => IngestMetrics::command(kind, "not_found"),
            Err(_) => IngestMetrics::command(kind, "error"),
        }
        result
    }

    fn apply_command(&self, command: TaskCommand) -> Result<CommandOutcome> {
        match command {
            TaskCommand::Dispatch {
                task_id,
                category,
                requester,
                request,
            } => {
                let mut meta = TaskMeta::new(task_id.as_str()).with_request(request.clone());
                meta.category = category;
                meta.requester = requester;
                self.tasks.create_task(meta)?;
                let phase = self.tasks.append_phase(&task_id)?;
                let queued = TaskEvent::new(EventKind::Queued)
                    .with_payload(request)
                    .with_correlation(Uuid::new_v4().to_string());
                self.tasks.append_event(&task_id, phase, queued)?;
                let task = self.tasks.summary(&task_id)?;
                debug!(task_id = %task_id, "Task dispatched");
                Ok(CommandOutcome::Dispatched { task })
            }
            TaskCommand::Cancel {
                task_id,
                requester,
                reason,
            } => {
                let event = TaskEvent::new(EventKind::Canceled)
                    .with_payload(serde_json::json!({ "requester": requester, "reason": reason }));
                let event = self.tasks.append_to_latest_phase(&task_id, event, true)?;
                if event.is_stale() {
                    debug!(task_id = %task_id, "Cancel arrived after the task finished");
                }
                Ok(CommandOutcome::Canceled { event })
            }
        }
    }

    /// Route either kind of inbound message.
    pub fn submit_inbound(&self, inbound: Inbound) -> Result<InboundOutcome> {
        match inbound {
            Inbound::Report(report) => self.submit(&report).map(InboundOutcome::Report),
            Inbound::Command(command) => self.submit_command(command).map(InboundOutcome::Command),
        }
    }
}

/// Outcome of [`Dispatcher::submit_inbound`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundOutcome {
    Report(SubmitOutcome),
    Command(CommandOutcome),
}
