//! The task → phase → event log.
//!
//! Each task owns a set of arena tables: its phases in index order and its
//! events keyed by the composite `(phase, seq)`. Sequence numbers are per
//! task and assigned under the task's writer lock, so appends to one task are
//! serialized while appends to different tasks proceed independently.
//!
//! Every mutation is written to the task's durable stream first and only
//! then committed to the in-memory tables. A failed durable write leaves the
//! tables and the sequence counter exactly as they were.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use super::aggregate::{Aggregate, PhaseFold, TaskAggregate, Transition};
use super::event::{EventRecord, TaskEvent, TaskId, TaskJournal, TaskMeta, TaskStatus};
use crate::broadcast::{Delta, DeltaSink};
use crate::error::{ErrorCode, FleetError, Result};
use crate::pagination::{paginate_seq, scope, Page};
use crate::storage::{task_stream, DurableStore, DurableStoreExt};
use crate::telemetry::{LogMetrics, StorageMetrics};

/// Result of a successful event append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub record: EventRecord,
    pub transition: Transition,
}

impl AppendOutcome {
    pub fn seq(&self) -> u64 {
        self.record.seq
    }

    /// The append was stored but arrived after a terminal event.
    pub fn is_stale(&self) -> bool {
        self.transition.is_stale()
    }
}

/// One row of the phase table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub index: u32,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<Utc>,
    pub event_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

/// Dashboard-level view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_fleet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_robot: Option<String>,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<Utc>>,
    pub phase_count: u32,
    pub last_seq: u64,
}

#[derive(Debug, Clone)]
struct PhaseRow {
    created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TaskTables {
    meta: TaskMeta,
    phases: Vec<PhaseRow>,
    events: BTreeMap<(u32, u64), EventRecord>,
    aggregate: TaskAggregate,
    next_seq: u64,
}

impl TaskTables {
    fn new(meta: TaskMeta) -> Self {
        Self {
            meta,
            phases: Vec::new(),
            events: BTreeMap::new(),
            aggregate: TaskAggregate::default(),
            next_seq: 1,
        }
    }

    fn push_phase(&mut self, created_at: chrono::DateTime<Utc>) -> u32 {
        let index = self.phases.len() as u32;
        self.phases.push(PhaseRow { created_at });
        self.aggregate.add_phase(index);
        index
    }

    fn push_event(&mut self, record: EventRecord) -> Transition {
        let transition = self.aggregate.apply(&record);
        self.next_seq = self.next_seq.max(record.seq + 1);
        self.events.insert((record.phase, record.seq), record);
        transition
    }

    fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.meta.task_id.clone(),
            category: self.meta.category.clone(),
            requester: self.meta.requester.clone(),
            assigned_fleet: self.aggregate.assigned_fleet.clone(),
            assigned_robot: self.aggregate.assigned_robot.clone(),
            status: self.aggregate.status(),
            created_at: self.meta.created_at,
            started_at: self.aggregate.started_at,
            finished_at: self.aggregate.finished_at,
            phase_count: self.phases.len() as u32,
            last_seq: self.aggregate.last_seq,
        }
    }

    fn phase_summaries(&self) -> Vec<PhaseSummary> {
        let empty = PhaseFold::default();
        self.phases
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let fold = self.aggregate.phases.get(i).unwrap_or(&empty);
                PhaseSummary {
                    index: i as u32,
                    status: fold.status.unwrap_or(TaskStatus::Queued),
                    created_at: row.created_at,
                    event_count: fold.event_count,
                    first_seq: fold.first_seq,
                    last_seq: fold.last_seq,
                }
            })
            .collect()
    }
}

#[derive(Default)]
struct TaskSlot {
    writer: Mutex<()>,
    tables: RwLock<Option<TaskTables>>,
}

/// Hierarchical event log for every task.
pub struct TaskLog {
    store: Arc<dyn DurableStore>,
    tasks: DashMap<TaskId, Arc<TaskSlot>>,
    sink: Option<Arc<dyn DeltaSink>>,
}

impl TaskLog {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            tasks: DashMap::new(),
            sink: None,
        }
    }

    /// Emit a delta for every committed mutation, in commit order per task.
    pub fn with_sink(mut self, sink: Arc<dyn DeltaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn emit(&self, delta: impl FnOnce() -> Delta) {
        if let Some(sink) = &self.sink {
            sink.emit(delta());
        }
    }

    fn slot(&self, task_id: &str) -> Option<Arc<TaskSlot>> {
        self.tasks.get(task_id).map(|slot| slot.clone())
    }

    fn slot_or_insert(&self, task_id: &str) -> Arc<TaskSlot> {
        if let Some(slot) = self.slot(task_id) {
            return slot;
        }
        self.tasks.entry(TaskId::from(task_id)).or_default().clone()
    }

    fn journal(&self, task_id: &str, entry: &TaskJournal) -> Result<()> {
        self.store
            .append_json(&task_stream(task_id), entry)
            .map(|_| ())
            .map_err(|e| {
                StorageMetrics::failure("task_append");
                error!(task_id = %task_id, error = %e, "Durable task log append failed");
                e
            })
    }

    /// Run `f` against a task's committed tables under its read lock.
    fn read<T>(&self, task_id: &str, f: impl FnOnce(&TaskTables) -> Result<T>) -> Result<T> {
        let slot = self
            .slot(task_id)
            .ok_or_else(|| FleetError::task_not_found(task_id))?;
        let tables = slot.tables.read();
        match tables.as_ref() {
            Some(tables) => f(tables),
            None => Err(FleetError::task_not_found(task_id)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a task. Fails with `TaskAlreadyExists` if the ID is taken.
    #[instrument(skip(self, meta), fields(task_id = %meta.task_id))]
    pub fn create_task(&self, meta: TaskMeta) -> Result<TaskSummary> {
        let task_id = meta.task_id.clone();
        loop {
            let slot = self.slot_or_insert(task_id.as_str());
            let _writer = slot.writer.lock();
            if !self.is_current(task_id.as_str(), &slot) {
                // Removed by a failed create while we waited.
                continue;
            }
            return self.create_locked(&slot, meta);
        }
    }

    fn is_current(&self, task_id: &str, slot: &Arc<TaskSlot>) -> bool {
        self.tasks
            .get(task_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    fn create_locked(&self, slot: &Arc<TaskSlot>, meta: TaskMeta) -> Result<TaskSummary> {
        let task_id = meta.task_id.clone();
        if slot.tables.read().is_some() {
            return Err(FleetError::task_already_exists(task_id.as_str()));
        }

        if let Err(e) = self.journal(task_id.as_str(), &TaskJournal::Created(meta.clone())) {
            self.tasks
                .remove_if(task_id.as_str(), |_, current| Arc::ptr_eq(current, slot));
            return Err(e);
        }

        let tables = TaskTables::new(meta);
        let summary = tables.summary();
        *slot.tables.write() = Some(tables);
        self.emit(|| Delta::TaskCreated(summary.clone()));

        debug!(task_id = %task_id, "Task created");
        Ok(summary)
    }

    /// Append a new phase and return its index. Phases are numbered from 0.
    #[instrument(skip(self))]
    pub fn append_phase(&self, task_id: &str) -> Result<u32> {
        let slot = self
            .slot(task_id)
            .ok_or_else(|| FleetError::task_not_found(task_id))?;
        let _writer = slot.writer.lock();
        self.append_phase_locked(task_id, &slot)
    }

    fn append_phase_locked(&self, task_id: &str, slot: &TaskSlot) -> Result<u32> {
        let index = match slot.tables.read().as_ref() {
            Some(tables) => tables.phases.len() as u32,
            None => return Err(FleetError::task_not_found(task_id)),
        };
        let at = Utc::now();

        self.journal(task_id, &TaskJournal::PhaseAppended { index, at })?;

        let mut guard = slot.tables.write();
        let tables = guard
            .as_mut()
            .ok_or_else(|| FleetError::task_not_found(task_id))?;
        let committed = tables.push_phase(at);
        debug_assert_eq!(committed, index);
        drop(guard);
        self.emit(|| Delta::PhaseAppended {
            task_id: TaskId::from(task_id),
            phase: index,
        });

        LogMetrics::phase_appended();
        debug!(task_id = %task_id, phase = index, "Phase appended");
        Ok(index)
    }

    /// Append an event to an existing phase.
    ///
    /// Never creates a task or phase. A status-bearing event after a terminal
    /// one is stored and reported through [`AppendOutcome::is_stale`].
    #[instrument(skip(self, event), fields(kind = %event.kind))]
    pub fn append_event(&self, task_id: &str, phase: u32, event: TaskEvent) -> Result<AppendOutcome> {
        let slot = self
            .slot(task_id)
            .ok_or_else(|| FleetError::task_not_found(task_id))?;
        let _writer = slot.writer.lock();
        self.append_event_locked(task_id, &slot, phase, event)
    }

    fn append_event_locked(
        &self,
        task_id: &str,
        slot: &TaskSlot,
        phase: u32,
        event: TaskEvent,
    ) -> Result<AppendOutcome> {
        let seq = match slot.tables.read().as_ref() {
            None => return Err(FleetError::task_not_found(task_id)),
            Some(tables) if (phase as usize) >= tables.phases.len() => {
                return Err(FleetError::phase_not_found(task_id, phase));
            }
            Some(tables) => tables.next_seq,
        };

        let record = EventRecord {
            task_id: TaskId::from(task_id),
            phase,
            seq,
            appended_at: Utc::now(),
            event,
        };
        self.journal(task_id, &TaskJournal::EventAppended(record.clone()))?;

        let mut guard = slot.tables.write();
        let tables = guard
            .as_mut()
            .ok_or_else(|| FleetError::task_not_found(task_id))?;
        let transition = tables.push_event(record.clone());
        let status = tables.aggregate.status();
        drop(guard);
        self.emit(|| Delta::TaskEvent {
            record: record.clone(),
            status,
            stale: transition.is_stale(),
        });

        let kind = record.event.kind;
        LogMetrics::event_appended(kind.as_str());
        if let Transition::Stale { status, attempted } = transition {
            LogMetrics::stale_transition(kind.as_str());
            warn!(
                task_id = %task_id,
                phase,
                seq,
                status = %status,
                attempted = %attempted,
                "Status change after terminal event stored for audit only"
            );
        } else {
            debug!(task_id = %task_id, phase, seq, kind = %kind, "Event appended");
        }

        Ok(AppendOutcome { record, transition })
    }

    /// Append to the task's latest phase, creating phase 0 when `create_phase`
    /// is set and the task has no phases yet.
    ///
    /// Returns `PhaseNotFound` for a phaseless task when `create_phase` is off.
    pub fn append_to_latest_phase(
        &self,
        task_id: &str,
        event: TaskEvent,
        create_phase: bool,
    ) -> Result<AppendOutcome> {
        let slot = self
            .slot(task_id)
            .ok_or_else(|| FleetError::task_not_found(task_id))?;
        let _writer = slot.writer.lock();

        let latest = match slot.tables.read().as_ref() {
            Some(tables) => tables.phases.len().checked_sub(1).map(|i| i as u32),
            None => return Err(FleetError::task_not_found(task_id)),
        };
        let phase = match latest {
            Some(phase) => phase,
            None if create_phase => self.append_phase_locked(task_id, &slot)?,
            None => return Err(FleetError::phase_not_found(task_id, 0)),
        };
        self.append_event_locked(task_id, &slot, phase, event)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Events of one phase with `seq > after`, ascending.
    pub fn read_events(
        &self,
        task_id: &str,
        phase: u32,
        after: u64,
        limit: usize,
    ) -> Result<Page<EventRecord>> {
        self.read(task_id, |tables| {
            if (phase as usize) >= tables.phases.len() {
                return Err(FleetError::phase_not_found(task_id, phase));
            }
            let start = (phase, after.saturating_add(1));
            let end = (phase, u64::MAX);
            let entries = tables
                .events
                .range(start..=end)
                .map(|(&(_, seq), record)| (seq, record.clone()));
            paginate_seq(entries, &Self::phase_scope(task_id, phase), after, limit)
        })
    }

    /// Cursor scope for one phase's events.
    pub fn phase_scope(task_id: &str, phase: u32) -> String {
        scope(&["task", task_id, "phase", &phase.to_string()])
    }

    pub fn derive_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.read(task_id, |tables| Ok(tables.aggregate.status()))
    }

    pub fn list_phases(&self, task_id: &str) -> Result<Vec<PhaseSummary>> {
        self.read(task_id, |tables| Ok(tables.phase_summaries()))
    }

    pub fn summary(&self, task_id: &str) -> Result<TaskSummary> {
        self.read(task_id, |tables| Ok(tables.summary()))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.read(task_id, |_| Ok(())).is_ok()
    }

    /// Summaries of every task, ordered by task ID.
    pub fn summaries(&self) -> Vec<TaskSummary> {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.iter().map(|e| e.value().clone()).collect();
        let mut out: Vec<TaskSummary> = slots
            .iter()
            .filter_map(|slot| slot.tables.read().as_ref().map(TaskTables::summary))
            .collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    pub fn len(&self) -> usize {
        self.summaries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Rebuild one task's tables from its journal, replacing anything held.
    pub fn replay(&self, task_id: &str, journal: Vec<TaskJournal>) -> Result<TaskSummary> {
        let corrupt = |reason: String| {
            FleetError::with_internal(ErrorCode::CorruptRecord, "Task journal is inconsistent", reason)
                .with_context("task_id", task_id)
        };

        let mut entries = TaskJournal::settle(journal).into_iter();
        let mut tables = match entries.next() {
            Some(TaskJournal::Created(meta)) => TaskTables::new(meta),
            _ => return Err(corrupt("journal does not start with task creation".into())),
        };

        for entry in entries {
            match entry {
                TaskJournal::Created(_) => return Err(corrupt("task created twice".into())),
                TaskJournal::PhaseAppended { index, at } => {
                    if index as usize != tables.phases.len() {
                        return Err(corrupt(format!(
                            "phase {} appended when {} phases exist",
                            index,
                            tables.phases.len()
                        )));
                    }
                    tables.push_phase(at);
                }
                TaskJournal::EventAppended(record) => {
                    if record.phase as usize >= tables.phases.len() {
                        return Err(corrupt(format!(
                            "event {} references missing phase {}",
                            record.seq, record.phase
                        )));
                    }
                    if record.seq < tables.next_seq {
                        return Err(corrupt(format!(
                            "event seq {} not above {}",
                            record.seq,
                            tables.next_seq - 1
                        )));
                    }
                    tables.push_event(record);
                }
            }
        }

        let summary = tables.summary();
        let slot = self.slot_or_insert(task_id);
        let _writer = slot.writer.lock();
        *slot.tables.write() = Some(tables);
        Ok(summary)
    }
}
