//! Crash recovery.
//!
//! Rebuilds the in-memory view from durable storage in three passes:
//!
//! 1. entity checkpoints under `state/`
//! 2. fleet journals, which also carry every accepted robot state, so a
//!    robot checkpoint that missed the last write is superseded here
//! 3. task journals
//!
//! A record only replaces what an earlier pass installed if its sequence
//! number is higher. A stream that fails to decode or replay is skipped and
//! reported; the rest of the view is still rebuilt.

use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::error::{ErrorCode, ErrorContext, Result};
use crate::events::{TaskJournal, TaskLog};
use crate::fleet::{FleetEntry, FleetJournal, FleetLog};
use crate::health::HealthTracker;
use crate::state::{EntityRecord, EntityState, RecordStore};
use crate::storage::{
    DurableStore, DurableStoreExt, FLEET_STREAM_PREFIX, STATE_KEY_PREFIX, TASK_STREAM_PREFIX,
};

/// What recovery rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub checkpoints: usize,
    pub entities: usize,
    pub fleets: usize,
    pub fleet_entries: usize,
    pub tasks: usize,
    /// Streams or checkpoints skipped because they could not be decoded or replayed
    pub skipped: Vec<String>,
}

/// Components recovery writes into.
pub struct RecoveryTargets<'a> {
    pub store: &'a dyn DurableStore,
    pub records: &'a RecordStore,
    pub health: &'a HealthTracker,
    pub tasks: &'a TaskLog,
    pub fleets: &'a FleetLog,
}

pub fn recover(targets: RecoveryTargets<'_>) -> Result<RecoveryReport> {
    let started = Instant::now();
    let mut report = RecoveryReport::default();

    restore_checkpoints(&targets, &mut report)?;
    replay_fleets(&targets, &mut report)?;
    replay_tasks(&targets, &mut report)?;
    reconcile_rosters(&targets);

    // Seed health from the last report time of every restored entity.
    let mut entities = 0;
    for kind in crate::state::EntityKind::ALL {
        for record in targets.records.list(kind) {
            targets.health.observe(&record.key, record.reported_at);
            entities += 1;
        }
    }
    report.entities = entities;

    info!(
        checkpoints = report.checkpoints,
        entities = report.entities,
        fleets = report.fleets,
        fleet_entries = report.fleet_entries,
        tasks = report.tasks,
        skipped = report.skipped.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Recovery complete"
    );
    Ok(report)
}

fn restore_checkpoints(targets: &RecoveryTargets<'_>, report: &mut RecoveryReport) -> Result<()> {
    for (key, bytes) in targets.store.scan_prefix(STATE_KEY_PREFIX)? {
        match serde_json::from_slice::<EntityRecord>(&bytes).with_error_code(ErrorCode::CorruptRecord) {
            Ok(record) => {
                targets.records.restore(record);
                report.checkpoints += 1;
            }
            Err(e) => {
                error!(key = %key, error = %e, "Skipping undecodable checkpoint");
                report.skipped.push(key);
            }
        }
    }
    Ok(())
}

fn replay_fleets(targets: &RecoveryTargets<'_>, report: &mut RecoveryReport) -> Result<()> {
    for stream in targets.store.streams(FLEET_STREAM_PREFIX)? {
        let Some(fleet) = stream.strip_prefix(FLEET_STREAM_PREFIX) else {
            continue;
        };
        let journal: Vec<FleetJournal> = match targets.store.read_stream_json(&stream) {
            Ok(entries) => FleetJournal::settle(entries.into_iter().map(|(_, entry)| entry).collect()),
            Err(e) => {
                error!(stream = %stream, error = %e, "Skipping undecodable fleet journal");
                report.skipped.push(stream);
                continue;
            }
        };

        let states: Vec<EntityRecord> = journal
            .iter()
            .filter_map(|entry| match entry {
                FleetJournal::Appended(record) => match &record.entry {
                    FleetEntry::State(state) => Some(state.clone()),
                    FleetEntry::Text { .. } => None,
                },
                FleetJournal::Roster { .. } => None,
            })
            .collect();

        match targets.fleets.replay(fleet, journal) {
            Ok(summary) => {
                for record in states {
                    targets.records.restore(record);
                }
                report.fleets += 1;
                report.fleet_entries += summary.entry_count as usize;
            }
            Err(e) => {
                error!(stream = %stream, error = %e, "Skipping inconsistent fleet journal");
                report.skipped.push(stream);
            }
        }
    }
    Ok(())
}

fn replay_tasks(targets: &RecoveryTargets<'_>, report: &mut RecoveryReport) -> Result<()> {
    for stream in targets.store.streams(TASK_STREAM_PREFIX)? {
        let Some(task_id) = stream.strip_prefix(TASK_STREAM_PREFIX) else {
            continue;
        };
        let journal: Vec<TaskJournal> = match targets.store.read_stream_json(&stream) {
            Ok(entries) => entries.into_iter().map(|(_, entry)| entry).collect(),
            Err(e) => {
                error!(stream = %stream, error = %e, "Skipping undecodable task journal");
                report.skipped.push(stream);
                continue;
            }
        };
        match targets.tasks.replay(task_id, journal) {
            Ok(_) => report.tasks += 1,
            Err(e) => {
                error!(stream = %stream, error = %e, "Skipping inconsistent task journal");
                report.skipped.push(stream);
            }
        }
    }
    Ok(())
}

/// Roster registration is best effort at ingest time; catch up from checkpoints.
fn reconcile_rosters(targets: &RecoveryTargets<'_>) {
    for record in targets.records.list(crate::state::EntityKind::Fleet) {
        if let EntityState::Fleet(fleet) = &record.state {
            if let Err(e) = targets.fleets.register_roster(&record.key.id, &fleet.robots) {
                warn!(fleet = %record.key.id, error = %e, "Roster reconciliation failed");
            }
        }
    }
}
