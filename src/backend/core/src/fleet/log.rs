//! Fleet → robot log aggregator.
//!
//! Entries are organized by operational ownership: each fleet has one
//! sequence counter, fleet-level entries and one sub-log per robot. A robot's
//! sub-log is created by its first entry. Appends to one fleet serialize on
//! the fleet's writer lock and are journaled to `fleet/<name>` before they
//! become visible.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, instrument};

use super::entry::{FleetEntry, FleetJournal, FleetLogRecord, FleetSummary, RobotLogSummary};
use crate::broadcast::{Delta, DeltaSink};
use crate::error::{ErrorCode, FleetError, Result};
use crate::pagination::{paginate_seq, scope, Page};
use crate::storage::{fleet_stream, DurableStore, DurableStoreExt};
use crate::telemetry::{LogMetrics, StorageMetrics};

#[derive(Debug, Clone, Default)]
struct FleetTables {
    /// Fleet-level entries
    entries: BTreeMap<u64, FleetLogRecord>,
    robots: BTreeMap<String, BTreeMap<u64, FleetLogRecord>>,
    roster: BTreeSet<String>,
    roster_at: Option<DateTime<Utc>>,
    next_seq: u64,
}

impl FleetTables {
    fn new() -> Self {
        Self {
            next_seq: 1,
            ..Self::default()
        }
    }

    fn push(&mut self, record: FleetLogRecord) {
        self.next_seq = self.next_seq.max(record.seq + 1);
        match &record.robot {
            Some(robot) => {
                self.robots
                    .entry(robot.clone())
                    .or_default()
                    .insert(record.seq, record);
            }
            None => {
                self.entries.insert(record.seq, record);
            }
        }
    }

    fn set_roster(&mut self, robots: &[String], at: DateTime<Utc>) {
        self.roster = robots.iter().cloned().collect();
        self.roster_at = Some(at);
    }

    fn summary(&self, fleet: &str) -> FleetSummary {
        let robot_entries: usize = self.robots.values().map(BTreeMap::len).sum();
        let names: BTreeSet<&String> = self.robots.keys().chain(self.roster.iter()).collect();
        FleetSummary {
            fleet: fleet.to_string(),
            robot_count: names.len(),
            entry_count: (self.entries.len() + robot_entries) as u64,
            last_seq: self.next_seq - 1,
        }
    }
}

#[derive(Default)]
struct FleetSlot {
    writer: Mutex<()>,
    tables: RwLock<Option<FleetTables>>,
}

/// Per-fleet, per-robot append-only logs.
pub struct FleetLog {
    store: Arc<dyn DurableStore>,
    fleets: DashMap<String, Arc<FleetSlot>>,
    sink: Option<Arc<dyn DeltaSink>>,
}

impl FleetLog {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            fleets: DashMap::new(),
            sink: None,
        }
    }

    /// Emit every appended entry, in sequence order per fleet.
    pub fn with_sink(mut self, sink: Arc<dyn DeltaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn slot(&self, fleet: &str) -> Option<Arc<FleetSlot>> {
        self.fleets.get(fleet).map(|slot| slot.clone())
    }

    fn slot_or_insert(&self, fleet: &str) -> Arc<FleetSlot> {
        if let Some(slot) = self.slot(fleet) {
            return slot;
        }
        self.fleets.entry(fleet.to_string()).or_default().clone()
    }

    fn is_current(&self, fleet: &str, slot: &Arc<FleetSlot>) -> bool {
        self.fleets
            .get(fleet)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Run `f` under the fleet's writer lock, creating the slot if needed.
    ///
    /// A slot still without tables after `f` fails is removed again, so
    /// failed first writes do not accumulate empty fleets.
    fn write<T>(&self, fleet: &str, f: impl FnOnce(&FleetSlot) -> Result<T>) -> Result<T> {
        loop {
            let slot = self.slot_or_insert(fleet);
            let _writer = slot.writer.lock();
            if !self.is_current(fleet, &slot) {
                // Removed by a failed first write while we waited.
                continue;
            }
            let result = f(&slot);
            if result.is_err() && slot.tables.read().is_none() {
                self.fleets
                    .remove_if(fleet, |_, current| Arc::ptr_eq(current, &slot));
            }
            return result;
        }
    }

    fn journal(&self, fleet: &str, entry: &FleetJournal) -> Result<()> {
        self.store
            .append_json(&fleet_stream(fleet), entry)
            .map(|_| ())
            .map_err(|e| {
                StorageMetrics::failure("fleet_append");
                error!(fleet = %fleet, error = %e, "Durable fleet log append failed");
                e
            })
    }

    fn read<T>(&self, fleet: &str, f: impl FnOnce(&FleetTables) -> Result<T>) -> Result<T> {
        let slot = self
            .slot(fleet)
            .ok_or_else(|| FleetError::fleet_not_found(fleet))?;
        let tables = slot.tables.read();
        match tables.as_ref() {
            Some(tables) => f(tables),
            None => Err(FleetError::fleet_not_found(fleet)),
        }
    }

    fn append(&self, fleet: &str, robot: Option<&str>, entry: FleetEntry) -> Result<FleetLogRecord> {
        self.write(fleet, |slot| self.append_locked(fleet, slot, robot, entry))
    }

    fn append_locked(
        &self,
        fleet: &str,
        slot: &FleetSlot,
        robot: Option<&str>,
        entry: FleetEntry,
    ) -> Result<FleetLogRecord> {
        let seq = slot
            .tables
            .read()
            .as_ref()
            .map_or(1, |tables| tables.next_seq);
        let record = FleetLogRecord {
            fleet: fleet.to_string(),
            robot: robot.map(str::to_string),
            seq,
            appended_at: Utc::now(),
            entry,
        };

        self.journal(fleet, &FleetJournal::Appended(record.clone()))?;

        slot.tables
            .write()
            .get_or_insert_with(FleetTables::new)
            .push(record.clone());
        if let Some(sink) = &self.sink {
            sink.emit(Delta::FleetLog(record.clone()));
        }

        LogMetrics::robot_entry_appended(fleet);
        debug!(
            fleet = %fleet,
            robot = robot.unwrap_or("-"),
            seq,
            kind = record.entry.kind(),
            "Fleet log entry appended"
        );
        Ok(record)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Append to a robot's sub-log, creating the fleet and sub-log on first use.
    #[instrument(skip(self, entry), fields(kind = entry.kind()))]
    pub fn append_robot_entry(
        &self,
        fleet: &str,
        robot: &str,
        entry: FleetEntry,
    ) -> Result<FleetLogRecord> {
        self.append(fleet, Some(robot), entry)
    }

    /// Append an entry about the fleet as a whole.
    #[instrument(skip(self, entry), fields(kind = entry.kind()))]
    pub fn append_fleet_entry(&self, fleet: &str, entry: FleetEntry) -> Result<FleetLogRecord> {
        self.append(fleet, None, entry)
    }

    /// Record the robots a fleet reports owning. Creates the fleet if needed.
    ///
    /// Nothing is journaled when the roster is unchanged.
    pub fn register_roster(&self, fleet: &str, robots: &[String]) -> Result<()> {
        self.write(fleet, |slot| self.register_roster_locked(fleet, slot, robots))
    }

    fn register_roster_locked(&self, fleet: &str, slot: &FleetSlot, robots: &[String]) -> Result<()> {
        let incoming: BTreeSet<&String> = robots.iter().collect();
        let unchanged = slot.tables.read().as_ref().is_some_and(|tables| {
            tables.roster_at.is_some() && tables.roster.iter().collect::<BTreeSet<_>>() == incoming
        });
        if unchanged {
            return Ok(());
        }

        let at = Utc::now();
        self.journal(
            fleet,
            &FleetJournal::Roster {
                robots: robots.to_vec(),
                at,
            },
        )?;
        slot.tables
            .write()
            .get_or_insert_with(FleetTables::new)
            .set_roster(robots, at);

        debug!(fleet = %fleet, robots = robots.len(), "Fleet roster registered");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Entries of one robot's sub-log with `seq > after`, ascending.
    ///
    /// A robot named in the roster that has no entries yet reads as empty.
    pub fn read_robot_log(
        &self,
        fleet: &str,
        robot: &str,
        after: u64,
        limit: usize,
    ) -> Result<Page<FleetLogRecord>> {
        self.read(fleet, |tables| {
            let scope = Self::robot_scope(fleet, robot);
            match tables.robots.get(robot) {
                Some(entries) => {
                    let entries = entries
                        .range(after.saturating_add(1)..)
                        .map(|(&seq, record)| (seq, record.clone()));
                    paginate_seq(entries, &scope, after, limit)
                }
                None if tables.roster.contains(robot) => Ok(Page::empty()),
                None => Err(FleetError::robot_log_not_found(fleet, robot)),
            }
        })
    }

    /// Fleet-level entries with `seq > after`, ascending.
    pub fn read_fleet_log(
        &self,
        fleet: &str,
        after: u64,
        limit: usize,
    ) -> Result<Page<FleetLogRecord>> {
        self.read(fleet, |tables| {
            let entries = tables
                .entries
                .range(after.saturating_add(1)..)
                .map(|(&seq, record)| (seq, record.clone()));
            paginate_seq(entries, &Self::fleet_scope(fleet), after, limit)
        })
    }

    pub fn robot_scope(fleet: &str, robot: &str) -> String {
        scope(&["fleet", fleet, "robot", robot])
    }

    pub fn fleet_scope(fleet: &str) -> String {
        scope(&["fleet", fleet])
    }

    /// Robots with a sub-log or named in the roster, ordered by name.
    pub fn list_robots(&self, fleet: &str) -> Result<Vec<RobotLogSummary>> {
        self.read(fleet, |tables| {
            let names: BTreeSet<&String> =
                tables.robots.keys().chain(tables.roster.iter()).collect();
            Ok(names
                .into_iter()
                .map(|name| {
                    let entries = tables.robots.get(name);
                    RobotLogSummary {
                        robot: name.clone(),
                        in_roster: tables.roster.contains(name),
                        entry_count: entries.map_or(0, |e| e.len() as u64),
                        last_seq: entries.and_then(|e| e.keys().next_back().copied()),
                    }
                })
                .collect())
        })
    }

    /// Every known fleet, ordered by name.
    pub fn list_fleets(&self) -> Vec<FleetSummary> {
        let slots: Vec<(String, Arc<FleetSlot>)> = self
            .fleets
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut out: Vec<FleetSummary> = slots
            .iter()
            .filter_map(|(name, slot)| slot.tables.read().as_ref().map(|t| t.summary(name)))
            .collect();
        out.sort_by(|a, b| a.fleet.cmp(&b.fleet));
        out
    }

    pub fn contains(&self, fleet: &str) -> bool {
        self.read(fleet, |_| Ok(())).is_ok()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Rebuild one fleet's tables from its journal, replacing anything held.
    pub fn replay(&self, fleet: &str, journal: Vec<FleetJournal>) -> Result<FleetSummary> {
        let mut tables = FleetTables::new();
        for entry in FleetJournal::settle(journal) {
            match entry {
                FleetJournal::Appended(record) => {
                    if record.seq < tables.next_seq || record.fleet != fleet {
                        return Err(FleetError::with_internal(
                            ErrorCode::CorruptRecord,
                            "Fleet journal is inconsistent",
                            format!(
                                "entry seq {} for fleet '{}' after seq {}",
                                record.seq,
                                record.fleet,
                                tables.next_seq - 1
                            ),
                        )
                        .with_context("fleet", fleet));
                    }
                    tables.push(record);
                }
                FleetJournal::Roster { robots, at } => tables.set_roster(&robots, at),
            }
        }

        let summary = tables.summary(fleet);
        let slot = self.slot_or_insert(fleet);
        let _writer = slot.writer.lock();
        *slot.tables.write() = Some(tables);
        Ok(summary)
    }
}
