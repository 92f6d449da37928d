//! Restart tests against the sled backend.
//!
//! Each test writes through one engine, drops it, reopens the same directory
//! and checks that reads return what they returned before.

use std::sync::Arc;

use fleetlog_core::config::{Config, EngineConfig, StorageBackend};
use fleetlog_core::engine::FleetEngine;
use fleetlog_core::events::{EventKind, TaskEvent, TaskMeta, TaskStatus};
use fleetlog_core::fleet::{FleetEntry, LogTier};
use fleetlog_core::ingest::{RawReport, TaskCommand};
use fleetlog_core::pagination::PageRequest;
use fleetlog_core::state::{EntityKey, RobotMode};
use fleetlog_core::storage::{DurableStore, MemoryStore, SledStore};
use serde_json::json;
use tempfile::TempDir;

fn sled_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Sled;
    config.storage.path = dir.path().join("db");
    config
}

fn robot_report(id: &str, seq: u64, mode: &str) -> RawReport {
    RawReport::new(
        "robot",
        id,
        seq,
        json!({"fleet": "tinyRobot", "mode": mode, "battery_percent": 64.0}),
    )
}

#[test]
fn test_reopen_returns_same_reads() {
    let dir = TempDir::new().unwrap();
    let config = sled_config(&dir);

    let (door, robot, events, robot_log, status, summary) = {
        let engine = FleetEngine::open(&config).unwrap();
        engine
            .submit(&RawReport::new("door", "door_1", 4, json!({"current_mode": "open"})))
            .unwrap();
        engine.submit(&robot_report("r1", 1, "idle")).unwrap();
        engine.submit(&robot_report("r1", 2, "moving")).unwrap();
        engine
            .append_robot_entry("tinyRobot", "r1", FleetEntry::text(LogTier::Info, "docked"))
            .unwrap();

        engine.create_task(TaskMeta::new("T1").with_category("delivery")).unwrap();
        engine.append_phase("T1").unwrap();
        engine
            .append_event("T1", 0, TaskEvent::new(EventKind::Started))
            .unwrap();
        engine
            .append_event("T1", 0, TaskEvent::new(EventKind::Completed))
            .unwrap();
        engine
            .append_event("T1", 0, TaskEvent::new(EventKind::Failed))
            .unwrap();

        let reads = (
            engine.get(&EntityKey::door("door_1")).unwrap(),
            engine.get(&EntityKey::robot("r1")).unwrap(),
            engine.read_events("T1", 0, &PageRequest::first()).unwrap(),
            engine
                .read_robot_log("tinyRobot", "r1", &PageRequest::first())
                .unwrap(),
            engine.derive_status("T1").unwrap(),
            engine.task_summary("T1").unwrap(),
        );
        engine.shutdown().unwrap();
        reads
    };

    let engine = FleetEngine::open(&config).unwrap();
    assert_eq!(engine.get(&EntityKey::door("door_1")).unwrap(), door);
    assert_eq!(engine.get(&EntityKey::robot("r1")).unwrap(), robot);
    assert_eq!(engine.read_events("T1", 0, &PageRequest::first()).unwrap(), events);
    assert_eq!(
        engine
            .read_robot_log("tinyRobot", "r1", &PageRequest::first())
            .unwrap(),
        robot_log
    );
    assert_eq!(engine.derive_status("T1").unwrap(), status);
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(engine.task_summary("T1").unwrap(), summary);

    let report = engine.recovery_report();
    assert_eq!(report.tasks, 1);
    assert_eq!(report.fleets, 1);
    assert!(report.skipped.is_empty());
}

#[test]
fn test_sequence_rules_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = sled_config(&dir);
    {
        let engine = FleetEngine::open(&config).unwrap();
        engine.submit(&robot_report("r1", 7, "idle")).unwrap();
        engine.submit_command(TaskCommand::dispatch("T2")).unwrap();
        engine.shutdown().unwrap();
    }

    let engine = FleetEngine::open(&config).unwrap();
    assert!(!engine.submit(&robot_report("r1", 7, "moving")).unwrap().is_accepted());
    assert!(engine.submit(&robot_report("r1", 8, "moving")).unwrap().is_accepted());

    // Task and fleet sequence numbers continue where they left off.
    let next = engine
        .append_event("T2", 0, TaskEvent::new(EventKind::Started))
        .unwrap();
    assert_eq!(next.seq(), 2);
    let page = engine
        .read_robot_log("tinyRobot", "r1", &PageRequest::first())
        .unwrap();
    let seqs: Vec<u64> = page.items.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[test]
fn test_robot_state_recovered_from_fleet_log_without_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let store: Arc<dyn DurableStore> = Arc::new(SledStore::open(&path, true).unwrap());
        let engine = FleetEngine::new(EngineConfig::default(), store.clone()).unwrap();
        engine.submit(&robot_report("r1", 3, "charging")).unwrap();
        engine.shutdown().unwrap();
    }
    {
        // Simulate a crash between the fleet log append and the checkpoint.
        let db = sled::open(&path).unwrap();
        db.open_tree("state").unwrap().clear().unwrap();
        db.flush().unwrap();
    }

    let store: Arc<dyn DurableStore> = Arc::new(SledStore::open(&path, true).unwrap());
    let engine = FleetEngine::new(EngineConfig::default(), store).unwrap();
    assert_eq!(engine.get(&EntityKey::robot("r1")).unwrap().seq, 3);
    assert_eq!(engine.recovery_report().checkpoints, 0);
}

#[test]
fn test_roster_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = sled_config(&dir);
    {
        let engine = FleetEngine::open(&config).unwrap();
        engine
            .submit(&RawReport::new("fleet", "tinyRobot", 1, json!({"robots": ["r1", "r2"]})))
            .unwrap();
        engine.shutdown().unwrap();
    }

    let engine = FleetEngine::open(&config).unwrap();
    let robots = engine.list_robots("tinyRobot").unwrap();
    assert_eq!(robots.len(), 2);
    assert!(engine
        .read_robot_log("tinyRobot", "r2", &PageRequest::first())
        .unwrap()
        .is_empty());
}

#[test]
fn test_recovery_after_unacknowledged_writes() {
    let store = Arc::new(MemoryStore::new());
    {
        let engine = FleetEngine::new(EngineConfig::default(), store.clone()).unwrap();
        engine.create_task(TaskMeta::new("T1")).unwrap();
        engine.append_phase("T1").unwrap();
        engine
            .append_event("T1", 0, TaskEvent::new(EventKind::Started))
            .unwrap();
        engine.submit(&robot_report("r1", 1, "idle")).unwrap();

        // The writes land in the store but the calls report failure.
        store.set_fail_after_write(true);
        assert!(engine
            .append_event("T1", 0, TaskEvent::new(EventKind::Failed))
            .is_err());
        assert!(engine.submit(&robot_report("r1", 2, "moving")).is_err());
        store.set_fail_after_write(false);

        let retried = engine
            .append_event("T1", 0, TaskEvent::new(EventKind::Completed))
            .unwrap();
        assert_eq!(retried.seq(), 2);
        assert!(engine
            .submit(&robot_report("r1", 2, "charging"))
            .unwrap()
            .is_accepted());
        engine.shutdown().unwrap();
    }

    let engine = FleetEngine::new(EngineConfig::default(), store).unwrap();
    assert!(engine.recovery_report().skipped.is_empty());
    assert_eq!(engine.derive_status("T1").unwrap(), TaskStatus::Completed);

    let events = engine.read_events("T1", 0, &PageRequest::first()).unwrap();
    let kinds: Vec<EventKind> = events.items.iter().map(|r| r.event.kind).collect();
    assert_eq!(kinds, vec![EventKind::Started, EventKind::Completed]);

    let robot = engine.get(&EntityKey::robot("r1")).unwrap();
    assert_eq!(robot.seq, 2);
    assert_eq!(robot.state.as_robot().map(|r| r.mode), Some(RobotMode::Charging));
    let robot_log = engine
        .read_robot_log("tinyRobot", "r1", &PageRequest::first())
        .unwrap();
    let seqs: Vec<u64> = robot_log.items.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
}
