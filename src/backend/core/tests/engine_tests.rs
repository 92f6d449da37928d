//! Integration tests for the Fleetlog engine.
//!
//! These tests drive the engine through its public API the way a transport
//! layer would and check the observable behaviour end to end.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetlog_core::broadcast::{CloseReason, Delta, Notification, SubscriptionFilter};
use fleetlog_core::config::{EngineConfig, HealthTimeouts};
use fleetlog_core::engine::FleetEngine;
use fleetlog_core::error::ErrorCode;
use fleetlog_core::events::{EventKind, TaskEvent, TaskMeta, TaskQuery, TaskStatus};
use fleetlog_core::fleet::{FleetEntry, LogTier};
use fleetlog_core::health::{HealthStatus, ManualClock};
use fleetlog_core::ingest::{CommandOutcome, Inbound, InboundOutcome, RawReport, SubmitOutcome, TaskCommand};
use fleetlog_core::pagination::PageRequest;
use fleetlog_core::state::{EntityKey, EntityKind, EntityState, RobotMode};
use fleetlog_core::storage::MemoryStore;
use serde_json::json;

// ============================================================================
// Test Utilities
// ============================================================================

fn create_engine() -> FleetEngine {
    FleetEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new())).unwrap()
}

fn robot_report(id: &str, seq: u64, mode: &str, task_id: Option<&str>) -> RawReport {
    let mut payload = json!({
        "fleet": "tinyRobot",
        "mode": mode,
        "battery_percent": 80.0,
        "location": {"map": "L1", "x": 1.0, "y": 2.0, "yaw": 0.0}
    });
    if let Some(task_id) = task_id {
        payload["task_id"] = json!(task_id);
    }
    RawReport::new("robot", id, seq, payload)
}

fn door_report(id: &str, seq: u64, mode: &str) -> RawReport {
    RawReport::new("door", id, seq, json!({ "current_mode": mode }))
}

// ============================================================================
// Entity State
// ============================================================================

#[test]
fn test_late_lower_sequence_report_is_discarded() {
    let engine = create_engine();
    let key = EntityKey::door("door_1");

    assert!(engine.submit(&door_report("door_1", 5, "open")).unwrap().is_accepted());
    let outcome = engine.submit(&door_report("door_1", 3, "closed")).unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::Discarded {
            key: key.clone(),
            seq: 3,
            last_seq: 5
        }
    );

    let record = engine.get(&key).unwrap();
    assert_eq!(record.seq, 5);
    match &record.state {
        EntityState::Door(door) => {
            assert_eq!(serde_json::to_value(door.current_mode).unwrap(), json!("open"))
        }
        other => panic!("unexpected state {:?}", other),
    }

    // An equal sequence number is a duplicate, not an update.
    assert!(!engine.submit(&door_report("door_1", 5, "closed")).unwrap().is_accepted());
}

#[test]
fn test_unknown_entity_type_changes_nothing() {
    let engine = create_engine();
    let mut sub = engine.subscribe(SubscriptionFilter::all());

    let err = engine
        .submit(&RawReport::new("toaster", "t1", 1, json!({"mode": "idle"})))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownEntityType);
    assert!(err.is_invalid_report());

    for kind in EntityKind::ALL {
        assert!(engine.list(kind).is_empty());
    }
    assert!(engine.list_fleets().is_empty());
    assert!(sub.try_recv().is_none());
}

#[test]
fn test_missing_fields_rejected() {
    let engine = create_engine();
    let err = engine
        .submit(&RawReport::new("robot", "r1", 1, json!({"fleet": "f", "mode": "idle"})))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingRequiredField);
    assert!(engine.get(&EntityKey::robot("r1")).is_err());
}

#[test]
fn test_list_page_orders_by_id() {
    let engine = create_engine();
    for id in ["d3", "d1", "d2"] {
        engine.submit(&door_report(id, 1, "closed")).unwrap();
    }
    let page = engine
        .list_page(EntityKind::Door, &PageRequest::first().with_limit(2))
        .unwrap();
    let ids: Vec<&str> = page.items.iter().map(|r| r.key.id.as_str()).collect();
    assert_eq!(ids, vec!["d1", "d2"]);
    let rest = engine
        .list_page(
            EntityKind::Door,
            &PageRequest::first().with_cursor(page.next_cursor.unwrap()),
        )
        .unwrap();
    assert_eq!(rest.items[0].key.id, "d3");
}

// ============================================================================
// Health
// ============================================================================

#[test]
fn test_health_lifecycle() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let mut config = EngineConfig::default();
    config.health.timeouts = HealthTimeouts::uniform(Duration::from_secs(10));
    let engine = FleetEngine::with_clock(config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();
    let key = EntityKey::door("door_1");

    assert_eq!(engine.status_of(&key).status, HealthStatus::Unknown);

    engine.submit(&door_report("door_1", 1, "open").at(start)).unwrap();
    assert_eq!(engine.status_of(&key).status, HealthStatus::Healthy);

    clock.advance(Duration::from_secs(11));
    assert_eq!(engine.status_of(&key).status, HealthStatus::Unhealthy);
    assert_eq!(engine.sweep(), 1);

    // A fresh report brings it back.
    engine
        .submit(&door_report("door_1", 2, "closed").at(clock_now(&clock)))
        .unwrap();
    assert_eq!(engine.status_of(&key).status, HealthStatus::Healthy);
}

#[test]
fn test_stale_report_still_counts_as_sign_of_life() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let mut config = EngineConfig::default();
    config.health.timeouts = HealthTimeouts::uniform(Duration::from_secs(10));
    let engine = FleetEngine::with_clock(config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();

    engine.submit(&door_report("door_1", 9, "open").at(start)).unwrap();
    clock.advance(Duration::from_secs(8));
    let outcome = engine
        .submit(&door_report("door_1", 2, "open").at(clock_now(&clock)))
        .unwrap();
    assert!(!outcome.is_accepted());

    clock.advance(Duration::from_secs(8));
    assert_eq!(
        engine.status_of(&EntityKey::door("door_1")).status,
        HealthStatus::Healthy
    );
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<Utc> {
    use fleetlog_core::health::Clock;
    clock.now()
}

// ============================================================================
// Task Log
// ============================================================================

#[test]
fn test_task_t1_scenario() {
    let engine = create_engine();
    engine.create_task(TaskMeta::new("T1")).unwrap();
    assert_eq!(engine.append_phase("T1").unwrap(), 0);

    let first = engine
        .append_event("T1", 0, TaskEvent::new(EventKind::Started))
        .unwrap();
    let second = engine
        .append_event("T1", 0, TaskEvent::new(EventKind::Completed))
        .unwrap();
    assert_eq!(first.seq(), 1);
    assert_eq!(second.seq(), 2);
    assert_eq!(engine.derive_status("T1").unwrap(), TaskStatus::Completed);

    let page = engine.read_events("T1", 0, &PageRequest::first()).unwrap();
    let kinds: Vec<EventKind> = page.items.iter().map(|r| r.event.kind).collect();
    assert_eq!(kinds, vec![EventKind::Started, EventKind::Completed]);
    assert!(!page.has_more);
}

#[test]
fn test_append_after_terminal_is_stale() {
    let engine = create_engine();
    engine.create_task(TaskMeta::new("T2")).unwrap();
    engine.append_phase("T2").unwrap();
    engine
        .append_event("T2", 0, TaskEvent::new(EventKind::Failed))
        .unwrap();

    let late = engine
        .append_event("T2", 0, TaskEvent::new(EventKind::Completed))
        .unwrap();
    assert!(late.is_stale());
    assert_eq!(late.seq(), 2);
    assert_eq!(engine.derive_status("T2").unwrap(), TaskStatus::Failed);

    // Stored for audit all the same.
    let page = engine.read_events("T2", 0, &PageRequest::first()).unwrap();
    assert_eq!(page.len(), 2);
}

#[test]
fn test_append_to_unknown_task_is_not_found() {
    let engine = create_engine();
    let err = engine
        .append_event("ghost", 0, TaskEvent::new(EventKind::Started))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TaskNotFound);
    assert!(engine.task_summary("ghost").is_err());

    engine.create_task(TaskMeta::new("T3")).unwrap();
    let err = engine
        .append_event("T3", 0, TaskEvent::new(EventKind::Started))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PhaseNotFound);
    assert!(engine.list_phases("T3").unwrap().is_empty());
}

#[test]
fn test_duplicate_task_rejected() {
    let engine = create_engine();
    engine.create_task(TaskMeta::new("T4")).unwrap();
    let err = engine.create_task(TaskMeta::new("T4")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TaskAlreadyExists);
}

#[test]
fn test_read_events_pages() {
    let engine = create_engine();
    engine.create_task(TaskMeta::new("T5")).unwrap();
    engine.append_phase("T5").unwrap();
    for _ in 0..5 {
        engine
            .append_event("T5", 0, TaskEvent::new(EventKind::Progress))
            .unwrap();
    }

    let first = engine
        .read_events("T5", 0, &PageRequest::first().with_limit(2))
        .unwrap();
    assert_eq!(first.next_after, Some(2));
    assert!(first.has_more);

    let next = engine
        .read_events("T5", 0, &PageRequest::after(2).with_limit(2))
        .unwrap();
    let seqs: Vec<u64> = next.items.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![3, 4]);

    let by_cursor = engine
        .read_events(
            "T5",
            0,
            &PageRequest::first().with_cursor(first.next_cursor.unwrap()),
        )
        .unwrap();
    assert_eq!(by_cursor.items, engine.read_events("T5", 0, &PageRequest::after(2)).unwrap().items);
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_dispatch_and_cancel() {
    let engine = create_engine();
    let outcome = engine
        .submit_command(TaskCommand::Dispatch {
            task_id: "delivery_1".into(),
            category: Some("delivery".into()),
            requester: Some("front_desk".into()),
            request: json!({"pickup": "pantry", "dropoff": "room_203"}),
        })
        .unwrap();
    match outcome {
        CommandOutcome::Dispatched { task } => {
            assert_eq!(task.status, TaskStatus::Queued);
            assert_eq!(task.phase_count, 1);
            assert_eq!(task.category.as_deref(), Some("delivery"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let outcome = engine
        .submit_command(TaskCommand::Cancel {
            task_id: "delivery_1".into(),
            requester: Some("front_desk".into()),
            reason: Some("guest left".into()),
        })
        .unwrap();
    match outcome {
        CommandOutcome::Canceled { event } => {
            assert!(!event.is_stale());
            assert_eq!(event.record.phase, 0);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(engine.derive_status("delivery_1").unwrap(), TaskStatus::Canceled);

    // Cancelling twice is recorded but stale.
    match engine.submit_command(TaskCommand::cancel("delivery_1")).unwrap() {
        CommandOutcome::Canceled { event } => assert!(event.is_stale()),
        other => panic!("unexpected outcome {:?}", other),
    }

    let err = engine.submit_command(TaskCommand::cancel("nope")).unwrap_err();
    assert!(err.is_not_found());
    let err = engine.submit_command(TaskCommand::dispatch("delivery_1")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TaskAlreadyExists);
}

#[test]
fn test_cancel_creates_phase_for_phaseless_task() {
    let engine = create_engine();
    engine.create_task(TaskMeta::new("T6")).unwrap();
    engine.submit_command(TaskCommand::cancel("T6")).unwrap();
    let phases = engine.list_phases("T6").unwrap();
    assert_eq!(phases.len(), 1);
    assert_eq!(phases[0].status, TaskStatus::Canceled);
}

#[test]
fn test_inbound_wire_messages() {
    let engine = create_engine();
    let inbound: Inbound = serde_json::from_value(json!({
        "type": "command",
        "command": "dispatch",
        "task_id": "T7"
    }))
    .unwrap();
    assert!(matches!(
        engine.submit_inbound(inbound).unwrap(),
        InboundOutcome::Command(CommandOutcome::Dispatched { .. })
    ));

    let inbound: Inbound = serde_json::from_value(json!({
        "type": "report",
        "entity_type": "door",
        "entity_id": "d1",
        "seq": 1,
        "timestamp": Utc::now(),
        "payload": {"current_mode": "open"}
    }))
    .unwrap();
    assert!(matches!(
        engine.submit_inbound(inbound).unwrap(),
        InboundOutcome::Report(SubmitOutcome::Accepted { .. })
    ));
}

#[test]
fn test_list_tasks_filters() {
    let engine = create_engine();
    engine.submit_command(TaskCommand::dispatch("a")).unwrap();
    engine.submit_command(TaskCommand::dispatch("b")).unwrap();
    engine.submit_command(TaskCommand::cancel("b")).unwrap();

    let canceled = engine
        .list_tasks(
            &TaskQuery::new().with_status(TaskStatus::Canceled),
            &PageRequest::first(),
        )
        .unwrap();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled.items[0].task_id.as_str(), "b");
}

// ============================================================================
// Robots and Fleet Logs
// ============================================================================

#[test]
fn test_robot_report_lands_in_fleet_log() {
    let engine = create_engine();
    engine.submit(&robot_report("r1", 1, "idle", None)).unwrap();
    engine.submit(&robot_report("r1", 2, "moving", None)).unwrap();
    engine.submit(&robot_report("r1", 1, "charging", None)).unwrap();

    let page = engine
        .read_robot_log("tinyRobot", "r1", &PageRequest::first())
        .unwrap();
    assert_eq!(page.len(), 2);
    match &page.items[1].entry {
        FleetEntry::State(record) => {
            assert_eq!(record.seq, 2);
            assert_eq!(record.state.as_robot().unwrap().mode, RobotMode::Moving);
        }
        other => panic!("unexpected entry {:?}", other),
    }

    engine
        .append_robot_entry("tinyRobot", "r1", FleetEntry::text(LogTier::Warning, "low battery"))
        .unwrap();
    let page = engine
        .read_robot_log("tinyRobot", "r1", &PageRequest::after(2))
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.items[0].seq, 3);
}

#[test]
fn test_robot_state_is_noted_on_task() {
    let engine = create_engine();
    engine.submit_command(TaskCommand::dispatch("T8")).unwrap();
    engine.submit(&robot_report("r1", 1, "moving", Some("T8"))).unwrap();
    // Same mode and task: not noted again.
    engine.submit(&robot_report("r1", 2, "moving", Some("T8"))).unwrap();
    engine.submit(&robot_report("r1", 3, "waiting", Some("T8"))).unwrap();

    let page = engine.read_events("T8", 0, &PageRequest::first()).unwrap();
    let kinds: Vec<EventKind> = page.items.iter().map(|r| r.event.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Queued, EventKind::RobotState, EventKind::RobotState]
    );
    assert_eq!(engine.derive_status("T8").unwrap(), TaskStatus::Queued);

    // A robot working on an unknown task is still accepted.
    assert!(engine
        .submit(&robot_report("r2", 1, "moving", Some("ghost")))
        .unwrap()
        .is_accepted());
}

#[test]
fn test_fleet_roster_registration() {
    let engine = create_engine();
    engine
        .submit(&RawReport::new("fleet", "tinyRobot", 1, json!({"robots": ["r1", "r2"]})))
        .unwrap();
    engine.submit(&robot_report("r1", 1, "idle", None)).unwrap();

    let robots = engine.list_robots("tinyRobot").unwrap();
    let names: Vec<&str> = robots.iter().map(|r| r.robot.as_str()).collect();
    assert_eq!(names, vec!["r1", "r2"]);
    assert!(robots.iter().all(|r| r.in_roster));

    // Named in the roster but silent so far.
    let page = engine
        .read_robot_log("tinyRobot", "r2", &PageRequest::first())
        .unwrap();
    assert!(page.is_empty());

    let err = engine
        .read_robot_log("tinyRobot", "r9", &PageRequest::first())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RobotLogNotFound);
    let err = engine
        .read_robot_log("otherFleet", "r1", &PageRequest::first())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FleetNotFound);
}

#[test]
fn test_fleet_level_entries() {
    let engine = create_engine();
    engine
        .append_fleet_entry("tinyRobot", FleetEntry::text(LogTier::Error, "adapter restarted"))
        .unwrap();
    let page = engine
        .read_fleet_log("tinyRobot", &PageRequest::first())
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.items[0].robot, None);
    assert_eq!(engine.list_fleets().len(), 1);
}

#[test]
fn test_fleet_cursor_not_accepted_by_lookalike_robot_log() {
    let engine = create_engine();
    for message in ["a", "b"] {
        engine
            .append_fleet_entry("x/robot/y", FleetEntry::text(LogTier::Info, message))
            .unwrap();
    }
    engine
        .append_robot_entry("x", "y", FleetEntry::text(LogTier::Info, "c"))
        .unwrap();

    let page = engine
        .read_fleet_log("x/robot/y", &PageRequest::first().with_limit(1))
        .unwrap();
    let cursor = page.next_cursor.clone().unwrap();

    let err = engine
        .read_robot_log("x", "y", &PageRequest::first().with_cursor(cursor))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCursor);
}

// ============================================================================
// Storage Failures
// ============================================================================

#[test]
fn test_storage_failure_leaves_state_untouched() {
    let store = Arc::new(MemoryStore::new());
    let engine = FleetEngine::new(EngineConfig::default(), store.clone()).unwrap();
    engine.submit(&robot_report("r1", 1, "idle", None)).unwrap();
    engine.create_task(TaskMeta::new("T9")).unwrap();
    let mut sub = engine.subscribe(SubscriptionFilter::all());

    store.set_fail_writes(true);
    let err = engine.submit(&robot_report("r1", 2, "moving", None)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::StorageFailure);
    let err = engine.append_phase("T9").unwrap_err();
    assert_eq!(err.code(), ErrorCode::StorageFailure);

    assert_eq!(engine.get(&EntityKey::robot("r1")).unwrap().seq, 1);
    assert_eq!(
        engine
            .read_robot_log("tinyRobot", "r1", &PageRequest::first())
            .unwrap()
            .len(),
        1
    );
    assert!(engine.list_phases("T9").unwrap().is_empty());
    assert!(sub.try_recv().is_none());

    // The same report goes through once storage recovers.
    store.set_fail_writes(false);
    assert!(engine
        .submit(&robot_report("r1", 2, "moving", None))
        .unwrap()
        .is_accepted());
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_slow_subscriber_closed_with_backpressure() {
    let engine = create_engine();
    let filter = SubscriptionFilter::all().kind(EntityKind::Door);
    let mut slow = engine.subscribe_with_capacity(filter.clone(), 2);
    let mut fast = engine.subscribe(filter);

    // Prime health so each report yields exactly one state delta.
    engine.submit(&door_report("door_1", 1, "open")).unwrap();
    while let Some(Notification::Delta(_)) = fast.try_recv() {}
    let mut slow_primed = 0;
    while let Some(Notification::Delta(_)) = slow.try_recv() {
        slow_primed += 1;
    }
    assert_eq!(slow_primed, 2);

    for seq in 2..=4 {
        engine.submit(&door_report("door_1", seq, "closed")).unwrap();
        match fast.recv().await {
            Some(Notification::Delta(Delta::State(delta))) => assert_eq!(delta.seq, seq),
            other => panic!("unexpected notification {:?}", other),
        }
    }

    let mut delivered = Vec::new();
    loop {
        match slow.recv().await {
            Some(Notification::Delta(Delta::State(delta))) => delivered.push(delta.seq),
            Some(Notification::Closed(reason)) => {
                assert_eq!(reason, CloseReason::Backpressure { capacity: 2 });
                break;
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }
    assert_eq!(delivered, vec![2, 3]);
    assert!(slow.recv().await.is_none());

    // The fast subscriber is still live.
    engine.submit(&door_report("door_1", 5, "open")).unwrap();
    assert!(matches!(fast.recv().await, Some(Notification::Delta(_))));
    assert_eq!(engine.broadcast_stats().backpressure_closed, 1);
}

#[tokio::test]
async fn test_task_deltas_follow_commit_order() {
    let engine = create_engine();
    let mut sub = engine.subscribe(SubscriptionFilter::all().task("T10"));

    engine.submit_command(TaskCommand::dispatch("T10")).unwrap();
    engine
        .append_event("T10", 0, TaskEvent::new(EventKind::Started))
        .unwrap();

    let mut seen = Vec::new();
    while let Some(Notification::Delta(delta)) = sub.try_recv() {
        seen.push(delta);
    }
    assert!(matches!(seen[0], Delta::TaskCreated(_)));
    assert!(matches!(seen[1], Delta::PhaseAppended { phase: 0, .. }));
    let seqs: Vec<u64> = seen[2..]
        .iter()
        .map(|delta| match delta {
            Delta::TaskEvent { record, .. } => record.seq,
            other => panic!("unexpected delta {:?}", other),
        })
        .collect();
    assert_eq!(seqs, vec![1, 2]);
    match seen.last() {
        Some(Delta::TaskEvent { status, stale, .. }) => {
            assert_eq!(*status, TaskStatus::Active);
            assert!(!stale);
        }
        other => panic!("unexpected delta {:?}", other),
    }
}
