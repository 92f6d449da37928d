//! Concurrent writers against the engine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fleetlog_core::broadcast::{Delta, Notification, SubscriptionFilter};
use fleetlog_core::config::{EngineConfig, HealthTimeouts};
use fleetlog_core::engine::FleetEngine;
use fleetlog_core::events::{EventKind, TaskEvent, TaskMeta};
use fleetlog_core::fleet::{FleetEntry, LogTier};
use fleetlog_core::health::{Clock, HealthStatus, ManualClock};
use fleetlog_core::ingest::RawReport;
use fleetlog_core::pagination::PageRequest;
use fleetlog_core::state::EntityKey;
use fleetlog_core::storage::MemoryStore;
use serde_json::json;

const WRITERS: usize = 8;
const PER_WRITER: usize = 50;

fn create_engine() -> Arc<FleetEngine> {
    Arc::new(FleetEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new())).unwrap())
}

#[test]
fn test_concurrent_appends_get_distinct_increasing_seqs() {
    let engine = create_engine();
    engine.create_task(TaskMeta::new("T1")).unwrap();
    engine.append_phase("T1").unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                (0..PER_WRITER)
                    .map(|_| {
                        engine
                            .append_event("T1", 0, TaskEvent::new(EventKind::Progress))
                            .unwrap()
                            .seq()
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        let seqs = handle.join().unwrap();
        // Each writer sees its own appends in increasing order.
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        all.extend(seqs);
    }
    let total = WRITERS * PER_WRITER;
    assert_eq!(all.len(), total);
    assert_eq!(all, (1..=total as u64).collect::<HashSet<_>>());

    let page = engine
        .read_events("T1", 0, &PageRequest::first().with_limit(total))
        .unwrap();
    assert_eq!(page.len(), total);
    assert!(page.items.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn test_concurrent_reports_keep_highest_seq() {
    let engine = create_engine();

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let seq = (i * WRITERS + writer + 1) as u64;
                    engine
                        .submit(&RawReport::new("door", "door_1", seq, json!({"current_mode": "open"})))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let record = engine.get(&EntityKey::door("door_1")).unwrap();
    assert_eq!(record.seq, (WRITERS * PER_WRITER) as u64);
}

#[test]
fn test_robot_sub_logs_share_fleet_sequence() {
    let engine = create_engine();

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let engine = engine.clone();
            thread::spawn(move || {
                let robot = format!("r{}", writer);
                for i in 0..PER_WRITER {
                    engine
                        .append_robot_entry(
                            "tinyRobot",
                            &robot,
                            FleetEntry::text(LogTier::Info, format!("tick {}", i)),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut seen = HashSet::new();
    for writer in 0..WRITERS {
        let page = engine
            .read_robot_log("tinyRobot", &format!("r{}", writer), &PageRequest::first().with_limit(PER_WRITER))
            .unwrap();
        assert_eq!(page.len(), PER_WRITER);
        assert!(page.items.windows(2).all(|w| w[0].seq < w[1].seq));
        for record in page.items {
            assert!(seen.insert(record.seq));
        }
    }
    assert_eq!(seen.len(), WRITERS * PER_WRITER);
}

#[test]
fn test_sweep_racing_reports_keeps_health_deltas_ordered() {
    let clock = Arc::new(ManualClock::default());
    let mut config = EngineConfig::default();
    config.health.timeouts = HealthTimeouts::uniform(Duration::from_secs(10));
    let engine = Arc::new(
        FleetEngine::with_clock(config, Arc::new(MemoryStore::new()), clock.clone()).unwrap(),
    );
    let key = EntityKey::door("door_1");
    let mut sub = engine.subscribe_with_capacity(SubscriptionFilter::all().entity(key.clone()), 4_096);

    let done = Arc::new(AtomicBool::new(false));
    let sweeper = {
        let engine = engine.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                engine.sweep();
            }
        })
    };
    for seq in 1..=300u64 {
        clock.advance(Duration::from_secs(11));
        let report = RawReport::new("door", "door_1", seq, json!({"current_mode": "open"})).at(clock.now());
        engine.submit(&report).unwrap();
    }
    done.store(true, Ordering::SeqCst);
    sweeper.join().unwrap();

    let mut health = Vec::new();
    while let Some(notification) = sub.try_recv() {
        if let Notification::Delta(Delta::Health(transition)) = notification {
            health.push(transition.to);
        }
    }
    assert!(health.windows(2).all(|w| w[0] != w[1]));
    assert_eq!(health.last(), Some(&HealthStatus::Healthy));
    assert_eq!(engine.status_of(&key).status, HealthStatus::Healthy);
}
