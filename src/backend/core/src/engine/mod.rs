//! The fleet engine facade.
//!
//! [`FleetEngine`] wires the record store, health tracker, task log, fleet
//! log and broadcaster together, recovers them from durable storage on open,
//! and exposes every read and write the surrounding services need.

pub mod recovery;

pub use recovery::{RecoveryReport, RecoveryTargets};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::{BroadcastStats, Broadcaster, DeltaSink, Subscription, SubscriptionFilter};
use crate::config::{Config, EngineConfig};
use crate::error::{FleetError, Result};
use crate::events::{
    AppendOutcome, EventRecord, PhaseSummary, TaskEvent, TaskLog, TaskMeta, TaskQuery, TaskStatus,
    TaskSummary,
};
use crate::fleet::{FleetEntry, FleetLog, FleetLogRecord, FleetSummary, RobotLogSummary};
use crate::health::{Clock, Health, HealthTracker, SystemClock};
use crate::ingest::{
    validate_name, CommandOutcome, Dispatcher, Inbound, InboundOutcome, RawReport, SubmitOutcome,
    TaskCommand,
};
use crate::pagination::{paginate_keyed, scope, Page, PageRequest};
use crate::state::{EntityKey, EntityKind, EntityRecord, RecordStore};
use crate::storage::{self, DurableStore};

/// Cursor scope for the task listing.
pub const TASKS_SCOPE: &str = "tasks";

/// Cursor scope for an entity listing of one kind.
pub fn entities_scope(kind: EntityKind) -> String {
    scope(&["entities", &kind.to_string()])
}

/// Fleet state aggregation and task audit engine.
pub struct FleetEngine {
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    records: Arc<RecordStore>,
    health: Arc<HealthTracker>,
    tasks: Arc<TaskLog>,
    fleets: Arc<FleetLog>,
    broadcaster: Arc<Broadcaster>,
    dispatcher: Dispatcher,
    recovery: RecoveryReport,
}

impl FleetEngine {
    /// Build an engine over `store` using the system clock.
    pub fn new(config: EngineConfig, store: Arc<dyn DurableStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Build an engine with an injected clock for health evaluation.
    pub fn with_clock(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let broadcaster = Arc::new(Broadcaster::new(config.subscriber_buffer));
        let sink: Arc<dyn DeltaSink> = broadcaster.clone();
        let records = Arc::new(RecordStore::new());
        let health = HealthTracker::new(config.health.timeouts.clone(), clock);
        let tasks = Arc::new(TaskLog::new(store.clone()).with_sink(sink.clone()));
        let fleets = Arc::new(FleetLog::new(store.clone()).with_sink(sink.clone()));

        // Replay does not emit, and the tracker gets its sink only afterwards,
        // so nothing reaches subscribers during recovery.
        let recovery = recovery::recover(RecoveryTargets {
            store: store.as_ref(),
            records: &records,
            health: &health,
            tasks: &tasks,
            fleets: &fleets,
        })?;
        let health = Arc::new(health.with_sink(sink.clone()));

        let dispatcher = Dispatcher::new(
            store.clone(),
            records.clone(),
            health.clone(),
            tasks.clone(),
            fleets.clone(),
            sink,
        );

        Ok(Self {
            config,
            store,
            records,
            health,
            tasks,
            fleets,
            broadcaster,
            dispatcher,
            recovery,
        })
    }

    /// Open the configured storage backend and recover from it.
    pub fn open(config: &Config) -> Result<Self> {
        let store = storage::open(&config.storage)?;
        Self::new(config.engine.clone(), store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What was rebuilt when the engine opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    fn page_limit(&self, request: &PageRequest) -> usize {
        request.effective_limit(self.config.default_page_size, self.config.max_page_size)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate and apply one entity report.
    pub fn submit(&self, report: &RawReport) -> Result<SubmitOutcome> {
        self.dispatcher.submit(report)
    }

    /// Apply a dispatch or cancel command.
    pub fn submit_command(&self, command: TaskCommand) -> Result<CommandOutcome> {
        self.dispatcher.submit_command(command)
    }

    pub fn submit_inbound(&self, inbound: Inbound) -> Result<InboundOutcome> {
        self.dispatcher.submit_inbound(inbound)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task log
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_task(&self, meta: TaskMeta) -> Result<TaskSummary> {
        validate_name("task", "task_id", meta.task_id.as_str())?;
        self.tasks.create_task(meta)
    }

    /// Open the next phase of a task and return its index.
    pub fn append_phase(&self, task_id: &str) -> Result<u32> {
        self.tasks.append_phase(task_id)
    }

    pub fn append_event(&self, task_id: &str, phase: u32, event: TaskEvent) -> Result<AppendOutcome> {
        self.tasks.append_event(task_id, phase, event)
    }

    /// Events of one phase in sequence order.
    pub fn read_events(
        &self,
        task_id: &str,
        phase: u32,
        request: &PageRequest,
    ) -> Result<Page<EventRecord>> {
        let after = request.resolve_seq(&TaskLog::phase_scope(task_id, phase))?;
        self.tasks
            .read_events(task_id, phase, after, self.page_limit(request))
    }

    pub fn derive_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.tasks.derive_status(task_id)
    }

    pub fn list_phases(&self, task_id: &str) -> Result<Vec<PhaseSummary>> {
        self.tasks.list_phases(task_id)
    }

    pub fn task_summary(&self, task_id: &str) -> Result<TaskSummary> {
        self.tasks.summary(task_id)
    }

    /// Tasks matching `query`, ordered by task ID.
    pub fn list_tasks(&self, query: &TaskQuery, request: &PageRequest) -> Result<Page<TaskSummary>> {
        let after = request.resolve_key(TASKS_SCOPE)?;
        let mut matching: Vec<TaskSummary> = self
            .tasks
            .summaries()
            .into_iter()
            .filter(|summary| query.matches(summary))
            .collect();
        matching.sort_by(|a, b| a.task_id.as_str().cmp(b.task_id.as_str()));
        paginate_keyed(
            matching
                .into_iter()
                .map(|summary| (summary.task_id.as_str().to_string(), summary)),
            TASKS_SCOPE,
            after.as_deref(),
            self.page_limit(request),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fleet log
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a free-form entry to a robot's sub-log.
    ///
    /// State entries are only written by report ingestion, which enforces
    /// sequence ordering.
    pub fn append_robot_entry(
        &self,
        fleet: &str,
        robot: &str,
        entry: FleetEntry,
    ) -> Result<FleetLogRecord> {
        validate_name("fleet", "fleet", fleet)?;
        validate_name("robot", "robot", robot)?;
        reject_state_entry(&entry)?;
        self.fleets.append_robot_entry(fleet, robot, entry)
    }

    /// Append a free-form entry to the fleet-level log.
    pub fn append_fleet_entry(&self, fleet: &str, entry: FleetEntry) -> Result<FleetLogRecord> {
        validate_name("fleet", "fleet", fleet)?;
        reject_state_entry(&entry)?;
        self.fleets.append_fleet_entry(fleet, entry)
    }

    pub fn read_robot_log(
        &self,
        fleet: &str,
        robot: &str,
        request: &PageRequest,
    ) -> Result<Page<FleetLogRecord>> {
        let after = request.resolve_seq(&FleetLog::robot_scope(fleet, robot))?;
        self.fleets
            .read_robot_log(fleet, robot, after, self.page_limit(request))
    }

    pub fn read_fleet_log(&self, fleet: &str, request: &PageRequest) -> Result<Page<FleetLogRecord>> {
        let after = request.resolve_seq(&FleetLog::fleet_scope(fleet))?;
        self.fleets
            .read_fleet_log(fleet, after, self.page_limit(request))
    }

    pub fn list_robots(&self, fleet: &str) -> Result<Vec<RobotLogSummary>> {
        self.fleets.list_robots(fleet)
    }

    pub fn list_fleets(&self) -> Vec<FleetSummary> {
        self.fleets.list_fleets()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity state and health
    // ─────────────────────────────────────────────────────────────────────────

    /// Latest accepted record of an entity.
    pub fn get(&self, key: &EntityKey) -> Result<Arc<EntityRecord>> {
        self.records
            .get(key)
            .ok_or_else(|| FleetError::entity_not_found(key.kind.as_str(), &key.id))
    }

    /// Every entity of a kind, ordered by ID.
    pub fn list(&self, kind: EntityKind) -> Vec<Arc<EntityRecord>> {
        self.records.list(kind)
    }

    /// Paged variant of [`list`](Self::list).
    pub fn list_page(&self, kind: EntityKind, request: &PageRequest) -> Result<Page<Arc<EntityRecord>>> {
        let scope = entities_scope(kind);
        let after = request.resolve_key(&scope)?;
        let mut records = self.records.list(kind);
        records.sort_by(|a, b| a.key.id.cmp(&b.key.id));
        paginate_keyed(
            records.into_iter().map(|record| (record.key.id.clone(), record)),
            &scope,
            after.as_deref(),
            self.page_limit(request),
        )
    }

    /// Current health of an entity; `unknown` if it never reported.
    pub fn status_of(&self, key: &EntityKey) -> Health {
        self.health.status_of(key)
    }

    pub fn list_health(&self, kind: EntityKind) -> Vec<(EntityKey, Health)> {
        self.health.list(kind)
    }

    /// Degrade stale entities now; the tracker broadcasts each transition.
    pub fn sweep(&self) -> usize {
        self.health.sweep().len()
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until cancelled.
    pub fn spawn_health_sweep(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = self.config.health.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs_f64(), "Health sweep started");
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Health sweep shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        let degraded = engine.sweep();
                        if degraded > 0 {
                            debug!(degraded, "Health sweep recorded transitions");
                        }
                    }
                }
            }
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.broadcaster.subscribe(filter)
    }

    pub fn subscribe_with_capacity(&self, filter: SubscriptionFilter, capacity: usize) -> Subscription {
        self.broadcaster.subscribe_with_capacity(filter, capacity)
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Flush storage and close every subscription.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<()> {
        let flushed = self.store.flush();
        if let Err(e) = &flushed {
            warn!(error = %e, "Storage flush failed during shutdown");
        }
        self.broadcaster.close_all();
        info!(
            entities = self.records.len(),
            tasks = self.tasks.len(),
            "Engine shut down"
        );
        flushed
    }
}

fn reject_state_entry(entry: &FleetEntry) -> Result<()> {
    match entry {
        FleetEntry::State(_) => Err(FleetError::invalid_field(
            "entry",
            "state entries are recorded by report ingestion",
        )),
        FleetEntry::Text { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Delta, Notification};
    use crate::error::ErrorCode;
    use crate::events::EventKind;
    use crate::fleet::LogTier;
    use crate::health::{HealthStatus, ManualClock};
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> FleetEngine {
        FleetEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            subscriber_buffer: 0,
            ..EngineConfig::default()
        };
        let err = FleetEngine::new(config, Arc::new(MemoryStore::new())).err().unwrap();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_get_unknown_entity() {
        let err = engine().get(&EntityKey::door("nowhere")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EntityNotFound);
    }

    #[test]
    fn test_state_entries_rejected_from_callers() {
        let engine = engine();
        engine
            .submit(&RawReport::new(
                "robot",
                "r1",
                1,
                json!({"fleet": "f", "mode": "idle", "battery_percent": 80}),
            ))
            .unwrap();
        let record = (*engine.get(&EntityKey::robot("r1")).unwrap()).clone();

        let err = engine
            .append_robot_entry("f", "r1", FleetEntry::State(record))
            .unwrap_err();
        assert!(err.is_invalid_report());
        assert!(engine
            .append_robot_entry("f", "r1", FleetEntry::text(LogTier::Warning, "bumper"))
            .is_ok());
    }

    #[test]
    fn test_list_tasks_pages_by_id() {
        let engine = engine();
        for id in ["c", "a", "b"] {
            engine.create_task(TaskMeta::new(id)).unwrap();
        }
        let first = engine
            .list_tasks(&TaskQuery::new(), &PageRequest::first().with_limit(2))
            .unwrap();
        let ids: Vec<&str> = first.items.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(first.has_more);

        let cursor = first.next_cursor.unwrap();
        let rest = engine
            .list_tasks(&TaskQuery::new(), &PageRequest::first().with_cursor(cursor.clone()))
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(!rest.has_more);

        // A task-list cursor is meaningless for an event log.
        engine.append_phase("a").unwrap();
        let err = engine
            .read_events("a", 0, &PageRequest::first().with_cursor(cursor))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCursor);
    }

    #[test]
    fn test_sweep_broadcasts_degradation() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let engine = FleetEngine::with_clock(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap();
        engine
            .submit(&RawReport::new("door", "d1", 1, json!({"current_mode": "closed"})).at(start))
            .unwrap();
        let mut sub = engine.subscribe(SubscriptionFilter::all().entity(EntityKey::door("d1")));

        clock.advance(Duration::from_secs(3600));
        assert_eq!(engine.sweep(), 1);
        assert_eq!(engine.status_of(&EntityKey::door("d1")).status, HealthStatus::Unhealthy);
        match sub.try_recv() {
            Some(Notification::Delta(Delta::Health(transition))) => {
                assert_eq!(transition.to, HealthStatus::Unhealthy);
            }
            other => panic!("expected a health delta, got {:?}", other),
        }
        assert_eq!(engine.sweep(), 0);
    }

    #[test]
    fn test_append_event_through_engine() {
        let engine = engine();
        engine.create_task(TaskMeta::new("T1")).unwrap();
        let phase = engine.append_phase("T1").unwrap();
        engine
            .append_event("T1", phase, TaskEvent::new(EventKind::Started))
            .unwrap();
        assert_eq!(engine.derive_status("T1").unwrap(), TaskStatus::Active);
    }

    #[tokio::test]
    async fn test_health_sweep_stops_on_cancel() {
        let engine = Arc::new(engine());
        let token = CancellationToken::new();
        let handle = engine.spawn_health_sweep(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions() {
        let engine = engine();
        let mut sub = engine.subscribe(SubscriptionFilter::all());
        engine.shutdown().unwrap();
        assert!(matches!(sub.recv().await, Some(Notification::Closed(_))));
        assert!(sub.recv().await.is_none());
    }
}
