//! Per-entity health derived from report recency.
//!
//! `observe` can only move an entity towards healthy. Degradation happens in
//! two places: readers compute staleness on the fly so `status_of` is never
//! optimistic, and `sweep` records the degradation.
//!
//! Transitions are emitted to the sink while the entity's entry is still
//! held, so a subscriber sees one entity's health changes in the order they
//! were recorded.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::check::{Health, HealthStatus, HealthTransition};
use super::clock::Clock;
use crate::broadcast::{Delta, DeltaSink};
use crate::config::HealthTimeouts;
use crate::state::{EntityKey, EntityKind};
use crate::telemetry::HealthMetrics;

#[derive(Debug, Clone)]
struct HealthEntry {
    last_seen: DateTime<Utc>,
    /// Last status recorded by observe or sweep
    status: HealthStatus,
    message: Option<String>,
}

/// Tracks health of every entity that has ever reported.
pub struct HealthTracker {
    timeouts: HealthTimeouts,
    clock: Arc<dyn Clock>,
    entries: DashMap<EntityKey, HealthEntry>,
    sink: Option<Arc<dyn DeltaSink>>,
}

impl HealthTracker {
    pub fn new(timeouts: HealthTimeouts, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeouts,
            clock,
            entries: DashMap::new(),
            sink: None,
        }
    }

    /// Emit every health transition as it is recorded.
    pub fn with_sink(mut self, sink: Arc<dyn DeltaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn emit(&self, transition: &HealthTransition) {
        if let Some(sink) = &self.sink {
            sink.emit(Delta::Health(transition.clone()));
        }
    }

    fn elapsed(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (now - last_seen).to_std().unwrap_or(Duration::ZERO)
    }

    fn is_stale(&self, kind: EntityKind, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        Self::elapsed(last_seen, now) > self.timeouts.for_kind(kind)
    }

    fn stale_message(&self, kind: EntityKind, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> String {
        format!(
            "no report for {:.1}s (timeout {:.1}s)",
            Self::elapsed(last_seen, now).as_secs_f64(),
            self.timeouts.for_kind(kind).as_secs_f64()
        )
    }

    /// Record that a report for `key` was produced at `timestamp`.
    ///
    /// Timestamps in the future are clamped to now so a skewed source cannot
    /// keep itself healthy. Returns the transition if the entity became healthy.
    pub fn observe(&self, key: &EntityKey, timestamp: DateTime<Utc>) -> Option<HealthTransition> {
        let now = self.clock.now();
        let seen = timestamp.min(now);

        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| HealthEntry {
            last_seen: seen,
            status: HealthStatus::Unknown,
            message: None,
        });
        if seen > entry.last_seen {
            entry.last_seen = seen;
        }

        if entry.status.is_healthy() || self.is_stale(key.kind, entry.last_seen, now) {
            return None;
        }

        let from = entry.status;
        entry.status = HealthStatus::Healthy;
        entry.message = None;
        let transition = HealthTransition {
            key: key.clone(),
            from,
            to: HealthStatus::Healthy,
            at: now,
            message: None,
        };
        self.emit(&transition);
        drop(entry);

        debug!(entity = %key, from = %from, "Entity became healthy");
        HealthMetrics::transition(key.kind.as_str(), HealthStatus::Healthy.as_str());
        Some(transition)
    }

    /// Current health of an entity.
    pub fn status_of(&self, key: &EntityKey) -> Health {
        let Some(entry) = self.entries.get(key) else {
            return Health::unknown();
        };
        let now = self.clock.now();

        if self.is_stale(key.kind, entry.last_seen, now) {
            let message = entry
                .message
                .clone()
                .unwrap_or_else(|| self.stale_message(key.kind, entry.last_seen, now));
            Health::unhealthy(entry.last_seen, message)
        } else {
            Health::healthy(entry.last_seen)
        }
    }

    /// Degrade every entity whose last report is older than its timeout.
    pub fn sweep(&self) -> Vec<HealthTransition> {
        self.sweep_at(self.clock.now())
    }

    /// Sweep as of an explicit instant.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<HealthTransition> {
        let mut transitions = Vec::new();
        let mut unhealthy = 0usize;

        for mut entry in self.entries.iter_mut() {
            let kind = entry.key().kind;
            if !self.is_stale(kind, entry.last_seen, now) {
                continue;
            }
            unhealthy += 1;
            if entry.status == HealthStatus::Unhealthy {
                continue;
            }

            let message = self.stale_message(kind, entry.last_seen, now);
            let from = entry.status;
            entry.status = HealthStatus::Unhealthy;
            entry.message = Some(message.clone());

            let transition = HealthTransition {
                key: entry.key().clone(),
                from,
                to: HealthStatus::Unhealthy,
                at: now,
                message: Some(message),
            };
            self.emit(&transition);
            transitions.push(transition);
        }

        for transition in &transitions {
            info!(
                entity = %transition.key,
                from = %transition.from,
                message = transition.message.as_deref().unwrap_or_default(),
                "Entity became unhealthy"
            );
            HealthMetrics::transition(transition.key.kind.as_str(), HealthStatus::Unhealthy.as_str());
        }
        HealthMetrics::set_unhealthy(unhealthy);

        transitions
    }

    /// Health of every tracked entity of one kind, ordered by id.
    pub fn list(&self, kind: EntityKind) -> Vec<(EntityKey, Health)> {
        let keys: Vec<EntityKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.key().clone())
            .collect();

        let mut out: Vec<(EntityKey, Health)> = keys
            .into_iter()
            .map(|key| {
                let health = self.status_of(&key);
                (key, health)
            })
            .collect();
        out.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
