//! State Record Store: canonical latest-known state per entity.
//!
//! Every entity gets its own slot holding a writer mutex and a read-locked
//! pointer to the current record. Writers of the same entity serialize on the
//! slot mutex; writers of different entities never share a lock beyond the
//! brief shard lock taken to look the slot up. Readers only take the slot's
//! read lock for the time it takes to clone an `Arc`, so they never wait on a
//! durable write in flight.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use super::entity::{EntityKey, EntityKind, EntityRecord, EntityState};
use crate::error::Result;

/// Change produced by an accepted upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub key: EntityKey,
    pub seq: u64,
    /// Sequence number that was replaced, if the entity existed
    pub previous_seq: Option<u64>,
    pub state: EntityState,
    pub reported_at: DateTime<Utc>,
    pub accepted_at: DateTime<Utc>,
}

/// Result of an upsert attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Accepted(StateDelta),
    /// The report was not newer than the last accepted one and was discarded.
    Stale { last_seq: u64 },
}

impl UpsertOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn delta(&self) -> Option<&StateDelta> {
        match self {
            Self::Accepted(delta) => Some(delta),
            Self::Stale { .. } => None,
        }
    }
}

/// A report ready to be merged into the store.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: EntityKey,
    pub seq: u64,
    pub reported_at: DateTime<Utc>,
    pub state: EntityState,
}

#[derive(Default)]
struct EntitySlot {
    writer: Mutex<()>,
    current: RwLock<Option<Arc<EntityRecord>>>,
}

/// In-memory canonical state for every entity.
#[derive(Default)]
pub struct RecordStore {
    slots: DashMap<EntityKey, Arc<EntitySlot>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &EntityKey) -> Arc<EntitySlot> {
        if let Some(slot) = self.slots.get(key) {
            return slot.clone();
        }
        self.slots.entry(key.clone()).or_default().clone()
    }

    /// Upsert without side effects; see [`RecordStore::upsert_with`].
    pub fn upsert(&self, candidate: Candidate) -> UpsertOutcome {
        match self.upsert_with(candidate, |_, _| Ok(()), |_| {}) {
            Ok(outcome) => outcome,
            Err(_) => unreachable!("infallible commit hook"),
        }
    }

    /// Upsert a report, running `persist` before the in-memory commit and
    /// `on_commit` after it, both while holding the entity's writer lock.
    ///
    /// A report is accepted iff its sequence number is strictly greater than
    /// the last accepted one or the entity has no state yet. If `persist`
    /// fails the in-memory record is left exactly as it was and the error is
    /// returned. `on_commit` runs before the lock is released, so deltas for
    /// one entity are observed in acceptance order.
    pub fn upsert_with<P, C>(
        &self,
        candidate: Candidate,
        persist: P,
        on_commit: C,
    ) -> Result<UpsertOutcome>
    where
        P: FnOnce(&EntityRecord, Option<&EntityRecord>) -> Result<()>,
        C: FnOnce(&StateDelta),
    {
        let slot = self.slot(&candidate.key);
        let _writer = slot.writer.lock();

        let previous = slot.current.read().clone();
        if let Some(prev) = previous.as_deref() {
            if candidate.seq <= prev.seq {
                trace!(
                    entity = %candidate.key,
                    seq = candidate.seq,
                    last_seq = prev.seq,
                    "Discarding stale report"
                );
                return Ok(UpsertOutcome::Stale { last_seq: prev.seq });
            }
        }

        let record = EntityRecord {
            key: candidate.key,
            seq: candidate.seq,
            reported_at: candidate.reported_at,
            accepted_at: Utc::now(),
            state: candidate.state,
        };

        persist(&record, previous.as_deref())?;

        let delta = StateDelta {
            key: record.key.clone(),
            seq: record.seq,
            previous_seq: previous.as_ref().map(|p| p.seq),
            state: record.state.clone(),
            reported_at: record.reported_at,
            accepted_at: record.accepted_at,
        };

        *slot.current.write() = Some(Arc::new(record));
        on_commit(&delta);

        Ok(UpsertOutcome::Accepted(delta))
    }

    /// Install a record rebuilt during recovery if it is newer than what is held.
    pub fn restore(&self, record: EntityRecord) -> bool {
        let slot = self.slot(&record.key);
        let _writer = slot.writer.lock();
        let mut current = slot.current.write();
        match current.as_deref() {
            Some(existing) if existing.seq >= record.seq => false,
            _ => {
                *current = Some(Arc::new(record));
                true
            }
        }
    }

    /// Latest accepted record for an entity.
    pub fn get(&self, key: &EntityKey) -> Option<Arc<EntityRecord>> {
        let slot = self.slots.get(key)?.clone();
        let current = slot.current.read().clone();
        current
    }

    /// Last accepted sequence number for an entity.
    pub fn last_seq(&self, key: &EntityKey) -> Option<u64> {
        self.get(key).map(|record| record.seq)
    }

    /// Snapshot of every record of one kind, ordered by entity id.
    pub fn list(&self, kind: EntityKind) -> Vec<Arc<EntityRecord>> {
        let slots: Vec<Arc<EntitySlot>> = self
            .slots
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.value().clone())
            .collect();

        let mut records: Vec<Arc<EntityRecord>> = slots
            .iter()
            .filter_map(|slot| slot.current.read().clone())
            .collect();
        records.sort_by(|a, b| a.key.id.cmp(&b.key.id));
        records
    }

    /// Number of entities with an accepted state.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().current.read().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
