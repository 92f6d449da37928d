//! Inbound device and robot reports.
//!
//! Reports arrive loosely typed from fleet adapters and device bridges.
//! `RawReport::validate` checks them in a fixed order (entity type, identity,
//! sequence number and timestamp, required payload fields, payload shape,
//! value ranges) and either produces a typed [`Candidate`] or rejects the
//! report before anything downstream sees it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{FleetError, Result};
use crate::state::{
    Candidate, DoorState, EntityKey, EntityKind, EntityState, FleetState, LiftState, RobotState,
    WorkcellState,
};

/// Longest accepted entity, fleet or task name.
pub const MAX_NAME_LEN: usize = 256;

/// A report as submitted by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReport {
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: String,
    /// Source-assigned sequence number; higher means newer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// When the source produced the report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawReport {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        seq: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            seq: Some(seq),
            timestamp: Some(Utc::now()),
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Payload fields that must be present and non-null for a kind.
    pub fn required_fields(kind: EntityKind) -> &'static [&'static str] {
        match kind {
            EntityKind::Robot => &["fleet", "mode", "battery_percent"],
            EntityKind::Door => &["current_mode"],
            EntityKind::Lift => &["current_floor", "door_state", "motion_state"],
            EntityKind::Dispenser | EntityKind::Ingestor => &["mode"],
            EntityKind::Fleet => &[],
        }
    }

    /// Check the report and turn it into a typed candidate.
    pub fn validate(&self) -> Result<Candidate> {
        let kind: EntityKind = self.entity_type.parse()?;
        let entity = kind.as_str();

        validate_name(entity, "entity_id", &self.entity_id)?;
        let seq = self
            .seq
            .ok_or_else(|| FleetError::missing_field(entity, "seq"))?;
        let reported_at = self
            .timestamp
            .ok_or_else(|| FleetError::missing_field(entity, "timestamp"))?;

        let payload = match &self.payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null if Self::required_fields(kind).is_empty() => {
                return self.finish(kind, seq, reported_at, EntityState::Fleet(FleetState::default()));
            }
            serde_json::Value::Null => {
                return Err(FleetError::missing_field(entity, "payload"));
            }
            _ => return Err(FleetError::invalid_field("payload", "expected a JSON object")),
        };
        for field in Self::required_fields(kind) {
            if payload.get(*field).map_or(true, serde_json::Value::is_null) {
                return Err(FleetError::missing_field(entity, field));
            }
        }

        let state = match kind {
            EntityKind::Robot => EntityState::Robot(validate_robot(self.typed(entity)?)?),
            EntityKind::Door => EntityState::Door(self.typed::<DoorState>(entity)?),
            EntityKind::Lift => EntityState::Lift(validate_lift(self.typed(entity)?)?),
            EntityKind::Dispenser => {
                EntityState::Dispenser(validate_workcell(self.typed(entity)?)?)
            }
            EntityKind::Ingestor => EntityState::Ingestor(validate_workcell(self.typed(entity)?)?),
            EntityKind::Fleet => EntityState::Fleet(validate_fleet(self.typed(entity)?)?),
        };
        self.finish(kind, seq, reported_at, state)
    }

    fn typed<T: DeserializeOwned>(&self, entity: &str) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            FleetError::invalid_field("payload", format!("malformed {} state: {}", entity, e))
        })
    }

    fn finish(
        &self,
        kind: EntityKind,
        seq: u64,
        reported_at: DateTime<Utc>,
        state: EntityState,
    ) -> Result<Candidate> {
        Ok(Candidate {
            key: EntityKey::new(kind, self.entity_id.clone()),
            seq,
            reported_at,
            state,
        })
    }
}

/// Names end up in log stream names and checkpoint keys.
pub fn validate_name(entity: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(FleetError::missing_field(entity, field));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(FleetError::invalid_field(
            field,
            format!("longer than {} bytes", MAX_NAME_LEN),
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(FleetError::invalid_field(field, "contains control characters"));
    }
    Ok(())
}

fn finite(field: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(FleetError::invalid_field(field, "must be a finite number"))
    }
}

fn validate_robot(state: RobotState) -> Result<RobotState> {
    validate_name("robot", "fleet", &state.fleet)?;
    finite("battery_percent", state.battery_percent)?;
    if !(0.0..=100.0).contains(&state.battery_percent) {
        return Err(FleetError::invalid_field(
            "battery_percent",
            format!("{} is outside 0-100", state.battery_percent),
        ));
    }
    if let Some(location) = &state.location {
        validate_name("robot", "location.map", &location.map)?;
        finite("location.x", location.x)?;
        finite("location.y", location.y)?;
        finite("location.yaw", location.yaw)?;
    }
    if let Some(task_id) = &state.task_id {
        validate_name("robot", "task_id", task_id)?;
    }
    Ok(state)
}

fn validate_lift(state: LiftState) -> Result<LiftState> {
    validate_name("lift", "current_floor", &state.current_floor)?;
    if let Some(destination) = &state.destination_floor {
        validate_name("lift", "destination_floor", destination)?;
    }
    Ok(state)
}

fn validate_workcell(state: WorkcellState) -> Result<WorkcellState> {
    if let Some(seconds) = state.seconds_remaining {
        finite("seconds_remaining", seconds)?;
        if seconds < 0.0 {
            return Err(FleetError::invalid_field("seconds_remaining", "must not be negative"));
        }
    }
    Ok(state)
}

fn validate_fleet(state: FleetState) -> Result<FleetState> {
    let mut seen = HashSet::new();
    for robot in &state.robots {
        validate_name("fleet", "robots", robot)?;
        if !seen.insert(robot.as_str()) {
            return Err(FleetError::invalid_field(
                "robots",
                format!("robot '{}' listed twice", robot),
            ));
        }
    }
    Ok(state)
}
