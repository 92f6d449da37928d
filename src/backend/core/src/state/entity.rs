//! Entity identity and typed current-state payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FleetError;

// =============================================================================
// Entity identity
// =============================================================================

/// The kinds of entity the engine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Robot,
    Door,
    Lift,
    Dispenser,
    Ingestor,
    Fleet,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Robot,
        EntityKind::Door,
        EntityKind::Lift,
        EntityKind::Dispenser,
        EntityKind::Ingestor,
        EntityKind::Fleet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Robot => "robot",
            Self::Door => "door",
            Self::Lift => "lift",
            Self::Dispenser => "dispenser",
            Self::Ingestor => "ingestor",
            Self::Fleet => "fleet",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "robot" => Ok(Self::Robot),
            "door" => Ok(Self::Door),
            "lift" => Ok(Self::Lift),
            "dispenser" => Ok(Self::Dispenser),
            "ingestor" => Ok(Self::Ingestor),
            "fleet" => Ok(Self::Fleet),
            _ => Err(FleetError::unknown_entity_type(s)),
        }
    }
}

/// Identity of a single tracked entity: unique name within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn robot(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Robot, id)
    }

    pub fn door(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Door, id)
    }

    pub fn fleet(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Fleet, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// =============================================================================
// Typed states
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotMode {
    Idle,
    Charging,
    Moving,
    Paused,
    Waiting,
    Emergency,
    Docking,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub map: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub yaw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    /// Fleet that owns the robot
    pub fleet: String,
    pub mode: RobotMode,
    pub battery_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Task the robot reports it is working on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorMode {
    Closed,
    Moving,
    Open,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorState {
    pub current_mode: DoorMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiftMotion {
    Stopped,
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftState {
    pub current_floor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_floor: Option<String>,
    pub door_state: DoorMode,
    pub motion_state: LiftMotion,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_floors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkcellMode {
    Idle,
    Busy,
    Offline,
}

/// Shared shape of dispenser and ingestor states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkcellState {
    pub mode: WorkcellMode,
    #[serde(default)]
    pub request_guid_queue: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FleetState {
    /// Names of the robots the fleet currently owns
    #[serde(default)]
    pub robots: Vec<String>,
}

/// Current state of one entity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum EntityState {
    Robot(RobotState),
    Door(DoorState),
    Lift(LiftState),
    Dispenser(WorkcellState),
    Ingestor(WorkcellState),
    Fleet(FleetState),
}

impl EntityState {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Robot(_) => EntityKind::Robot,
            Self::Door(_) => EntityKind::Door,
            Self::Lift(_) => EntityKind::Lift,
            Self::Dispenser(_) => EntityKind::Dispenser,
            Self::Ingestor(_) => EntityKind::Ingestor,
            Self::Fleet(_) => EntityKind::Fleet,
        }
    }

    pub fn as_robot(&self) -> Option<&RobotState> {
        match self {
            Self::Robot(robot) => Some(robot),
            _ => None,
        }
    }
}

// =============================================================================
// Accepted record
// =============================================================================

/// The accepted current state of an entity, as stored and checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    /// Sequence number of the report that produced this state
    pub seq: u64,
    /// Timestamp the source attached to the report
    pub reported_at: DateTime<Utc>,
    /// When the engine accepted it
    pub accepted_at: DateTime<Utc>,
    pub state: EntityState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("Robot".parse::<EntityKind>().unwrap(), EntityKind::Robot);
        assert_eq!(" lift ".parse::<EntityKind>().unwrap(), EntityKind::Lift);
        let err = "toaster".parse::<EntityKind>().unwrap_err();
        assert!(err.is_invalid_report());
    }

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::robot("tinyRobot1").to_string(), "robot/tinyRobot1");
    }

    #[test]
    fn test_entity_state_tagging() {
        let state = EntityState::Door(DoorState {
            current_mode: DoorMode::Open,
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], "door");
        assert_eq!(json["state"]["current_mode"], "open");
        assert_eq!(state.kind(), EntityKind::Door);
    }
}
