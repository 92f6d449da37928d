//! Latest-known state of every tracked entity.
//!
//! - `entity`: entity kinds, keys and typed state payloads
//! - `store`: the sequence-ordered record store

pub mod entity;
pub mod store;

pub use entity::{
    DoorMode, DoorState, EntityKey, EntityKind, EntityRecord, EntityState, FleetState,
    LiftMotion, LiftState, Location, RobotMode, RobotState, WorkcellMode, WorkcellState,
};
pub use store::{Candidate, RecordStore, StateDelta, UpsertOutcome};
