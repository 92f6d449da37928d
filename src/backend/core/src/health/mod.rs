//! Entity health tracking.
//!
//! - `check`: status and transition types
//! - `clock`: injectable time source
//! - `tracker`: recency-based health per entity

pub mod check;
pub mod clock;
pub mod tracker;

pub use check::{Health, HealthStatus, HealthTransition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use tracker::HealthTracker;
