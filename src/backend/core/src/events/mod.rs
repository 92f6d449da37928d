//! Hierarchical task audit log.
//!
//! - **`event`**: task IDs, statuses, event kinds, event records and the journal format.
//! - **`aggregate`**: the `Aggregate` trait and the status fold with sticky terminal states.
//! - **`log`**: the task → phase → event arena tables with per-task sequencing.
//! - **`query`**: filters for listing task summaries.

pub mod aggregate;
pub mod event;
pub mod log;
pub mod query;

pub use aggregate::{Aggregate, PhaseFold, TaskAggregate, Transition};
pub use event::{EventKind, EventRecord, TaskEvent, TaskId, TaskJournal, TaskMeta, TaskStatus};
pub use log::{AppendOutcome, PhaseSummary, TaskLog, TaskSummary};
pub use query::{TaskQuery, TimeWindow};
