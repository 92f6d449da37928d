//! Report and command ingestion.
//!
//! - `report`: loosely typed inbound reports and their validation
//! - `command`: task dispatch and cancel commands
//! - `dispatcher`: routing of valid input to the store, the logs and subscribers

pub mod command;
pub mod dispatcher;
pub mod report;

pub use command::{CommandOutcome, TaskCommand};
pub use dispatcher::{Dispatcher, Inbound, InboundOutcome, SubmitOutcome};
pub use report::{validate_name, RawReport, MAX_NAME_LEN};
