//! Task dispatch and cancel commands.

use serde::{Deserialize, Serialize};

use super::report::validate_name;
use crate::error::Result;
use crate::events::{AppendOutcome, TaskSummary};

/// A command against the task log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TaskCommand {
    /// Create a task with an initial phase and a `queued` event
    Dispatch {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester: Option<String>,
        /// Dispatch request body, stored verbatim
        #[serde(default)]
        request: serde_json::Value,
    },
    /// Append a `canceled` event to the task's latest phase
    Cancel {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TaskCommand {
    pub fn dispatch(task_id: impl Into<String>) -> Self {
        Self::Dispatch {
            task_id: task_id.into(),
            category: None,
            requester: None,
            request: serde_json::Value::Null,
        }
    }

    pub fn cancel(task_id: impl Into<String>) -> Self {
        Self::Cancel {
            task_id: task_id.into(),
            requester: None,
            reason: None,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Dispatch { task_id, .. } | Self::Cancel { task_id, .. } => task_id,
        }
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch { .. } => "dispatch",
            Self::Cancel { .. } => "cancel",
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("task", "task_id", self.task_id())?;
        match self {
            Self::Dispatch {
                category, requester, ..
            } => {
                if let Some(category) = category {
                    validate_name("task", "category", category)?;
                }
                if let Some(requester) = requester {
                    validate_name("task", "requester", requester)?;
                }
            }
            Self::Cancel { requester, .. } => {
                if let Some(requester) = requester {
                    validate_name("task", "requester", requester)?;
                }
            }
        }
        Ok(())
    }
}

/// What a command did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Dispatched { task: TaskSummary },
    /// The cancel event was stored; `event.is_stale()` if the task had
    /// already finished
    Canceled { event: AppendOutcome },
}
