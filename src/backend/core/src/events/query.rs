//! Task listing filters.
//!
//! Mirrors the filters a dashboard task table offers: status, assignee,
//! requester, category and start/finish time windows. All set filters must
//! match; an empty query matches every task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::TaskStatus;
use super::log::TaskSummary;

/// Inclusive time window; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// A missing timestamp never matches a bounded window.
    fn contains(&self, at: Option<DateTime<Utc>>) -> bool {
        if self.from.is_none() && self.to.is_none() {
            return true;
        }
        let Some(at) = at else {
            return false;
        };
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Filters for listing tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    /// Any of these statuses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Case-sensitive substring of the task ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id_contains: Option<String>,
    #[serde(default)]
    pub started: TimeWindow,
    #[serde(default)]
    pub finished: TimeWindow,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_assignee(mut self, fleet: impl Into<String>, robot: Option<String>) -> Self {
        self.fleet = Some(fleet.into());
        self.robot = robot;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn started_within(mut self, window: TimeWindow) -> Self {
        self.started = window;
        self
    }

    pub fn finished_within(mut self, window: TimeWindow) -> Self {
        self.finished = window;
        self
    }

    pub fn matches(&self, task: &TaskSummary) -> bool {
        fn eq(filter: &Option<String>, value: &Option<String>) -> bool {
            match filter {
                Some(want) => value.as_deref() == Some(want.as_str()),
                None => true,
            }
        }

        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && eq(&self.fleet, &task.assigned_fleet)
            && eq(&self.robot, &task.assigned_robot)
            && eq(&self.requester, &task.requester)
            && eq(&self.category, &task.category)
            && self
                .task_id_contains
                .as_deref()
                .map_or(true, |needle| task.task_id.as_str().contains(needle))
            && self.started.contains(task.started_at)
            && self.finished.contains(task.finished_at)
    }
}
