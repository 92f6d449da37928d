//! Fleet log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::state::EntityRecord;

/// Severity of a free-form log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTier {
    #[default]
    Info,
    Warning,
    Error,
}

impl LogTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of one fleet log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEntry {
    /// An accepted robot state report, as observed by the owning fleet
    State(EntityRecord),
    /// Free-form text from the fleet adapter
    Text {
        #[serde(default)]
        tier: LogTier,
        text: String,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        payload: serde_json::Value,
    },
}

impl FleetEntry {
    pub fn text(tier: LogTier, text: impl Into<String>) -> Self {
        Self::Text {
            tier,
            text: text.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::State(_) => "state",
            Self::Text { .. } => "text",
        }
    }
}

/// An appended, immutable fleet log entry.
///
/// `robot` is `None` for entries about the fleet as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetLogRecord {
    pub fleet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot: Option<String>,
    /// Per-fleet sequence number, strictly increasing from 1
    pub seq: u64,
    pub appended_at: DateTime<Utc>,
    pub entry: FleetEntry,
}

/// Durable form of one fleet log mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetJournal {
    Appended(FleetLogRecord),
    /// The fleet reported the robots it owns
    Roster { robots: Vec<String>, at: DateTime<Utc> },
}

impl FleetJournal {
    /// Drop appends superseded by a retry claiming the same seq.
    ///
    /// A write reported as failed may still have landed; the retry that
    /// reused its seq is the one that was committed.
    pub fn settle(journal: Vec<FleetJournal>) -> Vec<FleetJournal> {
        let mut kept: Vec<Option<FleetJournal>> = Vec::with_capacity(journal.len());
        let mut seqs: HashMap<u64, usize> = HashMap::new();
        for entry in journal {
            if let FleetJournal::Appended(record) = &entry {
                if let Some(earlier) = seqs.insert(record.seq, kept.len()) {
                    kept[earlier] = None;
                }
            }
            kept.push(Some(entry));
        }
        kept.into_iter().flatten().collect()
    }
}

/// One robot sub-log in a fleet listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotLogSummary {
    pub robot: String,
    /// Named in the fleet's latest roster
    pub in_roster: bool,
    pub entry_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub fleet: String,
    pub robot_count: usize,
    pub entry_count: u64,
    pub last_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_entry_shape() {
        let record = FleetLogRecord {
            fleet: "tinyRobot".into(),
            robot: Some("tinyRobot1".into()),
            seq: 4,
            appended_at: Utc::now(),
            entry: FleetEntry::text(LogTier::Warning, "battery low"),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["entry"]["type"], "text");
        assert_eq!(json["entry"]["tier"], "warning");

        let journal = serde_json::to_value(FleetJournal::Appended(record.clone())).unwrap();
        assert_eq!(journal["type"], "appended");
        let back: FleetJournal = serde_json::from_value(journal).unwrap();
        assert_eq!(back, FleetJournal::Appended(record));
    }
}
