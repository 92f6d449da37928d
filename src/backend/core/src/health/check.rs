//! Entity health status types.
//!
//! # Health Status Semantics
//!
//! - **Healthy**: a report arrived within the entity type's timeout
//! - **Unhealthy**: the last report is older than the timeout
//! - **Unknown**: the entity has never reported

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::EntityKey;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Health status of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entity Health
// ═══════════════════════════════════════════════════════════════════════════════

/// Health of one entity as served to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,

    /// Timestamp of the most recent report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,

    /// Why the entity is not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Health {
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_seen: None,
            message: None,
        }
    }

    pub fn healthy(last_seen: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_seen: Some(last_seen),
            message: None,
        }
    }

    pub fn unhealthy(last_seen: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_seen: Some(last_seen),
            message: Some(message.into()),
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::unknown()
    }
}

/// A recorded change of an entity's health status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub key: EntityKey,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_serialization() {
        let health = Health::unhealthy(Utc::now(), "no report for 12s");
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["message"], "no report for 12s");

        let json = serde_json::to_value(Health::unknown()).unwrap();
        assert!(json.get("last_seen").is_none());
    }
}
