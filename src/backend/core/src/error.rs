//! Error handling for Fleetlog Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and structured details
//! - Severity classification that drives logging level and alerting
//! - Retryability hints for callers (the core never retries on its own)
//! - Error counters through the `metrics` facade
//!
//! # Usage
//!
//! ```rust,ignore
//! use fleetlog_core::error::{FleetError, Result, ErrorContext, ErrorCode};
//!
//! fn load(bytes: &[u8]) -> Result<Record> {
//!     serde_json::from_slice(bytes).with_error_code(ErrorCode::DeserializationError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Fleetlog operations.
pub type Result<T> = std::result::Result<T, FleetError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable; the transport layer maps them onto its own wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Ingestion Errors (1000-1099)
    InvalidReport,
    UnknownEntityType,
    MissingRequiredField,
    InvalidFieldValue,
    InvalidCommand,

    // Log Errors (1100-1199)
    TaskNotFound,
    PhaseNotFound,
    TaskAlreadyExists,
    FleetNotFound,
    RobotLogNotFound,

    // State Errors (1200-1299)
    EntityNotFound,

    // Subscription Errors (1300-1399)
    Backpressure,
    InvalidCursor,

    // Storage Errors (2000-2099)
    StorageFailure,
    StorageUnavailable,
    CorruptRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidReport => 1000,
            Self::UnknownEntityType => 1001,
            Self::MissingRequiredField => 1002,
            Self::InvalidFieldValue => 1003,
            Self::InvalidCommand => 1004,

            Self::TaskNotFound => 1100,
            Self::PhaseNotFound => 1101,
            Self::TaskAlreadyExists => 1102,
            Self::FleetNotFound => 1103,
            Self::RobotLogNotFound => 1104,

            Self::EntityNotFound => 1200,

            Self::Backpressure => 1300,
            Self::InvalidCursor => 1301,

            Self::StorageFailure => 2000,
            Self::StorageUnavailable => 2001,
            Self::CorruptRecord => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable by the caller.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageFailure | Self::StorageUnavailable)
    }

    /// Whether the code belongs to the "malformed input" family.
    pub const fn is_invalid_report(&self) -> bool {
        matches!(
            self,
            Self::InvalidReport
                | Self::UnknownEntityType
                | Self::MissingRequiredField
                | Self::InvalidFieldValue
                | Self::InvalidCommand
        )
    }

    /// Whether the code belongs to the "unknown target" family.
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound
                | Self::PhaseNotFound
                | Self::FleetNotFound
                | Self::RobotLogNotFound
                | Self::EntityNotFound
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "ingestion",
            1100..=1199 => "log",
            1200..=1299 => "state",
            1300..=1399 => "subscription",
            2000..=2099 => "storage",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown targets). Never alarm on these.
    Low,
    /// Operational issues (slow subscribers)
    Medium,
    /// System errors (storage, serialization)
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidReport
            | ErrorCode::UnknownEntityType
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFieldValue
            | ErrorCode::InvalidCommand
            | ErrorCode::TaskNotFound
            | ErrorCode::PhaseNotFound
            | ErrorCode::TaskAlreadyExists
            | ErrorCode::FleetNotFound
            | ErrorCode::RobotLogNotFound
            | ErrorCode::EntityNotFound
            | ErrorCode::InvalidCursor => Self::Low,

            ErrorCode::Backpressure => Self::Medium,

            ErrorCode::StorageFailure
            | ErrorCode::CorruptRecord
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StorageUnavailable | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (task, robot, door, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Name of the offending field, for validation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Fleetlog Core.
///
/// Validation and not-found errors are returned synchronously to the caller and
/// are never process-fatal. Storage failures are fatal for the call that hit
/// them only; the in-memory view is left as it was before the call.
#[derive(Error, Debug)]
pub struct FleetError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to hand to clients
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl FleetError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both public and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Malformed report or command, rejected before any state change.
    pub fn invalid_report(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidReport, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the client-facing message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check if this error is a not-found error of any kind.
    pub fn is_not_found(&self) -> bool {
        self.code.is_not_found()
    }

    /// Check if this error rejected malformed input.
    pub fn is_invalid_report(&self) -> bool {
        self.code.is_invalid_report()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Emit this error at the level its severity calls for.
    ///
    /// Caller mistakes stay at debug so a misbehaving source cannot flood
    /// the operator's log.
    pub fn log(&self) {
        let code = self.code.numeric_code();
        let category = self.code.category();
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                code,
                category,
                severity = ?self.severity(),
                internal = self.internal_message.as_deref().unwrap_or_default(),
                source = ?self.source,
                "{}",
                self.message
            ),
            ErrorSeverity::Medium => warn!(code, category, "{}", self.message),
            ErrorSeverity::Low => debug!(code, category, "{}", self.message),
        }
    }

    fn record_metrics(&self) {
        counter!(
            "fleetlog_errors_total",
            "code" => self.code.numeric_code().to_string(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| FleetError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| FleetError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| FleetError::new(ErrorCode::EntityNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| FleetError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for FleetError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<sled::Error> for FleetError {
    fn from(error: sled::Error) -> Self {
        let code = match &error {
            sled::Error::Corruption { .. } => ErrorCode::CorruptRecord,
            sled::Error::Io(_) => ErrorCode::StorageUnavailable,
            _ => ErrorCode::StorageFailure,
        };
        Self::with_internal(code, "Durable store operation failed", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for FleetError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(
            ErrorCode::StorageFailure,
            "I/O operation failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for FleetError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Invalid configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain-Specific Error Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl FleetError {
    /// A required field was absent from a report or command.
    pub fn missing_field(entity_type: &str, field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} report is missing required field '{}'", entity_type, field),
        )
        .with_details(ErrorDetails::new().with_field(field).with_context("entity_type", entity_type))
    }

    /// A field was present but its value is not acceptable.
    pub fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::InvalidFieldValue,
            format!("Invalid value for '{}': {}", field, reason),
        )
        .with_details(ErrorDetails::new().with_field(field))
    }

    /// The report names an entity type the engine does not track.
    pub fn unknown_entity_type(entity_type: &str) -> Self {
        Self::new(
            ErrorCode::UnknownEntityType,
            format!("Unknown entity type: {}", entity_type),
        )
        .with_context("entity_type", entity_type)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("Task not found: {}", task_id))
            .with_details(ErrorDetails::new().with_entity("task", task_id))
    }

    pub fn task_already_exists(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskAlreadyExists,
            format!("Task already exists: {}", task_id),
        )
        .with_details(ErrorDetails::new().with_entity("task", task_id))
    }

    pub fn phase_not_found(task_id: &str, phase: u32) -> Self {
        Self::new(
            ErrorCode::PhaseNotFound,
            format!("Phase {} not found for task {}", phase, task_id),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("task", task_id)
                .with_context("phase", phase),
        )
    }

    pub fn fleet_not_found(fleet: &str) -> Self {
        Self::new(ErrorCode::FleetNotFound, format!("Fleet not found: {}", fleet))
            .with_details(ErrorDetails::new().with_entity("fleet", fleet))
    }

    pub fn robot_log_not_found(fleet: &str, robot: &str) -> Self {
        Self::new(
            ErrorCode::RobotLogNotFound,
            format!("No log for robot {} in fleet {}", robot, fleet),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("robot", robot)
                .with_context("fleet", fleet),
        )
    }

    pub fn entity_not_found(entity_type: &str, entity_id: &str) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(entity_type, entity_id))
    }

    /// Durable store rejected a write or read.
    pub fn storage(operation: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StorageFailure,
            "Durable store operation failed",
            format!("{}: {}", operation, reason.into()),
        )
        .with_context("operation", operation)
    }

    pub fn invalid_cursor(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InvalidCursor, "Invalid pagination cursor", reason)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
