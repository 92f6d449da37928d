//! Opaque cursor tokens.
//!
//! A cursor remembers the last position a reader saw and the scope it was
//! issued for, so a token minted for one task's phase cannot be replayed
//! against another. Tokens are Base64 (URL-safe, unpadded) JSON.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, FleetError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor Position
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorPosition {
    /// After this sequence number (append-only logs)
    Seq(u64),
    /// After this key (keyed listings such as tasks)
    Key(String),
}

impl From<u64> for CursorPosition {
    fn from(seq: u64) -> Self {
        Self::Seq(seq)
    }
}

impl From<String> for CursorPosition {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<&str> for CursorPosition {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor
// ═══════════════════════════════════════════════════════════════════════════════

/// An opaque pagination cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Version for forward compatibility.
    #[serde(default = "default_cursor_version")]
    pub version: u8,
    /// What the cursor pages over, built with [`scope`]
    pub scope: String,
    pub position: CursorPosition,
}

fn default_cursor_version() -> u8 {
    1
}

/// Joins scope parts. Names never contain control characters, so the unit
/// separator keeps distinct part lists apart.
const SCOPE_SEPARATOR: &str = "\u{1f}";

/// Build a cursor scope from its parts.
pub fn scope(parts: &[&str]) -> String {
    parts.join(SCOPE_SEPARATOR)
}

impl Cursor {
    pub fn new(scope: impl Into<String>, position: impl Into<CursorPosition>) -> Self {
        Self {
            version: default_cursor_version(),
            scope: scope.into(),
            position: position.into(),
        }
    }

    /// Encode the cursor to an opaque string token.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(self).map_err(|e| {
            FleetError::with_internal(
                ErrorCode::SerializationError,
                "Failed to encode cursor",
                e.to_string(),
            )
        })?;
        Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
    }

    /// Decode a cursor from an opaque string token.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| FleetError::invalid_cursor(format!("bad base64: {}", e)))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| FleetError::invalid_cursor(format!("bad payload: {}", e)))
    }

    /// Decode a token and check it was issued for `scope`.
    pub fn decode_for(token: &str, scope: &str) -> Result<Self> {
        let cursor = Self::decode(token)?;
        if cursor.scope != scope {
            return Err(FleetError::invalid_cursor(format!(
                "cursor issued for '{}' used on '{}'",
                cursor.scope, scope
            )));
        }
        Ok(cursor)
    }

    /// Sequence position, rejecting key cursors.
    pub fn seq(&self) -> Result<u64> {
        match &self.position {
            CursorPosition::Seq(seq) => Ok(*seq),
            CursorPosition::Key(_) => Err(FleetError::invalid_cursor("expected a sequence cursor")),
        }
    }

    /// Key position, rejecting sequence cursors.
    pub fn key(&self) -> Result<&str> {
        match &self.position {
            CursorPosition::Key(key) => Ok(key),
            CursorPosition::Seq(_) => Err(FleetError::invalid_cursor("expected a key cursor")),
        }
    }
}
