//! Event — the wire envelope for every message in `coderoom`.
//!
//! ARCHITECTURE
//! ============
//! Every exchange over the websocket is an Event: `{"event": "<name>",
//! "data": {...}}`. Clients emit request events (`join-room`, `code-change`,
//! ...), the server dispatches on the event name, and emits named response
//! and broadcast events back. Event names and `data` field names are the
//! protocol contract — handlers never invent new shapes for them.
//!
//! DESIGN
//! ======
//! - Flat data: the payload is always `Map<String, Value>`, never nested
//!   envelopes (domain objects like a tab or a submission appear as a single
//!   value under one key).
//! - Domain errors surface on the `error` event with a grepable `code`, a
//!   human `message`, and a `retryable` flag via the [`ErrorCode`] trait.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Data key for human-readable error messages.
pub const FIELD_MESSAGE: &str = "message";

/// Data key for grepable error codes.
pub const FIELD_CODE: &str = "code";

/// Data key for the retryable flag on error payloads.
pub const FIELD_RETRYABLE: &str = "retryable";

/// Event name used for all domain and validation errors.
pub const ERROR_EVENT: &str = "error";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// The wire envelope: a named event plus a flat JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Serialize a payload value, falling back to `null` rather than failing a
/// broadcast over one field.
pub(crate) fn json(value: &impl serde::Serialize) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Event {
    /// Create an event with a payload.
    pub fn new(name: impl Into<String>, data: Data) -> Self {
        Self { name: name.into(), data }
    }

    /// Create an event with an empty payload.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), data: Data::new() }
    }

    /// Create an `error` event from a plain string. Not retryable.
    pub fn error(message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FIELD_MESSAGE.into(), serde_json::Value::String(message.into()));
        data.insert(FIELD_RETRYABLE.into(), serde_json::Value::Bool(false));
        Self { name: ERROR_EVENT.into(), data }
    }

    /// Create a structured `error` event from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FIELD_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FIELD_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FIELD_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        Self { name: ERROR_EVENT.into(), data }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Event {
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Fetch a required string field, trimmed. `None` when absent or blank.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
