//! Typed access to the opaque `queue-settings` / `worker-settings` nodes.
//!
//! Integers are accepted either as JSON numbers or as numeric strings, and a
//! zero value counts as missing.

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

/// Problems with a settings node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// The settings node is absent or not an object.
    #[error("This module requires settings to be defined")]
    Missing,

    /// A required field is absent.
    #[error("This module's settings need a {0} node")]
    MissingField(&'static str),

    /// A field is not a non-negative integer.
    #[error("This module's settings, {0} must be a valid integer")]
    NotInteger(&'static str),

    /// Any other problem, already phrased for the operator.
    #[error("{0}")]
    Invalid(String),
}

/// Returns the settings object, or [`SettingsError::Missing`].
pub fn require_object(settings: &Value) -> Result<&Map<String, Value>, SettingsError> {
    settings.as_object().ok_or(SettingsError::Missing)
}

/// Read a non-empty string field.
pub fn required_str<'a>(
    settings: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, SettingsError> {
    match settings.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        _ => Err(SettingsError::MissingField(key)),
    }
}

/// Read a positive integer field.
pub fn required_u64(settings: &Map<String, Value>, key: &'static str) -> Result<u64, SettingsError> {
    optional_u64(settings, key)?.ok_or(SettingsError::MissingField(key))
}

/// Read an optional positive integer field.
pub fn optional_u64(
    settings: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<u64>, SettingsError> {
    let parsed = match settings.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(0) => Ok(None),
        Some(n) => Ok(Some(n)),
        None => Err(SettingsError::NotInteger(key)),
    }
}

/// Settings shared by every queue kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Pause between empty polls (or the long-poll wait, for backends that support it).
    pub polling_interval: Duration,
    /// How long a received message stays hidden from other consumers.
    pub invisibility_timeout: Duration,
    /// Deliveries allowed before a message is treated as poison.
    pub max_dequeue_count: u32,
}

impl QueueSettings {
    /// Default `max-dequeue-count`.
    pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 5;

    /// Parse the common part of a `queue-settings` node.
    pub fn from_value(settings: &Value) -> Result<Self, SettingsError> {
        let settings = require_object(settings)?;
        let polling_interval = required_u64(settings, "polling-interval")?;
        let invisibility_timeout = required_u64(settings, "invisibility-timeout")?;
        let max_dequeue_count = optional_u64(settings, "max-dequeue-count")?
            .map_or(Ok(Self::DEFAULT_MAX_DEQUEUE_COUNT), u32::try_from)
            .map_err(|_| SettingsError::NotInteger("max-dequeue-count"))?;

        Ok(Self {
            polling_interval: Duration::from_millis(polling_interval),
            invisibility_timeout: Duration::from_secs(invisibility_timeout),
            max_dequeue_count,
        })
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            invisibility_timeout: Duration::from_secs(60),
            max_dequeue_count: Self::DEFAULT_MAX_DEQUEUE_COUNT,
        }
    }
}
