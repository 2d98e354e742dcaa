//! Messages exchanged between producers, queues and workers.

use jobbroker_common::BrokerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work flowing through the broker.
///
/// Only `job_type` and `payload` travel to the backend; the remaining fields
/// are filled in by the queue that stored or delivered the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Backend-assigned identifier, set after a successful push or on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Routing key, matched case-insensitively.
    pub job_type: String,
    /// Opaque application payload.
    #[serde(default)]
    pub payload: Value,
    /// Number of times the backend has delivered this message.
    #[serde(default)]
    pub dequeue_count: u32,
    /// Opaque token some backends require for delete and visibility changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
}

/// The part of a message persisted by backends.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredBody {
    job_type: String,
    #[serde(default)]
    payload: Value,
}

impl Message {
    /// Create a new message for the given job type.
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            payload,
            dequeue_count: 0,
            receipt_handle: None,
        }
    }

    /// The job type in its routing form.
    #[must_use]
    pub fn routing_key(&self) -> String {
        normalize_job_type(&self.job_type)
    }

    /// Serialize the stored part of the message.
    pub(crate) fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&StoredBody {
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
        })
    }

    /// Rebuild a delivered message from its stored body and delivery metadata.
    pub(crate) fn from_body(
        body: &str,
        id: String,
        dequeue_count: u32,
        receipt_handle: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        let stored: StoredBody = serde_json::from_str(body)?;
        Ok(Self {
            id: Some(id),
            job_type: stored.job_type,
            payload: stored.payload,
            dequeue_count,
            receipt_handle,
        })
    }
}

/// Lowercase and trim a job type.
#[must_use]
pub fn normalize_job_type(job_type: &str) -> String {
    job_type.trim().to_lowercase()
}

/// A message that could not be pushed, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFailure {
    /// The message as it was handed to `push_many`.
    pub message: Message,
    /// Why the backend did not store it.
    pub error: BrokerError,
}

/// Outcome of one `push_many` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushManyReport {
    /// Messages stored by the backend, with their ids filled in.
    pub successes: Vec<Message>,
    /// Messages the backend rejected.
    pub failures: Vec<PushFailure>,
}

impl PushManyReport {
    /// Total number of messages covered by this report.
    #[must_use]
    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    /// Whether the report covers no message at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.failures.is_empty()
    }
}
