//! The storage seam under [`ManagedQueue`](super::ManagedQueue).
//!
//! A backend only moves bytes: it knows nothing about observers, lifecycle
//! or poison handling. Optional capabilities come with default
//! implementations that report [`BackendError::Unsupported`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::QueueKind;

/// Errors raised by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Looking up the queue failed.
    #[error("{0}")]
    ListQueues(String),

    /// Creating the queue failed.
    #[error("{0}")]
    CreateQueue(String),

    /// The server answered without a field the call needs.
    #[error("{0}")]
    UnexpectedResponse(String),

    /// A request was refused or could not be sent.
    #[error("{0}")]
    Request(String),

    /// No message with this id is stored.
    #[error("message [{0}] not found")]
    MessageNotFound(String),

    /// The backend lacks the named operation.
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

/// A raw delivery from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Backend message id.
    pub id: String,
    /// Stored body.
    pub body: String,
    /// Deliveries so far, including this one.
    pub receive_count: u32,
    /// Token for delete and visibility calls, when the backend uses one.
    pub receipt_handle: Option<String>,
}

/// One entry of a batched send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEntry {
    /// Caller-chosen id, unique within the batch.
    pub entry_id: String,
    /// Body to store.
    pub body: String,
}

/// One entry of a batched delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    /// Caller-chosen id, unique within the batch.
    pub entry_id: String,
    /// Backend message id.
    pub message_id: String,
    /// Receipt handle from the delivery.
    pub receipt_handle: Option<String>,
}

/// Per-entry outcome of a batched call, keyed by entry id.
pub type EntryResult<T> = (String, Result<T, BackendError>);

/// How processed messages are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// One backend call per message.
    Immediate,
    /// Buffer deletes and flush them in batches.
    Batched {
        /// Flush as soon as this many deletes are buffered.
        max_batch: usize,
        /// Flush a non-empty buffer at least this often.
        flush_every: Duration,
    },
}

/// Storage operations a queue kind provides.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Which kind of backend this is.
    fn kind(&self) -> QueueKind;

    /// Make sure the backend queue exists. Returns `true` if it was created.
    async fn ensure_queue(&self) -> Result<bool, BackendError>;

    /// Store one body, deliverable after `delay`. Returns the message id.
    async fn send(&self, body: String, delay: Duration) -> Result<String, BackendError>;

    /// Largest batch accepted by [`send_batch`](Self::send_batch), if any.
    fn max_send_batch(&self) -> Option<usize> {
        None
    }

    /// Store several bodies in one call.
    async fn send_batch(
        &self,
        _entries: Vec<SendEntry>,
    ) -> Result<Vec<EntryResult<String>>, BackendError> {
        Err(BackendError::Unsupported("send_batch"))
    }

    /// How many messages one receive call asks for.
    fn receive_batch_size(&self) -> usize {
        1
    }

    /// Whether `receive` blocks up to `wait` when nothing is available.
    fn long_polls(&self) -> bool {
        false
    }

    /// Fetch up to `max` deliverable messages and hide them.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Received>, BackendError>;

    /// How deletes should be issued.
    fn delete_policy(&self) -> DeletePolicy {
        DeletePolicy::Immediate
    }

    /// Remove one message.
    async fn delete(&self, message_id: &str, receipt_handle: Option<&str>)
    -> Result<(), BackendError>;

    /// Remove several messages in one call.
    async fn delete_batch(
        &self,
        _entries: Vec<DeleteEntry>,
    ) -> Result<Vec<EntryResult<()>>, BackendError> {
        Err(BackendError::Unsupported("delete_batch"))
    }

    /// Whether [`change_visibility`](Self::change_visibility) is implemented.
    fn supports_visibility(&self) -> bool {
        false
    }

    /// Hide a received message for `timeout` from now.
    async fn change_visibility(
        &self,
        _message_id: &str,
        _receipt_handle: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("change_visibility"))
    }

    /// Remove every message, leaving an empty queue with the same settings.
    async fn purge(&self) -> Result<(), BackendError>;
}
