//! Queues: the capability contract, its observer, and the backends.
//!
//! A [`Queue`] owns a backend queue resource. It never raises events itself;
//! every outcome is reported to the [`QueueObserver`] attached when the queue
//! is registered with a broker.

mod backend;
mod engine;
pub mod memory;
pub mod redis;
#[cfg(feature = "sqs")]
pub mod sqs;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobbroker_common::{BrokerError, BrokerResult};

use crate::message::{Message, PushManyReport};
use crate::settings::QueueSettings;

pub use backend::{
    BackendError, DeleteEntry, DeletePolicy, EntryResult, QueueBackend, Received, SendEntry,
};
pub use engine::ManagedQueue;
pub use memory::{MemoryBackend, MemoryStore};
pub use redis::RedisBackend;
#[cfg(feature = "sqs")]
pub use sqs::SqsBackend;

/// Shared handle to a queue.
pub type QueueHandle = Arc<dyn Queue>;

/// Backend kinds a queue can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Process-local queue.
    Memory,
    /// Redis, using the RSMQ data layout.
    Redis,
    /// Amazon SQS (or a compatible endpoint).
    Sqs,
}

impl QueueKind {
    /// Canonical module name.
    #[must_use]
    pub const fn module_name(self) -> &'static str {
        match self {
            Self::Memory => "memoryqueue",
            Self::Redis => "redisqueue",
            Self::Sqs => "sqsqueue",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.module_name())
    }
}

/// Error returned when a queue module name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownQueueKind(pub String);

impl FromStr for QueueKind {
    type Err = UnknownQueueKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memoryqueue" | "memory" => Ok(Self::Memory),
            "redisqueue" | "redis" => Ok(Self::Redis),
            "sqsqueue" | "sqs" => Ok(Self::Sqs),
            _ => Err(UnknownQueueKind(s.to_string())),
        }
    }
}

/// Identity and common settings of a queue.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    /// 1-based index of the worker entry this queue was declared in.
    pub worker_number: usize,
    /// Normalized job type this queue accepts.
    pub job_type: String,
    /// Backend kind.
    pub kind: QueueKind,
    /// Lowercased backend queue name.
    pub name: String,
    /// Polling, visibility and poison settings.
    pub settings: QueueSettings,
}

impl QueueInfo {
    /// Human readable label used in logs.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "Worker[{}], Jobtype[{}], Queuetype[{}], Name[{}]",
            self.worker_number, self.job_type, self.kind, self.name
        )
    }
}

/// Lifecycle state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Backend resource not yet ensured.
    Uninitialized,
    /// Backend resource being ensured.
    Initializing,
    /// Backend resource exists; not polling.
    Ready,
    /// Polling.
    Started,
    /// Polling stopped.
    Stopped,
}

impl QueueState {
    /// Whether the backend resource has been ensured.
    #[must_use]
    pub const fn is_initialized(self) -> bool {
        matches!(self, Self::Ready | Self::Started | Self::Stopped)
    }
}

/// Receives every outcome a queue produces.
#[async_trait]
pub trait QueueObserver: Send + Sync {
    /// A single push (or schedule) finished.
    fn on_push_result(&self, message: Message, result: BrokerResult<()>);

    /// A `push_many` batch finished; the batch flag is already cleared.
    fn on_push_many_result(&self, report: PushManyReport);

    /// A delete finished.
    fn on_delete_result(&self, message: Message, result: BrokerResult<()>);

    /// A deliverable message arrived. The poll loop waits for this to return.
    async fn on_message_received(&self, message: Message);

    /// A message exceeded its dequeue limit; it is deleted right after this call.
    fn on_poison(&self, message: Message);

    /// An error not tied to a single operation result.
    fn on_error(&self, error: BrokerError, message: Option<Message>);

    /// The backend resource exists.
    fn on_ready(&self);

    /// Polling began.
    fn on_started(&self);

    /// Polling stopped.
    fn on_stopped(&self);

    /// The backend queue was emptied.
    fn on_emptied(&self);
}

/// The capability contract every queue kind satisfies.
///
/// Operations report their outcome through the attached observer rather than
/// returning it, except for the two that are answered synchronously.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Identity and settings.
    fn info(&self) -> &QueueInfo;

    /// Current lifecycle state.
    fn state(&self) -> QueueState;

    /// Attach the observer. Returns `false` if one is already attached.
    fn attach(&self, observer: Arc<dyn QueueObserver>) -> bool;

    /// Whether `set_invisibility_timeout` is available for this backend.
    fn supports_invisibility_timeout(&self) -> bool;

    /// Ensure the backend resource exists. Idempotent.
    async fn connect(&self);

    /// Begin polling, connecting first when needed. Idempotent.
    async fn start(&self);

    /// Stop polling at the next suspension point. Idempotent.
    async fn stop(&self);

    /// Store one message.
    async fn push(&self, message: Message);

    /// Store many messages in the background.
    ///
    /// Fails immediately with `QueueAlreadyPushing` while an earlier batch is
    /// still running; otherwise the outcome arrives via `on_push_many_result`.
    fn push_many(&self, messages: Vec<Message>) -> BrokerResult<()>;

    /// Store one message that becomes deliverable after `delay`.
    async fn schedule(&self, message: Message, delay: Duration);

    /// Remove a processed message.
    async fn delete_message(&self, message: Message);

    /// Extend (or shorten) how long a received message stays hidden.
    async fn set_invisibility_timeout(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> BrokerResult<()>;

    /// Drop every message held by the backend queue.
    async fn ensure_empty(&self);
}

impl fmt::Debug for dyn Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("info", self.info())
            .field("state", &self.state())
            .finish()
    }
}
