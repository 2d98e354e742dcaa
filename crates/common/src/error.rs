//! Error types for jobbroker.
//!
//! Every failure the broker can report is one variant of [`BrokerError`]. A
//! variant carries the arguments of its message template; [`BrokerError::category`]
//! and [`BrokerError::code`] give the stable classification consumers match on.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type used across the broker crates.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broad classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCategory {
    /// Raised while loading and validating the broker configuration.
    Config,
    /// Raised by a queue or by misuse of the broker's queue API.
    Queue,
    /// Raised by a worker while processing a message.
    Worker,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Config => "CONFIG",
            Self::Queue => "QUEUE",
            Self::Worker => "WORKER",
        })
    }
}

/// Broker error type.
///
/// Nested errors coming from a backend or a worker are kept as text so the
/// error stays cheap to clone into every event that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    // === Configuration ===
    #[error("The config file [{0}] could not be loaded")]
    ConfigFileNotFound(String),

    #[error("Could not load JSON configuration file: {0}")]
    ConfigJsonParse(String),

    #[error("The workers node could not be loaded")]
    ConfigNoWorkersArray,

    #[error("The workers node contains no valid workers")]
    ConfigWorkersArrayEmpty,

    #[error("Worker [{0}]: job-type must be set")]
    ConfigJobTypeMissing(usize),

    #[error("Worker [{0}]: worker must be set")]
    ConfigWorkerNodeMissing(usize),

    #[error("Worker [{0}]: worker-module must be set")]
    ConfigWorkerModuleMissing(usize),

    #[error("Worker Module[{0}]: worker module could not be loaded")]
    ConfigUnableToLoadWorkerModule(String),

    #[error("Initialization Error in Worker Module[{module}]: Worker module error - {reason}")]
    ConfigUnableToInitializeWorkerModule { module: String, reason: String },

    #[error("Worker [{0}]: queue must be set")]
    ConfigQueueNodeMissing(usize),

    #[error("Worker [{0}]: queue-module must be set")]
    ConfigQueueModuleMissing(usize),

    #[error("Worker [{0}]: queue-name must be set")]
    ConfigQueueNameMissing(usize),

    #[error(
        "Queue name[{0}] is invalid. Queue names (case-insensitive) can only be 15 characters and contain only characters A-Z or 0-9"
    )]
    ConfigInvalidQueueName(String),

    #[error("Worker Module[{0}]: queue module could not be loaded")]
    ConfigUnableToLoadQueueModule(String),

    #[error("Initialization Error in Worker Module[{module}]: Queue module error - {reason}")]
    ConfigUnableToInitializeQueueModule { module: String, reason: String },

    #[error("Queue with Module[{module}] and Name[{name}] is defined more than once")]
    ConfigQueueDefinedTwice { module: String, name: String },

    #[error("An unknown error occurred:[{0}]")]
    ConfigUnknown(String),

    // === Queue runtime ===
    #[error("Could not load list of queues - {0}")]
    QueueListLoad(String),

    #[error("Could not create queue[{queue}] - {reason}")]
    QueueCreate { queue: String, reason: String },

    #[error("Could not create queue[{queue}] - Response: {response}")]
    QueueUnexpectedResponse { queue: String, response: String },

    #[error("Could not receive message queue[{queue}] - Error: {reason}")]
    QueueReceive { queue: String, reason: String },

    #[error("Could not decode message [{id}] from queue[{queue}] - {reason}")]
    QueueMalformedMessage {
        queue: String,
        id: String,
        reason: String,
    },

    #[error("Could not initialize queue")]
    QueuePushNotInitialized,

    #[error("Unexpected error: {0}")]
    QueuePush(String),

    #[error("Could not initialize queue")]
    QueueVisibilityNotInitialized,

    #[error("Unexpected error: {0}")]
    QueueVisibility(String),

    #[error("setInvisibilityTimeout() is not implemented for queue module [{0}]")]
    QueueVisibilityNotSupported(String),

    #[error("Could not initialize queue")]
    QueueDeleteNotInitialized,

    #[error("Unexpected error: {0}")]
    QueueDelete(String),

    #[error("Too many messages: {count} (at most {limit} per pushMany() call)")]
    QueueTooManyMessages { count: usize, limit: usize },

    #[error("pushMany() can only be used to push messages of the same jobType")]
    QueueIncompatibleJobTypes,

    #[error("pushMany() can only be used for a jobType registered for a single queue")]
    QueueTooManyQueues,

    #[error(
        "pushMany() already in progress for jobType[{0}]. Please wait for queue-pushmany-completed event before calling pushMany() again."
    )]
    QueueAlreadyPushing(String),

    #[error("Could not initialize queue")]
    QueueDropNotInitialized,

    #[error("Error trying to delete Queue[{queue}]: {reason}")]
    QueueDrop { queue: String, reason: String },

    // === Worker runtime ===
    #[error("Unexpected error occurred while calling worker.work - {0}")]
    UnexpectedWorker(String),

    #[error("Worker failed to process message - {0}")]
    WorkFailed(String),
}

impl BrokerError {
    /// Returns the category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigFileNotFound(_)
            | Self::ConfigJsonParse(_)
            | Self::ConfigNoWorkersArray
            | Self::ConfigWorkersArrayEmpty
            | Self::ConfigJobTypeMissing(_)
            | Self::ConfigWorkerNodeMissing(_)
            | Self::ConfigWorkerModuleMissing(_)
            | Self::ConfigUnableToLoadWorkerModule(_)
            | Self::ConfigUnableToInitializeWorkerModule { .. }
            | Self::ConfigQueueNodeMissing(_)
            | Self::ConfigQueueModuleMissing(_)
            | Self::ConfigQueueNameMissing(_)
            | Self::ConfigInvalidQueueName(_)
            | Self::ConfigUnableToLoadQueueModule(_)
            | Self::ConfigUnableToInitializeQueueModule { .. }
            | Self::ConfigQueueDefinedTwice { .. }
            | Self::ConfigUnknown(_) => ErrorCategory::Config,

            Self::UnexpectedWorker(_) | Self::WorkFailed(_) => ErrorCategory::Worker,

            _ => ErrorCategory::Queue,
        }
    }

    /// Returns the stable symbolic code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigFileNotFound(_) => "FILE_NOT_FOUND",
            Self::ConfigJsonParse(_) => "JSON_PARSE_ERROR",
            Self::ConfigNoWorkersArray => "NO_WORKERS_ARRAY",
            Self::ConfigWorkersArrayEmpty => "WORKERS_ARRAY_EMPTY",
            Self::ConfigJobTypeMissing(_) => "JOB_TYPE_MISSING",
            Self::ConfigWorkerNodeMissing(_) => "NO_WORKER_NODE",
            Self::ConfigWorkerModuleMissing(_) => "WORKER_MODULE_MISSING",
            Self::ConfigUnableToLoadWorkerModule(_) => "UNABLE_TO_LOAD_WORKER_MODULE",
            Self::ConfigUnableToInitializeWorkerModule { .. } => {
                "UNABLE_TO_INITIALIZE_WORKER_MODULE"
            }
            Self::ConfigQueueNodeMissing(_) => "QUEUE_NODE_MISSING",
            Self::ConfigQueueModuleMissing(_) => "QUEUE_MODULE_MISSING",
            Self::ConfigQueueNameMissing(_) => "QUEUE_NAME_MISSING",
            Self::ConfigInvalidQueueName(_) => "INVALID_QUEUE_NAME",
            Self::ConfigUnableToLoadQueueModule(_) => "UNABLE_TO_LOAD_QUEUE_MODULE",
            Self::ConfigUnableToInitializeQueueModule { .. } => {
                "UNABLE_TO_INITIALIZE_QUEUE_MODULE"
            }
            Self::ConfigQueueDefinedTwice { .. } => "QUEUE_DEFINED_TWICE",
            Self::ConfigUnknown(_) => "UNKNOWN_ERROR",
            Self::QueueListLoad(_) => "ERROR_LOADING_QUEUE_LIST",
            Self::QueueCreate { .. } => "ERROR_CREATING_QUEUE",
            Self::QueueUnexpectedResponse { .. } => "UNEXPECTED_RESPONSE_FROM_SERVER",
            Self::QueueReceive { .. } => "ERROR_RECEIVING_MESSAGE",
            Self::QueueMalformedMessage { .. } => "MALFORMED_MESSAGE",
            Self::QueuePushNotInitialized => "PUSH_NOT_INITIALIZED",
            Self::QueuePush(_) => "PUSH_ERROR",
            Self::QueueVisibilityNotInitialized => "VISIBILITY_TIMEOUT_NOT_INITIALIZED",
            Self::QueueVisibility(_) => "VISIBILITY_TIMEOUT_ERROR",
            Self::QueueVisibilityNotSupported(_) => "VISIBILITY_TIMEOUT_NOT_SUPPORTED",
            Self::QueueDeleteNotInitialized => "DELETE_NOT_INITIALIZED",
            Self::QueueDelete(_) => "DELETE_ERROR",
            Self::QueueTooManyMessages { .. } => "TOO_MANY_MESSAGES",
            Self::QueueIncompatibleJobTypes => "INCOMPATIBLE_JOB_TYPES",
            Self::QueueTooManyQueues => "TOO_MANY_QUEUES",
            Self::QueueAlreadyPushing(_) => "BATCH_SENDING_IN_PROGRESS",
            Self::QueueDropNotInitialized => "QUEUE_DELETE_NOT_INITIALIZED",
            Self::QueueDrop { .. } => "QUEUE_DELETE_ERROR",
            Self::UnexpectedWorker(_) => "UNEXPECTED_ERROR",
            Self::WorkFailed(_) => "WORK_FAILED",
        }
    }

    /// Convenience constructor for a worker that wants to report a failure.
    #[must_use]
    pub fn work_failed(reason: impl fmt::Display) -> Self {
        Self::WorkFailed(reason.to_string())
    }

    /// Log this error once with its classification.
    pub fn trace(&self) {
        match self.category() {
            ErrorCategory::Config => {
                tracing::error!(code = self.code(), error = %self, "Configuration error");
            }
            ErrorCategory::Queue => {
                tracing::warn!(code = self.code(), error = %self, "Queue error");
            }
            ErrorCategory::Worker => {
                tracing::warn!(code = self.code(), error = %self, "Worker error");
            }
        }
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(path) => Self::ConfigFileNotFound(path),
            other => Self::ConfigJsonParse(other.to_string()),
        }
    }
}
