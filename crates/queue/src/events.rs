//! The broker's typed event stream.

use jobbroker_common::BrokerError;

use crate::message::{Message, PushManyReport};
use crate::queue::QueueHandle;
use crate::worker::WorkerInfo;

/// Correlation data attached to per-message events.
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Worker bound to the queue.
    pub worker: WorkerInfo,
    /// Queue that produced the event.
    pub queue: QueueHandle,
    /// The error, for failure events.
    pub error: Option<BrokerError>,
}

/// Everything the broker reports to its subscribers.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A worker processed a message; the message is being deleted.
    WorkCompleted { meta: EventMeta, message: Message },
    /// A worker failed; the message stays on the queue for redelivery.
    WorkError { meta: EventMeta, message: Message },
    /// A message was stored by a queue.
    QueueSuccess { meta: EventMeta, message: Message },
    /// A queue operation failed.
    QueueError {
        meta: EventMeta,
        message: Option<Message>,
    },
    /// A `push_many` batch finished.
    QueuePushManyCompleted {
        meta: EventMeta,
        report: PushManyReport,
    },
    /// A processed message was removed.
    QueueDeleted { meta: EventMeta, message: Message },
    /// A message exceeded its dequeue limit and was removed unprocessed.
    QueuePoison { meta: EventMeta, message: Message },
    /// A message is being handed to its worker.
    QueueReceived { meta: EventMeta, message: Message },
    /// A queue's backend resource exists.
    QueueReady {
        worker: WorkerInfo,
        queue: QueueHandle,
    },
    /// Every registered queue is ready.
    BrokerInitialized,
    /// A queue began polling.
    QueueStarted {
        worker: WorkerInfo,
        queue: QueueHandle,
    },
    /// Every registered queue is polling.
    BrokerStarted,
    /// A queue stopped polling.
    QueueStopped {
        worker: WorkerInfo,
        queue: QueueHandle,
    },
    /// Every started queue has stopped.
    BrokerStopped,
    /// A queue was emptied.
    QueueEmptied {
        worker: WorkerInfo,
        queue: QueueHandle,
    },
}

impl BrokerEvent {
    /// Stable event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WorkCompleted { .. } => "work-completed",
            Self::WorkError { .. } => "work-error",
            Self::QueueSuccess { .. } => "queue-success",
            Self::QueueError { .. } => "queue-error",
            Self::QueuePushManyCompleted { .. } => "queue-pushmany-completed",
            Self::QueueDeleted { .. } => "queue-deleted",
            Self::QueuePoison { .. } => "queue-poison",
            Self::QueueReceived { .. } => "queue-received",
            Self::QueueReady { .. } => "queue-ready",
            Self::BrokerInitialized => "broker-initialized",
            Self::QueueStarted { .. } => "queue-started",
            Self::BrokerStarted => "broker-started",
            Self::QueueStopped { .. } => "queue-stopped",
            Self::BrokerStopped => "broker-stopped",
            Self::QueueEmptied { .. } => "queue-emptied",
        }
    }

    /// Correlation metadata, for per-message events.
    #[must_use]
    pub const fn meta(&self) -> Option<&EventMeta> {
        match self {
            Self::WorkCompleted { meta, .. }
            | Self::WorkError { meta, .. }
            | Self::QueueSuccess { meta, .. }
            | Self::QueueError { meta, .. }
            | Self::QueuePushManyCompleted { meta, .. }
            | Self::QueueDeleted { meta, .. }
            | Self::QueuePoison { meta, .. }
            | Self::QueueReceived { meta, .. } => Some(meta),
            _ => None,
        }
    }

    /// The queue this event concerns, if any.
    #[must_use]
    pub fn queue(&self) -> Option<&QueueHandle> {
        match self {
            Self::QueueReady { queue, .. }
            | Self::QueueStarted { queue, .. }
            | Self::QueueStopped { queue, .. }
            | Self::QueueEmptied { queue, .. } => Some(queue),
            other => other.meta().map(|meta| &meta.queue),
        }
    }

    /// The error carried by failure events.
    #[must_use]
    pub fn error(&self) -> Option<&BrokerError> {
        self.meta().and_then(|meta| meta.error.as_ref())
    }
}
