//! Glue between one registered queue, its worker and the broker's event stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use jobbroker_common::{BrokerError, BrokerResult};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::{BrokerEvent, EventMeta};
use crate::message::{Message, PushManyReport};
use crate::queue::{Queue, QueueHandle, QueueObserver};
use crate::worker::{self, WorkContext, Worker, WorkerInfo};

/// Counters behind the broker-wide lifecycle events.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    pub(crate) total: AtomicUsize,
    ready: AtomicUsize,
    started: AtomicUsize,
}

/// Observer attached to a registered queue.
pub(crate) struct Binding {
    worker: Arc<dyn Worker>,
    worker_info: WorkerInfo,
    queue: Weak<dyn Queue>,
    events: broadcast::Sender<BrokerEvent>,
    lifecycle: Arc<Lifecycle>,
}

impl Binding {
    pub(crate) fn new(
        worker: Arc<dyn Worker>,
        queue: &QueueHandle,
        events: broadcast::Sender<BrokerEvent>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        let worker_info = WorkerInfo {
            number: queue.info().worker_number,
            module: worker.name().to_string(),
        };
        Self {
            worker,
            worker_info,
            queue: Arc::downgrade(queue),
            events,
            lifecycle,
        }
    }

    fn emit(&self, event: BrokerEvent) {
        debug!(event = event.name(), worker = self.worker_info.number, "Broker event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn meta(&self, error: Option<BrokerError>) -> Option<EventMeta> {
        let queue = self.queue.upgrade()?;
        Some(EventMeta {
            worker: self.worker_info.clone(),
            queue,
            error,
        })
    }

    fn emit_with_meta(&self, error: Option<BrokerError>, event: impl FnOnce(EventMeta) -> BrokerEvent) {
        if let Some(meta) = self.meta(error) {
            self.emit(event(meta));
        }
    }

    fn emit_for_queue(&self, event: impl FnOnce(WorkerInfo, QueueHandle) -> BrokerEvent) {
        if let Some(queue) = self.queue.upgrade() {
            self.emit(event(self.worker_info.clone(), queue));
        }
    }

    fn queue_error(&self, error: BrokerError, message: Option<Message>) {
        error.trace();
        self.emit_with_meta(Some(error), |meta| BrokerEvent::QueueError { meta, message });
    }
}

#[async_trait]
impl QueueObserver for Binding {
    fn on_push_result(&self, message: Message, result: BrokerResult<()>) {
        match result {
            Ok(()) => {
                debug!(id = ?message.id, job_type = %message.job_type, "Message pushed");
                self.emit_with_meta(None, |meta| BrokerEvent::QueueSuccess { meta, message });
            }
            Err(error) => self.queue_error(error, Some(message)),
        }
    }

    fn on_push_many_result(&self, report: PushManyReport) {
        self.emit_with_meta(None, |meta| BrokerEvent::QueuePushManyCompleted { meta, report });
    }

    fn on_delete_result(&self, message: Message, result: BrokerResult<()>) {
        match result {
            Ok(()) => {
                debug!(id = ?message.id, "Message deleted");
                self.emit_with_meta(None, |meta| BrokerEvent::QueueDeleted { meta, message });
            }
            Err(error) => {
                warn!(
                    id = ?message.id,
                    "Message could not be deleted and will be delivered again"
                );
                self.queue_error(error, Some(message));
            }
        }
    }

    async fn on_message_received(&self, message: Message) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        self.emit_with_meta(None, |meta| BrokerEvent::QueueReceived {
            meta,
            message: message.clone(),
        });

        let ctx = WorkContext::new(queue.clone(), self.worker_info.clone());
        match worker::process(self.worker.as_ref(), &message, &ctx).await {
            Ok(()) => {
                self.emit_with_meta(None, |meta| BrokerEvent::WorkCompleted {
                    meta,
                    message: message.clone(),
                });
                queue.delete_message(message).await;
            }
            Err(error) => {
                error.trace();
                self.emit_with_meta(Some(error), |meta| BrokerEvent::WorkError { meta, message });
            }
        }
    }

    fn on_poison(&self, message: Message) {
        self.emit_with_meta(None, |meta| BrokerEvent::QueuePoison { meta, message });
    }

    fn on_error(&self, error: BrokerError, message: Option<Message>) {
        self.queue_error(error, message);
    }

    fn on_ready(&self) {
        self.emit_for_queue(|worker, queue| BrokerEvent::QueueReady { worker, queue });
        let ready = self.lifecycle.ready.fetch_add(1, Ordering::SeqCst) + 1;
        if ready == self.lifecycle.total.load(Ordering::SeqCst) {
            info!(queues = ready, "Broker initialized");
            self.emit(BrokerEvent::BrokerInitialized);
        }
    }

    fn on_started(&self) {
        self.emit_for_queue(|worker, queue| BrokerEvent::QueueStarted { worker, queue });
        let started = self.lifecycle.started.fetch_add(1, Ordering::SeqCst) + 1;
        if started == self.lifecycle.total.load(Ordering::SeqCst) {
            info!(queues = started, "Broker started");
            self.emit(BrokerEvent::BrokerStarted);
        }
    }

    fn on_stopped(&self) {
        self.emit_for_queue(|worker, queue| BrokerEvent::QueueStopped { worker, queue });
        let previous = self
            .lifecycle
            .started
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            info!("Broker stopped");
            self.emit(BrokerEvent::BrokerStopped);
        }
    }

    fn on_emptied(&self) {
        self.emit_for_queue(|worker, queue| BrokerEvent::QueueEmptied { worker, queue });
    }
}
