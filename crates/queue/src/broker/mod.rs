//! The broker: job-type routing, lifecycle aggregation and the event stream.

mod binding;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use jobbroker_common::config::DEFAULT_EVENT_CAPACITY;
use jobbroker_common::{BrokerError, BrokerResult};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::BrokerEvent;
use crate::message::{Message, normalize_job_type};
use crate::queue::QueueHandle;
use crate::worker::Worker;

use binding::{Binding, Lifecycle};

/// Most messages accepted by one `push_many` call.
pub const MAX_PUSH_MANY: usize = 1000;

/// Collects `(job type, worker, queue)` registrations.
pub struct BrokerBuilder {
    routes: HashMap<String, Vec<QueueHandle>>,
    queues: Vec<QueueHandle>,
    events: broadcast::Sender<BrokerEvent>,
    lifecycle: Arc<Lifecycle>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerBuilder {
    /// Builder with the default event channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Builder whose event channel keeps up to `capacity` undelivered events
    /// per subscriber.
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            routes: HashMap::new(),
            queues: Vec::new(),
            events,
            lifecycle: Arc::new(Lifecycle::default()),
        }
    }

    /// Subscribe before building to observe events raised during setup.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Bind `worker` and `queue` to `job_type`.
    ///
    /// A queue can only be registered once; a second registration fails with
    /// `QueueDefinedTwice`.
    pub fn register(
        &mut self,
        job_type: &str,
        worker: Arc<dyn Worker>,
        queue: QueueHandle,
    ) -> BrokerResult<&mut Self> {
        let job_type = normalize_job_type(job_type);
        if queue.info().job_type != job_type {
            warn!(
                job_type = %job_type,
                queue_job_type = %queue.info().job_type,
                "Queue filters on a different job type than it is registered for"
            );
        }

        let binding = Binding::new(worker, &queue, self.events.clone(), self.lifecycle.clone());
        if !queue.attach(Arc::new(binding)) {
            return Err(BrokerError::ConfigQueueDefinedTwice {
                module: queue.info().kind.to_string(),
                name: queue.info().name.clone(),
            });
        }

        debug!(job_type = %job_type, queue = %queue.info().label(), "Registered queue");
        self.routes.entry(job_type).or_default().push(queue.clone());
        self.queues.push(queue);
        self.lifecycle.total.fetch_add(1, Ordering::SeqCst);
        Ok(self)
    }

    /// Finish registration.
    #[must_use]
    pub fn build(self) -> Broker {
        Broker {
            routes: self.routes,
            queues: self.queues,
            events: self.events,
        }
    }
}

/// Routes messages to queues and reports everything through [`BrokerEvent`]s.
///
/// Dispatching methods spawn onto the current Tokio runtime and return
/// immediately; outcomes arrive on the event stream.
#[derive(Clone)]
pub struct Broker {
    routes: HashMap<String, Vec<QueueHandle>>,
    queues: Vec<QueueHandle>,
    events: broadcast::Sender<BrokerEvent>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("job_types", &self.routes.keys().collect::<Vec<_>>())
            .field("queues", &self.queues.len())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Start collecting registrations.
    #[must_use]
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Every registered queue, in registration order.
    #[must_use]
    pub fn queues(&self) -> &[QueueHandle] {
        &self.queues
    }

    /// Queues bound to a job type (matched case-insensitively).
    #[must_use]
    pub fn queues_for(&self, job_type: &str) -> &[QueueHandle] {
        self.routes
            .get(&normalize_job_type(job_type))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Registered job types.
    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Push a message to every queue bound to its job type.
    ///
    /// Unknown (or empty) job types are ignored.
    pub fn push(&self, message: Message) {
        self.fan_out(message, Duration::ZERO);
    }

    /// Like [`push`](Self::push), but the message only becomes deliverable after `delay`.
    pub fn schedule(&self, message: Message, delay: Duration) {
        self.fan_out(message, delay);
    }

    fn fan_out(&self, message: Message, delay: Duration) {
        let queues = self.queues_for(&message.job_type);
        if queues.is_empty() {
            debug!(job_type = %message.job_type, "No queue registered for job type, message dropped");
            return;
        }
        for queue in queues {
            let queue = queue.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if delay.is_zero() {
                    queue.push(message).await;
                } else {
                    queue.schedule(message, delay).await;
                }
            });
        }
    }

    /// Push a batch of messages of one job type to its single queue.
    ///
    /// Misuse is rejected here, before anything is sent. An accepted batch
    /// runs in the background and ends with one `QueuePushManyCompleted` event.
    pub fn push_many(&self, messages: Vec<Message>) -> BrokerResult<()> {
        let Some(first) = messages.first() else {
            return Ok(());
        };
        if messages.len() > MAX_PUSH_MANY {
            return Err(BrokerError::QueueTooManyMessages {
                count: messages.len(),
                limit: MAX_PUSH_MANY,
            });
        }
        let job_type = first.routing_key();
        if messages.iter().any(|m| m.routing_key() != job_type) {
            return Err(BrokerError::QueueIncompatibleJobTypes);
        }

        match self.queues_for(&job_type) {
            [] => {
                debug!(job_type = %job_type, "No queue registered for job type, batch dropped");
                Ok(())
            }
            [queue] => queue.push_many(messages),
            _ => Err(BrokerError::QueueTooManyQueues),
        }
    }

    /// Connect every queue concurrently.
    pub fn connect(&self) {
        for queue in &self.queues {
            let queue = queue.clone();
            tokio::spawn(async move { queue.connect().await });
        }
    }

    /// Start every queue concurrently.
    pub fn start(&self) {
        for queue in &self.queues {
            let queue = queue.clone();
            tokio::spawn(async move { queue.start().await });
        }
    }

    /// Stop every queue concurrently.
    pub fn stop(&self) {
        for queue in &self.queues {
            let queue = queue.clone();
            tokio::spawn(async move { queue.stop().await });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::memory::{MemoryBackend, MemoryStore};
    use crate::queue::{ManagedQueue, QueueInfo, QueueKind};
    use crate::settings::QueueSettings;
    use crate::worker::NoWorker;
    use serde_json::json;

    fn memory_queue(store: &Arc<MemoryStore>, number: usize, job_type: &str, name: &str) -> QueueHandle {
        let info = QueueInfo {
            worker_number: number,
            job_type: job_type.into(),
            kind: QueueKind::Memory,
            name: name.into(),
            settings: QueueSettings::default(),
        };
        Arc::new(ManagedQueue::new(
            info,
            MemoryBackend::new(store.clone(), name, Duration::from_secs(30)),
        ))
    }

    #[test]
    fn test_register_routes_case_insensitively() {
        let store = MemoryStore::new();
        let mut builder = Broker::builder();
        builder
            .register(" SendMsg ", Arc::new(NoWorker), memory_queue(&store, 1, "sendmsg", "a"))
            .unwrap();
        let broker = builder.build();

        assert_eq!(broker.queues_for("SENDMSG").len(), 1);
        assert!(broker.queues_for("other").is_empty());
        assert_eq!(broker.job_types().collect::<Vec<_>>(), vec!["sendmsg"]);
    }

    #[test]
    fn test_register_same_queue_twice() {
        let store = MemoryStore::new();
        let queue = memory_queue(&store, 1, "sendmsg", "a");
        let mut builder = Broker::builder();
        builder.register("sendmsg", Arc::new(NoWorker), queue.clone()).unwrap();
        let err = builder
            .register("sendmsg", Arc::new(NoWorker), queue)
            .err()
            .unwrap();
        assert_eq!(err.code(), "QUEUE_DEFINED_TWICE");
    }

    #[tokio::test]
    async fn test_push_many_validation() {
        let store = MemoryStore::new();
        let mut builder = Broker::builder();
        builder
            .register("fanout", Arc::new(NoWorker), memory_queue(&store, 1, "fanout", "a"))
            .unwrap()
            .register("fanout", Arc::new(NoWorker), memory_queue(&store, 2, "fanout", "b"))
            .unwrap()
            .register("single", Arc::new(NoWorker), memory_queue(&store, 3, "single", "c"))
            .unwrap();
        let broker = builder.build();

        assert!(broker.push_many(Vec::new()).is_ok());

        let too_many = vec![Message::new("single", json!(1)); MAX_PUSH_MANY + 1];
        assert_eq!(
            broker.push_many(too_many).unwrap_err(),
            BrokerError::QueueTooManyMessages {
                count: 1001,
                limit: 1000
            }
        );

        let mixed = vec![Message::new("single", json!(1)), Message::new("fanout", json!(2))];
        assert_eq!(
            broker.push_many(mixed).unwrap_err(),
            BrokerError::QueueIncompatibleJobTypes
        );

        let fanned = vec![Message::new("fanout", json!(1))];
        assert_eq!(broker.push_many(fanned).unwrap_err(), BrokerError::QueueTooManyQueues);

        let unknown = vec![Message::new("nobody", json!(1))];
        assert!(broker.push_many(unknown).is_ok());

        // Job types differing only in case are the same job type.
        let same = vec![Message::new("Single", json!(1)), Message::new("SINGLE", json!(2))];
        assert!(broker.push_many(same).is_ok());
    }
}
