//! Process-local backend.
//!
//! Honors delays, visibility timeouts and receive counts the way a remote
//! queue service does, which makes it usable for development setups and for
//! exercising the queue engine without external services. Several queue
//! instances pointing at the same [`MemoryStore`] and name share messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jobbroker_common::IdGenerator;
use serde_json::Value;
use tokio::time::Instant;

use super::backend::{
    BackendError, DeleteEntry, DeletePolicy, EntryResult, QueueBackend, Received, SendEntry,
};
use super::QueueKind;
use crate::settings::{SettingsError, optional_u64};

static SHARED: LazyLock<Arc<MemoryStore>> = LazyLock::new(|| Arc::new(MemoryStore::default()));

#[derive(Debug)]
struct StoredMessage {
    id: String,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    next_seq: u64,
    messages: Vec<StoredMessage>,
}

/// Named in-memory queues.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    created: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty, private store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide store.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        SHARED.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of the queues created so far.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// How many queues have been created in this store.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Messages held by a queue, visible or not.
    #[must_use]
    pub fn message_count(&self, queue: &str) -> usize {
        self.lock().get(queue).map_or(0, |q| q.messages.len())
    }
}

/// A queue stored in a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    name: String,
    invisibility_timeout: Duration,
    batch_flush_every: Option<Duration>,
    ids: IdGenerator,
}

impl MemoryBackend {
    /// Batch size used when batching is enabled.
    pub const BATCH_SIZE: usize = 10;

    /// Create a backend for queue `name` in `store`.
    pub fn new(store: Arc<MemoryStore>, name: impl Into<String>, invisibility_timeout: Duration) -> Self {
        Self {
            store,
            name: name.into(),
            invisibility_timeout,
            batch_flush_every: None,
            ids: IdGenerator::new(),
        }
    }

    /// Use batched sends, receives and deletes, flushing deletes at least every `flush_every`.
    #[must_use]
    pub const fn with_batching(mut self, flush_every: Duration) -> Self {
        self.batch_flush_every = Some(flush_every);
        self
    }

    /// Build from a `queue-settings` node. `delete-frequency-seconds` turns batching on.
    pub fn from_settings(
        store: Arc<MemoryStore>,
        name: impl Into<String>,
        settings: &Value,
        invisibility_timeout: Duration,
    ) -> Result<Self, SettingsError> {
        let backend = Self::new(store, name, invisibility_timeout);
        let frequency = match settings.as_object() {
            Some(settings) => optional_u64(settings, "delete-frequency-seconds")?,
            None => None,
        };
        Ok(match frequency {
            Some(seconds) => backend.with_batching(Duration::from_secs(seconds)),
            None => backend,
        })
    }

    fn with_queue<T>(
        &self,
        f: impl FnOnce(&mut MemoryQueue) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut queues = self.store.lock();
        let queue = queues
            .get_mut(&self.name)
            .ok_or_else(|| BackendError::Request(format!("queue [{}] does not exist", self.name)))?;
        f(queue)
    }

    fn insert(queue: &mut MemoryQueue, id: String, body: String, delay: Duration) {
        queue.next_seq += 1;
        queue.messages.push(StoredMessage {
            id,
            body,
            visible_at: Instant::now() + delay,
            receive_count: 0,
            seq: queue.next_seq,
        });
    }

    fn remove(queue: &mut MemoryQueue, message_id: &str) -> Result<(), BackendError> {
        let before = queue.messages.len();
        queue.messages.retain(|m| m.id != message_id);
        if queue.messages.len() == before {
            return Err(BackendError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn kind(&self) -> QueueKind {
        QueueKind::Memory
    }

    async fn ensure_queue(&self) -> Result<bool, BackendError> {
        let mut queues = self.store.lock();
        if queues.contains_key(&self.name) {
            return Ok(false);
        }
        queues.insert(self.name.clone(), MemoryQueue::default());
        self.store.created.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn send(&self, body: String, delay: Duration) -> Result<String, BackendError> {
        let id = self.ids.message_id();
        self.with_queue(|queue| {
            Self::insert(queue, id.clone(), body, delay);
            Ok(id)
        })
    }

    fn max_send_batch(&self) -> Option<usize> {
        self.batch_flush_every.map(|_| Self::BATCH_SIZE)
    }

    async fn send_batch(
        &self,
        entries: Vec<SendEntry>,
    ) -> Result<Vec<EntryResult<String>>, BackendError> {
        self.with_queue(|queue| {
            Ok(entries
                .into_iter()
                .map(|entry| {
                    let id = self.ids.message_id();
                    Self::insert(queue, id.clone(), entry.body, Duration::ZERO);
                    (entry.entry_id, Ok(id))
                })
                .collect())
        })
    }

    fn receive_batch_size(&self) -> usize {
        if self.batch_flush_every.is_some() {
            Self::BATCH_SIZE
        } else {
            1
        }
    }

    async fn receive(&self, max: usize, _wait: Duration) -> Result<Vec<Received>, BackendError> {
        let now = Instant::now();
        let hidden_until = now + self.invisibility_timeout;
        self.with_queue(|queue| {
            let mut visible: Vec<&mut StoredMessage> = queue
                .messages
                .iter_mut()
                .filter(|m| m.visible_at <= now)
                .collect();
            visible.sort_by_key(|m| (m.visible_at, m.seq));

            Ok(visible
                .into_iter()
                .take(max)
                .map(|m| {
                    m.visible_at = hidden_until;
                    m.receive_count += 1;
                    Received {
                        id: m.id.clone(),
                        body: m.body.clone(),
                        receive_count: m.receive_count,
                        receipt_handle: Some(format!("{}:{}", m.id, m.receive_count)),
                    }
                })
                .collect())
        })
    }

    fn delete_policy(&self) -> DeletePolicy {
        match self.batch_flush_every {
            Some(flush_every) => DeletePolicy::Batched {
                max_batch: Self::BATCH_SIZE,
                flush_every,
            },
            None => DeletePolicy::Immediate,
        }
    }

    async fn delete(
        &self,
        message_id: &str,
        _receipt_handle: Option<&str>,
    ) -> Result<(), BackendError> {
        self.with_queue(|queue| Self::remove(queue, message_id))
    }

    async fn delete_batch(
        &self,
        entries: Vec<DeleteEntry>,
    ) -> Result<Vec<EntryResult<()>>, BackendError> {
        self.with_queue(|queue| {
            Ok(entries
                .into_iter()
                .map(|entry| {
                    let result = Self::remove(queue, &entry.message_id);
                    (entry.entry_id, result)
                })
                .collect())
        })
    }

    fn supports_visibility(&self) -> bool {
        true
    }

    async fn change_visibility(
        &self,
        message_id: &str,
        _receipt_handle: Option<&str>,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        self.with_queue(|queue| {
            let message = queue
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| BackendError::MessageNotFound(message_id.to_string()))?;
            message.visible_at = Instant::now() + timeout;
            Ok(())
        })
    }

    async fn purge(&self) -> Result<(), BackendError> {
        self.with_queue(|queue| {
            queue.messages.clear();
            Ok(())
        })
    }
}
