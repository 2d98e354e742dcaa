//! The queue engine shared by every backend.
//!
//! [`ManagedQueue`] turns a [`QueueBackend`] into a [`Queue`]: it owns the
//! lifecycle state machine, the poll loop, poison detection, the job-type
//! filter, the `push_many` guard and delete batching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jobbroker_common::{BrokerError, BrokerResult, IdGenerator};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backend::{BackendError, DeleteEntry, DeletePolicy, QueueBackend, Received, SendEntry};
use super::{Queue, QueueInfo, QueueObserver, QueueState};
use crate::message::{Message, PushFailure, PushManyReport};

/// How often the delete flusher checks the buffer.
const FLUSH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A [`Queue`] driven by a storage backend.
pub struct ManagedQueue<B: QueueBackend> {
    inner: Arc<Inner<B>>,
}

struct Inner<B: QueueBackend> {
    info: QueueInfo,
    label: String,
    backend: B,
    observer: OnceLock<Arc<dyn QueueObserver>>,
    state: Mutex<QueueState>,
    /// Serializes connect/start/stop.
    lifecycle: AsyncMutex<()>,
    running: watch::Sender<bool>,
    /// Bumped on every start; background tasks of older runs exit.
    generation: AtomicU64,
    pushing: AtomicBool,
    deletes: AsyncMutex<DeleteBuffer>,
    ids: IdGenerator,
}

struct DeleteBuffer {
    pending: Vec<Message>,
    last_flush: Instant,
}

impl DeleteBuffer {
    fn take(&mut self) -> Vec<Message> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.pending)
    }
}

impl<B: QueueBackend> ManagedQueue<B> {
    /// Wrap a backend.
    pub fn new(info: QueueInfo, backend: B) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                label: info.label(),
                info,
                backend,
                observer: OnceLock::new(),
                state: Mutex::new(QueueState::Uninitialized),
                lifecycle: AsyncMutex::new(()),
                running,
                generation: AtomicU64::new(0),
                pushing: AtomicBool::new(false),
                deletes: AsyncMutex::new(DeleteBuffer {
                    pending: Vec::new(),
                    last_flush: Instant::now(),
                }),
                ids: IdGenerator::new(),
            }),
        }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }
}

impl<B: QueueBackend> Inner<B> {
    fn state(&self) -> QueueState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: QueueState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.running.borrow() && self.generation.load(Ordering::SeqCst) == generation
    }

    fn notify(&self, f: impl FnOnce(&dyn QueueObserver)) {
        match self.observer.get() {
            Some(observer) => f(observer.as_ref()),
            None => debug!(queue = %self.label, "No observer attached, notification dropped"),
        }
    }

    fn report_error(&self, error: BrokerError, message: Option<Message>) {
        self.notify(|o| o.on_error(error, message));
    }

    async fn initialize(&self) -> BrokerResult<()> {
        match self.backend.ensure_queue().await {
            Ok(true) => {
                info!(queue = %self.label, "Created backend queue");
                Ok(())
            }
            Ok(false) => {
                debug!(queue = %self.label, "Backend queue already exists");
                Ok(())
            }
            Err(BackendError::ListQueues(reason)) => Err(BrokerError::QueueListLoad(reason)),
            Err(BackendError::UnexpectedResponse(response)) => {
                Err(BrokerError::QueueUnexpectedResponse {
                    queue: self.info.name.clone(),
                    response,
                })
            }
            Err(other) => Err(BrokerError::QueueCreate {
                queue: self.info.name.clone(),
                reason: other.to_string(),
            }),
        }
    }

    // === Polling ===

    async fn poll_loop(self: Arc<Self>, generation: u64) {
        let mut running = self.running.subscribe();
        let batch_size = self.backend.receive_batch_size();
        let wait = self.info.settings.polling_interval;
        debug!(queue = %self.label, "Polling started");

        while self.is_current(generation) {
            let polled_at = Instant::now();
            match self.backend.receive(batch_size, wait).await {
                Ok(received) if received.is_empty() => {
                    // A long poll that came back early did not wait for us.
                    if !self.backend.long_polls() || polled_at.elapsed() < wait {
                        self.pause(&mut running).await;
                    }
                }
                Ok(received) => {
                    for delivery in received {
                        self.dispatch(delivery).await;
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => {
                    self.report_error(
                        BrokerError::QueueReceive {
                            queue: self.info.name.clone(),
                            reason: e.to_string(),
                        },
                        None,
                    );
                    self.pause(&mut running).await;
                }
            }
        }

        debug!(queue = %self.label, "Polling stopped");
    }

    /// Sleep for the polling interval, waking early on stop.
    async fn pause(&self, running: &mut watch::Receiver<bool>) {
        tokio::select! {
            () = tokio::time::sleep(self.info.settings.polling_interval) => {}
            () = stopped(running) => {}
        }
    }

    async fn dispatch(&self, delivery: Received) {
        let max_dequeue_count = self.info.settings.max_dequeue_count;
        let message = match Message::from_body(
            &delivery.body,
            delivery.id.clone(),
            delivery.receive_count,
            delivery.receipt_handle.clone(),
        ) {
            Ok(message) => message,
            Err(e) => {
                self.report_error(
                    BrokerError::QueueMalformedMessage {
                        queue: self.info.name.clone(),
                        id: delivery.id.clone(),
                        reason: e.to_string(),
                    },
                    None,
                );
                if delivery.receive_count > max_dequeue_count {
                    if let Err(e) = self
                        .backend
                        .delete(&delivery.id, delivery.receipt_handle.as_deref())
                        .await
                    {
                        warn!(queue = %self.label, id = %delivery.id, error = %e, "Failed to delete malformed message");
                    }
                }
                return;
            }
        };

        if message.dequeue_count > max_dequeue_count {
            warn!(
                queue = %self.label,
                id = %delivery.id,
                dequeue_count = message.dequeue_count,
                "Poison message, removing it"
            );
            self.notify(|o| o.on_poison(message.clone()));
            self.delete(message).await;
            return;
        }

        if message.routing_key() != self.info.job_type {
            debug!(
                queue = %self.label,
                job_type = %message.job_type,
                "Ignoring message for another job type"
            );
            return;
        }

        match self.observer.get() {
            Some(observer) => observer.on_message_received(message).await,
            None => debug!(queue = %self.label, "No observer attached, message left on queue"),
        }
    }

    // === Push ===

    async fn store(&self, message: &Message, delay: Duration) -> BrokerResult<String> {
        if !self.state().is_initialized() {
            return Err(BrokerError::QueuePushNotInitialized);
        }
        let body = message
            .to_body()
            .map_err(|e| BrokerError::QueuePush(e.to_string()))?;
        self.backend
            .send(body, delay)
            .await
            .map_err(|e| BrokerError::QueuePush(e.to_string()))
    }

    async fn send_one(&self, mut message: Message, delay: Duration) {
        let result = self.store(&message, delay).await.map(|id| {
            message.id = Some(id);
        });
        if let Err(e) = &result {
            debug!(queue = %self.label, error = %e, "Push failed");
        }
        self.notify(|o| o.on_push_result(message, result));
    }

    fn record(&self, report: &mut PushManyReport, mut message: Message, result: BrokerResult<String>) {
        match result {
            Ok(id) => {
                message.id = Some(id);
                self.notify(|o| o.on_push_result(message.clone(), Ok(())));
                report.successes.push(message);
            }
            Err(error) => {
                self.notify(|o| o.on_push_result(message.clone(), Err(error.clone())));
                report.failures.push(PushFailure { message, error });
            }
        }
    }

    async fn store_many(&self, messages: Vec<Message>) -> PushManyReport {
        let mut report = PushManyReport::default();

        if !self.state().is_initialized() {
            for message in messages {
                self.record(&mut report, message, Err(BrokerError::QueuePushNotInitialized));
            }
            return report;
        }

        match self.backend.max_send_batch() {
            Some(max_batch) if max_batch > 0 => {
                let mut messages = messages.into_iter();
                loop {
                    let chunk: Vec<Message> = messages.by_ref().take(max_batch).collect();
                    if chunk.is_empty() {
                        break;
                    }
                    self.store_chunk(chunk, &mut report).await;
                }
            }
            _ => {
                for message in messages {
                    let result = self.store(&message, Duration::ZERO).await;
                    self.record(&mut report, message, result);
                    tokio::task::yield_now().await;
                }
            }
        }

        info!(
            queue = %self.label,
            successes = report.successes.len(),
            failures = report.failures.len(),
            "push_many finished"
        );
        report
    }

    async fn store_chunk(&self, chunk: Vec<Message>, report: &mut PushManyReport) {
        let mut entries = Vec::with_capacity(chunk.len());
        let mut pending = Vec::with_capacity(chunk.len());
        for message in chunk {
            match message.to_body() {
                Ok(body) => {
                    let entry_id = self.ids.batch_entry_id();
                    entries.push(SendEntry {
                        entry_id: entry_id.clone(),
                        body,
                    });
                    pending.push((entry_id, message));
                }
                Err(e) => self.record(report, message, Err(BrokerError::QueuePush(e.to_string()))),
            }
        }
        if entries.is_empty() {
            return;
        }

        let (mut results, batch_error) = split_batch(self.backend.send_batch(entries).await);
        for (entry_id, message) in pending {
            let result = entry_outcome(&mut results, batch_error.as_ref(), &entry_id)
                .map_err(|e| BrokerError::QueuePush(e.to_string()));
            self.record(report, message, result);
            tokio::task::yield_now().await;
        }
    }

    // === Delete ===

    async fn delete(&self, message: Message) {
        if !self.state().is_initialized() {
            self.notify(|o| o.on_delete_result(message, Err(BrokerError::QueueDeleteNotInitialized)));
            return;
        }
        let Some(id) = message.id.clone() else {
            let error = BrokerError::QueueDelete("message has no id".into());
            self.notify(|o| o.on_delete_result(message, Err(error)));
            return;
        };

        match self.backend.delete_policy() {
            DeletePolicy::Immediate => {
                let result = self
                    .backend
                    .delete(&id, message.receipt_handle.as_deref())
                    .await
                    .map_err(|e| BrokerError::QueueDelete(e.to_string()));
                self.notify(|o| o.on_delete_result(message, result));
            }
            DeletePolicy::Batched { max_batch, .. } => {
                let due = {
                    let mut buffer = self.deletes.lock().await;
                    buffer.pending.push(message);
                    if buffer.pending.len() >= max_batch || self.state() != QueueState::Started {
                        Some(buffer.take())
                    } else {
                        None
                    }
                };
                if let Some(batch) = due {
                    self.flush_deletes(batch, max_batch).await;
                }
            }
        }
    }

    async fn flush_deletes(&self, messages: Vec<Message>, max_batch: usize) {
        let mut messages = messages.into_iter();
        loop {
            let chunk: Vec<Message> = messages.by_ref().take(max_batch.max(1)).collect();
            if chunk.is_empty() {
                break;
            }
            debug!(queue = %self.label, count = chunk.len(), "Flushing deletes");

            let entries: Vec<(String, Message)> = chunk
                .into_iter()
                .map(|message| (self.ids.batch_entry_id(), message))
                .collect();
            let request = entries
                .iter()
                .map(|(entry_id, message)| DeleteEntry {
                    entry_id: entry_id.clone(),
                    message_id: message.id.clone().unwrap_or_default(),
                    receipt_handle: message.receipt_handle.clone(),
                })
                .collect();

            let (mut results, batch_error) = split_batch(self.backend.delete_batch(request).await);
            for (entry_id, message) in entries {
                let result = entry_outcome(&mut results, batch_error.as_ref(), &entry_id)
                    .map_err(|e| BrokerError::QueueDelete(e.to_string()));
                self.notify(|o| o.on_delete_result(message, result));
                tokio::task::yield_now().await;
            }
        }
    }

    async fn flush_loop(self: Arc<Self>, generation: u64, max_batch: usize, flush_every: Duration) {
        let mut running = self.running.subscribe();
        let mut ticker = tokio::time::interval(FLUSH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = stopped(&mut running) => {}
            }
            let current = self.is_current(generation);
            let due = {
                let mut buffer = self.deletes.lock().await;
                let elapsed = buffer.last_flush.elapsed() >= flush_every;
                if !buffer.pending.is_empty() && (!current || elapsed) {
                    Some(buffer.take())
                } else {
                    None
                }
            };
            if let Some(batch) = due {
                self.flush_deletes(batch, max_batch).await;
            }
            if !current {
                break;
            }
        }
    }
}

/// Resolves once the running flag is cleared.
async fn stopped(running: &mut watch::Receiver<bool>) {
    let _ = running.wait_for(|running| !*running).await;
}

type BatchResults<T> = HashMap<String, Result<T, BackendError>>;

fn split_batch<T>(
    outcome: Result<Vec<(String, Result<T, BackendError>)>, BackendError>,
) -> (BatchResults<T>, Option<BackendError>) {
    match outcome {
        Ok(results) => (results.into_iter().collect(), None),
        Err(e) => (HashMap::new(), Some(e)),
    }
}

/// Result for one entry; a batch-level failure fails every entry.
fn entry_outcome<T>(
    results: &mut BatchResults<T>,
    batch_error: Option<&BackendError>,
    entry_id: &str,
) -> Result<T, BackendError> {
    if let Some(e) = batch_error {
        return Err(e.clone());
    }
    results.remove(entry_id).unwrap_or_else(|| {
        Err(BackendError::UnexpectedResponse(format!(
            "no result for batch entry {entry_id}"
        )))
    })
}

#[async_trait]
impl<B: QueueBackend> Queue for ManagedQueue<B> {
    fn info(&self) -> &QueueInfo {
        &self.inner.info
    }

    fn state(&self) -> QueueState {
        self.inner.state()
    }

    fn attach(&self, observer: Arc<dyn QueueObserver>) -> bool {
        self.inner.observer.set(observer).is_ok()
    }

    fn supports_invisibility_timeout(&self) -> bool {
        self.inner.backend.supports_visibility()
    }

    async fn connect(&self) {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.state() != QueueState::Uninitialized {
            debug!(queue = %inner.label, "Queue already initialized");
            return;
        }

        inner.set_state(QueueState::Initializing);
        match inner.initialize().await {
            Ok(()) => {
                inner.set_state(QueueState::Ready);
                info!(queue = %inner.label, "Queue ready");
                inner.notify(|o| o.on_ready());
            }
            Err(error) => {
                inner.set_state(QueueState::Uninitialized);
                inner.report_error(error, None);
            }
        }
    }

    async fn start(&self) {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        match inner.state() {
            QueueState::Started => {
                debug!(queue = %inner.label, "Queue already started");
                return;
            }
            QueueState::Uninitialized | QueueState::Initializing => {
                inner.set_state(QueueState::Initializing);
                if let Err(error) = inner.initialize().await {
                    inner.set_state(QueueState::Uninitialized);
                    inner.report_error(error, None);
                    return;
                }
            }
            QueueState::Ready | QueueState::Stopped => {}
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.set_state(QueueState::Started);
        inner.running.send_replace(true);

        tokio::spawn(self.inner.clone().poll_loop(generation));
        if let DeletePolicy::Batched {
            max_batch,
            flush_every,
        } = inner.backend.delete_policy()
        {
            tokio::spawn(self.inner.clone().flush_loop(generation, max_batch, flush_every));
        }

        info!(queue = %inner.label, "Queue started");
        inner.notify(|o| o.on_started());
    }

    async fn stop(&self) {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.state() != QueueState::Started {
            debug!(queue = %inner.label, "Queue not started");
            return;
        }

        inner.set_state(QueueState::Stopped);
        inner.running.send_replace(false);
        info!(queue = %inner.label, "Queue stopped");
        inner.notify(|o| o.on_stopped());
    }

    async fn push(&self, message: Message) {
        self.inner.send_one(message, Duration::ZERO).await;
    }

    fn push_many(&self, messages: Vec<Message>) -> BrokerResult<()> {
        if self
            .inner
            .pushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::QueueAlreadyPushing(self.inner.info.job_type.clone()));
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let report = inner.store_many(messages).await;
            inner.pushing.store(false, Ordering::SeqCst);
            inner.notify(|o| o.on_push_many_result(report));
        });
        Ok(())
    }

    async fn schedule(&self, message: Message, delay: Duration) {
        self.inner.send_one(message, delay).await;
    }

    async fn delete_message(&self, message: Message) {
        self.inner.delete(message).await;
    }

    async fn set_invisibility_timeout(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> BrokerResult<()> {
        let inner = &self.inner;
        let not_supported = || BrokerError::QueueVisibilityNotSupported(inner.info.kind.to_string());
        if !inner.backend.supports_visibility() {
            return Err(not_supported());
        }
        if !inner.state().is_initialized() {
            return Err(BrokerError::QueueVisibilityNotInitialized);
        }
        let id = message
            .id
            .as_deref()
            .ok_or_else(|| BrokerError::QueueVisibility("message has no id".into()))?;

        inner
            .backend
            .change_visibility(id, message.receipt_handle.as_deref(), timeout)
            .await
            .map_err(|e| match e {
                BackendError::Unsupported(_) => not_supported(),
                other => BrokerError::QueueVisibility(other.to_string()),
            })
    }

    async fn ensure_empty(&self) {
        let inner = &self.inner;
        if !inner.state().is_initialized() {
            inner.report_error(BrokerError::QueueDropNotInitialized, None);
            return;
        }
        match inner.backend.purge().await {
            Ok(()) => {
                info!(queue = %inner.label, "Queue emptied");
                inner.notify(|o| o.on_emptied());
            }
            Err(e) => inner.report_error(
                BrokerError::QueueDrop {
                    queue: inner.info.name.clone(),
                    reason: e.to_string(),
                },
                None,
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::memory::{MemoryBackend, MemoryStore};
    use crate::queue::QueueKind;
    use crate::settings::QueueSettings;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Note {
        Push(Message, BrokerResult<()>),
        PushMany(PushManyReport),
        Delete(Message, BrokerResult<()>),
        Received(Message),
        Poison(Message),
        Error(BrokerError),
        Ready,
        Started,
        Stopped,
        Emptied,
    }

    /// Records notifications; optionally deletes received messages.
    struct Recorder {
        tx: mpsc::UnboundedSender<Note>,
        queue: OnceLock<Arc<dyn Queue>>,
        delete_on_receive: bool,
    }

    #[async_trait]
    impl QueueObserver for Recorder {
        fn on_push_result(&self, message: Message, result: BrokerResult<()>) {
            let _ = self.tx.send(Note::Push(message, result));
        }
        fn on_push_many_result(&self, report: PushManyReport) {
            let _ = self.tx.send(Note::PushMany(report));
        }
        fn on_delete_result(&self, message: Message, result: BrokerResult<()>) {
            let _ = self.tx.send(Note::Delete(message, result));
        }
        async fn on_message_received(&self, message: Message) {
            let _ = self.tx.send(Note::Received(message.clone()));
            if self.delete_on_receive {
                if let Some(queue) = self.queue.get() {
                    queue.delete_message(message).await;
                }
            }
        }
        fn on_poison(&self, message: Message) {
            let _ = self.tx.send(Note::Poison(message));
        }
        fn on_error(&self, error: BrokerError, _message: Option<Message>) {
            let _ = self.tx.send(Note::Error(error));
        }
        fn on_ready(&self) {
            let _ = self.tx.send(Note::Ready);
        }
        fn on_started(&self) {
            let _ = self.tx.send(Note::Started);
        }
        fn on_stopped(&self) {
            let _ = self.tx.send(Note::Stopped);
        }
        fn on_emptied(&self) {
            let _ = self.tx.send(Note::Emptied);
        }
    }

    fn info(max_dequeue_count: u32) -> QueueInfo {
        QueueInfo {
            worker_number: 1,
            job_type: "sendmsg".into(),
            kind: QueueKind::Memory,
            name: "jobs".into(),
            settings: QueueSettings {
                polling_interval: Duration::from_millis(100),
                invisibility_timeout: Duration::from_secs(1),
                max_dequeue_count,
            },
        }
    }

    fn managed<B: QueueBackend>(
        backend: B,
        max_dequeue_count: u32,
        delete_on_receive: bool,
    ) -> (Arc<dyn Queue>, mpsc::UnboundedReceiver<Note>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue: Arc<dyn Queue> = Arc::new(ManagedQueue::new(info(max_dequeue_count), backend));
        let recorder = Arc::new(Recorder {
            tx,
            queue: OnceLock::new(),
            delete_on_receive,
        });
        let _ = recorder.queue.set(queue.clone());
        assert!(queue.attach(recorder));
        (queue, rx)
    }

    fn memory(store: &Arc<MemoryStore>) -> MemoryBackend {
        MemoryBackend::new(store.clone(), "jobs", Duration::from_secs(1))
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Note>) -> Note {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Backend whose calls fail; `ensure_ok` lets initialization through.
    struct BrokenBackend {
        ensure_ok: bool,
    }

    #[async_trait]
    impl QueueBackend for BrokenBackend {
        fn kind(&self) -> QueueKind {
            QueueKind::Redis
        }
        async fn ensure_queue(&self) -> Result<bool, BackendError> {
            if self.ensure_ok {
                return Ok(false);
            }
            Err(BackendError::ListQueues("connection refused".into()))
        }
        async fn send(&self, _body: String, _delay: Duration) -> Result<String, BackendError> {
            Err(BackendError::Request("connection refused".into()))
        }
        async fn receive(&self, _max: usize, _wait: Duration) -> Result<Vec<Received>, BackendError> {
            Err(BackendError::Request("connection refused".into()))
        }
        async fn delete(&self, _id: &str, _rh: Option<&str>) -> Result<(), BackendError> {
            Err(BackendError::Request("connection refused".into()))
        }
        async fn purge(&self) -> Result<(), BackendError> {
            Err(BackendError::Request("connection refused".into()))
        }
    }

    /// Batching backend rejecting bodies that contain "reject".
    struct PickyBackend {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl QueueBackend for PickyBackend {
        fn kind(&self) -> QueueKind {
            QueueKind::Memory
        }
        async fn ensure_queue(&self) -> Result<bool, BackendError> {
            self.inner.ensure_queue().await
        }
        async fn send(&self, body: String, delay: Duration) -> Result<String, BackendError> {
            self.inner.send(body, delay).await
        }
        fn max_send_batch(&self) -> Option<usize> {
            Some(2)
        }
        async fn send_batch(
            &self,
            entries: Vec<SendEntry>,
        ) -> Result<Vec<(String, Result<String, BackendError>)>, BackendError> {
            let mut results = Vec::new();
            for entry in entries {
                if entry.body.contains("reject") {
                    results.push((entry.entry_id, Err(BackendError::Request("rejected".into()))));
                } else {
                    let id = self.inner.send(entry.body, Duration::ZERO).await?;
                    results.push((entry.entry_id, Ok(id)));
                }
            }
            Ok(results)
        }
        async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Received>, BackendError> {
            self.inner.receive(max, wait).await
        }
        async fn delete(&self, id: &str, rh: Option<&str>) -> Result<(), BackendError> {
            self.inner.delete(id, rh).await
        }
        async fn purge(&self) -> Result<(), BackendError> {
            self.inner.purge().await
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let store = MemoryStore::new();
        let (queue, mut rx) = managed(memory(&store), 5, false);

        queue.connect().await;
        queue.connect().await;

        assert!(matches!(next(&mut rx).await, Note::Ready));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.created_count(), 1);
        assert_eq!(queue.state(), QueueState::Ready);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_and_stays_uninitialized() {
        let (queue, mut rx) = managed(BrokenBackend { ensure_ok: false }, 5, false);
        queue.connect().await;

        match next(&mut rx).await {
            Note::Error(e) => assert_eq!(e.code(), "ERROR_LOADING_QUEUE_LIST"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.state(), QueueState::Uninitialized);
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let store = MemoryStore::new();
        let (queue, mut rx) = managed(memory(&store), 5, false);

        queue.push(Message::new("sendmsg", json!(1))).await;
        match next(&mut rx).await {
            Note::Push(_, Err(e)) => assert_eq!(e.code(), "PUSH_NOT_INITIALIZED"),
            other => panic!("unexpected {other:?}"),
        }

        let mut message = Message::new("sendmsg", json!(1));
        message.id = Some("x".into());
        queue.delete_message(message.clone()).await;
        match next(&mut rx).await {
            Note::Delete(_, Err(e)) => assert_eq!(e.code(), "DELETE_NOT_INITIALIZED"),
            other => panic!("unexpected {other:?}"),
        }

        let err = queue
            .set_invisibility_timeout(&message, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VISIBILITY_TIMEOUT_NOT_INITIALIZED");

        queue.ensure_empty().await;
        match next(&mut rx).await {
            Note::Error(e) => assert_eq!(e.code(), "QUEUE_DELETE_NOT_INITIALIZED"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_visibility_not_supported() {
        let (queue, _rx) = managed(BrokenBackend { ensure_ok: false }, 5, false);
        let err = queue
            .set_invisibility_timeout(&Message::new("sendmsg", json!(1)), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::QueueVisibilityNotSupported("redisqueue".into()));
    }

    #[tokio::test]
    async fn test_push_assigns_id() {
        let store = MemoryStore::new();
        let (queue, mut rx) = managed(memory(&store), 5, false);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));

        queue.push(Message::new("sendmsg", json!({ "n": 1 }))).await;
        match next(&mut rx).await {
            Note::Push(message, Ok(())) => assert!(message.id.is_some()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.message_count("jobs"), 1);
    }

    #[tokio::test]
    async fn test_push_many_guard_and_report() {
        let store = MemoryStore::new();
        let (queue, mut rx) = managed(memory(&store), 5, false);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));

        let batch = vec![
            Message::new("sendmsg", json!(1)),
            Message::new("sendmsg", json!(2)),
        ];
        queue.push_many(batch.clone()).unwrap();
        let err = queue.push_many(batch.clone()).unwrap_err();
        assert_eq!(err.code(), "BATCH_SENDING_IN_PROGRESS");

        let mut pushes = 0;
        let report = loop {
            match next(&mut rx).await {
                Note::Push(_, Ok(())) => pushes += 1,
                Note::PushMany(report) => break report,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(pushes, 2);
        assert_eq!(report.successes.len(), 2);
        assert!(report.failures.is_empty());

        // Flag is cleared once the report is out.
        queue.push_many(batch).unwrap();
    }

    #[tokio::test]
    async fn test_push_many_partial_failure() {
        let store = MemoryStore::new();
        let backend = PickyBackend { inner: memory(&store) };
        let (queue, mut rx) = managed(backend, 5, false);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));

        queue
            .push_many(vec![
                Message::new("sendmsg", json!("ok")),
                Message::new("sendmsg", json!("reject")),
                Message::new("sendmsg", json!("ok too")),
            ])
            .unwrap();

        let report = loop {
            if let Note::PushMany(report) = next(&mut rx).await {
                break report;
            }
        };
        assert_eq!(report.successes.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].message.payload, json!("reject"));
        assert_eq!(report.failures[0].error.code(), "PUSH_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_and_delete() {
        let store = MemoryStore::new();
        let (queue, mut rx) = managed(memory(&store), 5, true);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));
        queue.push(Message::new("SendMsg", json!({ "n": 1 }))).await;
        assert!(matches!(next(&mut rx).await, Note::Push(_, Ok(()))));

        queue.start().await;
        assert!(matches!(next(&mut rx).await, Note::Started));
        match next(&mut rx).await {
            Note::Received(message) => {
                assert_eq!(message.dequeue_count, 1);
                assert_eq!(message.payload, json!({ "n": 1 }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next(&mut rx).await, Note::Delete(_, Ok(()))));
        assert_eq!(store.message_count("jobs"), 0);

        queue.stop().await;
        assert!(matches!(next(&mut rx).await, Note::Stopped));
        queue.stop().await;
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_message_removed() {
        let store = MemoryStore::new();
        let (queue, mut rx) = managed(memory(&store), 1, false);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));
        queue.push(Message::new("sendmsg", json!(1))).await;
        assert!(matches!(next(&mut rx).await, Note::Push(_, Ok(()))));

        queue.start().await;
        assert!(matches!(next(&mut rx).await, Note::Started));
        // First delivery is processed but never deleted.
        assert!(matches!(next(&mut rx).await, Note::Received(_)));
        // Second delivery exceeds the limit.
        match next(&mut rx).await {
            Note::Poison(message) => assert_eq!(message.dequeue_count, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next(&mut rx).await, Note::Delete(_, Ok(()))));
        assert_eq!(store.message_count("jobs"), 0);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_job_type_ignored() {
        let store = MemoryStore::new();
        let producer = memory(&store);
        producer.ensure_queue().await.unwrap();
        producer
            .send(
                Message::new("other", json!(1)).to_body().unwrap(),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let (queue, mut rx) = managed(memory(&store), 5, true);
        queue.start().await;
        assert!(matches!(next(&mut rx).await, Note::Started));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(store.message_count("jobs"), 1);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_body_reported() {
        let store = MemoryStore::new();
        let producer = memory(&store);
        producer.ensure_queue().await.unwrap();
        producer.send("not json".into(), Duration::ZERO).await.unwrap();

        let (queue, mut rx) = managed(memory(&store), 5, true);
        queue.start().await;
        assert!(matches!(next(&mut rx).await, Note::Started));
        match next(&mut rx).await {
            Note::Error(e) => assert_eq!(e.code(), "MALFORMED_MESSAGE"),
            other => panic!("unexpected {other:?}"),
        }
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_backend_reports_error() {
        let (queue, mut rx) = managed(BrokenBackend { ensure_ok: false }, 5, false);
        queue.start().await;
        match next(&mut rx).await {
            Note::Error(e) => assert_eq!(e.code(), "ERROR_LOADING_QUEUE_LIST"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.state(), QueueState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_backs_off_and_retries() {
        let (queue, mut rx) = managed(BrokenBackend { ensure_ok: true }, 5, false);
        queue.start().await;
        assert!(matches!(next(&mut rx).await, Note::Started));

        let started = tokio::time::Instant::now();
        for _ in 0..2 {
            match next(&mut rx).await {
                Note::Error(e) => assert_eq!(e.code(), "ERROR_RECEIVING_MESSAGE"),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        queue.stop().await;
    }

    /// Long-polling backend whose receive returns at once, counting calls.
    struct EagerLongPoll {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl QueueBackend for EagerLongPoll {
        fn kind(&self) -> QueueKind {
            QueueKind::Sqs
        }
        fn long_polls(&self) -> bool {
            true
        }
        async fn ensure_queue(&self) -> Result<bool, BackendError> {
            Ok(false)
        }
        async fn send(&self, _body: String, _delay: Duration) -> Result<String, BackendError> {
            Ok("1".into())
        }
        async fn receive(&self, _max: usize, _wait: Duration) -> Result<Vec<Received>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn delete(&self, _id: &str, _rh: Option<&str>) -> Result<(), BackendError> {
            Ok(())
        }
        async fn purge(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_empty_long_poll_pauses() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (queue, mut rx) = managed(EagerLongPoll { calls: calls.clone() }, 5, false);
        queue.start().await;
        assert!(matches!(next(&mut rx).await, Note::Started));

        // 100ms polling interval: about ten receives per second, not thousands.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let seen = calls.load(Ordering::SeqCst);
        assert!((1..=12).contains(&seen), "{seen} receive calls");
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_deletes_flush_on_interval() {
        let store = MemoryStore::new();
        let backend = MemoryBackend::new(store.clone(), "jobs", Duration::from_secs(30))
            .with_batching(Duration::from_secs(2));
        let (queue, mut rx) = managed(backend, 5, true);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));
        queue.push(Message::new("sendmsg", json!(1))).await;
        assert!(matches!(next(&mut rx).await, Note::Push(_, Ok(()))));

        queue.start().await;
        assert!(matches!(next(&mut rx).await, Note::Started));
        assert!(matches!(next(&mut rx).await, Note::Received(_)));
        // Delete is buffered until the flusher runs.
        assert_eq!(store.message_count("jobs"), 1);
        assert!(matches!(next(&mut rx).await, Note::Delete(_, Ok(()))));
        assert_eq!(store.message_count("jobs"), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_batched_delete_when_not_started_flushes_immediately() {
        let store = MemoryStore::new();
        let backend = memory(&store).with_batching(Duration::from_secs(60));
        let (queue, mut rx) = managed(backend, 5, false);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));
        queue.push(Message::new("sendmsg", json!(1))).await;
        let Note::Push(message, Ok(())) = next(&mut rx).await else {
            panic!("push failed");
        };

        queue.delete_message(message).await;
        assert!(matches!(next(&mut rx).await, Note::Delete(_, Ok(()))));
        assert_eq!(store.message_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_ensure_empty() {
        let store = MemoryStore::new();
        let (queue, mut rx) = managed(memory(&store), 5, false);
        queue.connect().await;
        assert!(matches!(next(&mut rx).await, Note::Ready));
        queue.push(Message::new("sendmsg", json!(1))).await;
        assert!(matches!(next(&mut rx).await, Note::Push(_, Ok(()))));

        queue.ensure_empty().await;
        assert!(matches!(next(&mut rx).await, Note::Emptied));
        assert_eq!(store.message_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_attach_once() {
        let store = MemoryStore::new();
        let (queue, _rx) = managed(memory(&store), 5, false);
        let (tx, _) = mpsc::unbounded_channel();
        let second = Arc::new(Recorder {
            tx,
            queue: OnceLock::new(),
            delete_on_receive: false,
        });
        assert!(!queue.attach(second));
    }
}
