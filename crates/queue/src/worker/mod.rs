//! Workers: user code that processes one message at a time.

mod builtin;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use jobbroker_common::{BrokerError, BrokerResult};

use crate::message::Message;
use crate::queue::QueueHandle;

pub use builtin::{ConsoleSettingsWorker, NoWorker};

/// Identity of a registered worker, carried in event metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerInfo {
    /// 1-based index of the entry in the broker definition.
    pub number: usize,
    /// Worker module name.
    pub module: String,
}

/// What a worker can reach while processing a message.
#[derive(Debug, Clone)]
pub struct WorkContext {
    queue: QueueHandle,
    worker: WorkerInfo,
}

impl WorkContext {
    pub(crate) fn new(queue: QueueHandle, worker: WorkerInfo) -> Self {
        Self { queue, worker }
    }

    /// The queue the message came from.
    #[must_use]
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Identity of the worker being run.
    #[must_use]
    pub const fn worker(&self) -> &WorkerInfo {
        &self.worker
    }

    /// Keep the message hidden for `timeout` from now, e.g. for long running work.
    pub async fn set_invisibility_timeout(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> BrokerResult<()> {
        self.queue.set_invisibility_timeout(message, timeout).await
    }
}

/// Processes messages of one job type.
///
/// Returning `Ok` marks the message done and it is deleted from its queue.
/// Returning `Err` (or panicking) leaves it on the queue to be redelivered
/// after the invisibility timeout.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Module name, used in event metadata and logs.
    fn name(&self) -> &str;

    /// Process one message.
    async fn work(&self, message: &Message, ctx: &WorkContext) -> BrokerResult<()>;
}

/// Run a worker, turning a panic into `UnexpectedWorker`.
pub(crate) async fn process(
    worker: &dyn Worker,
    message: &Message,
    ctx: &WorkContext,
) -> BrokerResult<()> {
    match AssertUnwindSafe(worker.work(message, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(BrokerError::UnexpectedWorker(panic_reason(panic.as_ref()))),
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        (*reason).to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "worker panicked".to_string()
    }
}
