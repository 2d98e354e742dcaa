//! Turns module names from the broker definition into workers and queues.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use jobbroker_common::{BrokerError, BrokerResult};
use serde_json::Value;

use crate::message::normalize_job_type;
use crate::queue::{
    ManagedQueue, MemoryBackend, MemoryStore, QueueHandle, QueueInfo, QueueKind, RedisBackend,
    redis::RedisSettings,
};
use crate::settings::QueueSettings;
use crate::worker::{ConsoleSettingsWorker, NoWorker, Worker};

/// Error a worker factory returns when its settings are unusable.
pub type FactoryError = Box<dyn std::error::Error + Send + Sync>;

/// Builds an initialized worker from its `worker-settings`.
pub type WorkerFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Worker>, FactoryError> + Send + Sync>;

/// The `queue` node of one entry, after presence checks.
#[derive(Debug, Clone, Copy)]
pub struct QueueDefinition<'a> {
    /// 1-based entry index.
    pub worker_number: usize,
    pub job_type: &'a str,
    /// `queue-module`.
    pub module: &'a str,
    /// `queue-name`.
    pub name: &'a str,
    /// `queue-settings`.
    pub settings: &'a Value,
}

/// Known worker modules plus the stores queues are built on.
#[derive(Clone)]
pub struct Registry {
    workers: HashMap<String, WorkerFactory>,
    memory: Arc<MemoryStore>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<&String> = self.workers.keys().collect();
        modules.sort();
        f.debug_struct("Registry").field("workers", &modules).finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn no_worker(_settings: &Value) -> Result<Arc<dyn Worker>, FactoryError> {
    Ok(Arc::new(NoWorker))
}

fn console_settings(settings: &Value) -> Result<Arc<dyn Worker>, FactoryError> {
    Ok(Arc::new(ConsoleSettingsWorker::from_settings(settings)?))
}

impl Registry {
    /// Registry with the built-in workers.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .register_worker(NoWorker::NAME, no_worker)
            .register_worker(ConsoleSettingsWorker::NAME, console_settings);
        registry
    }

    /// Registry without any worker.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            workers: HashMap::new(),
            memory: MemoryStore::shared(),
        }
    }

    /// Build `memoryqueue` queues on `store` instead of the process-wide one.
    #[must_use]
    pub fn with_memory_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.memory = store;
        self
    }

    /// Make a worker module available to broker definitions.
    pub fn register_worker<F>(&mut self, module: &str, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Worker>, FactoryError> + Send + Sync + 'static,
    {
        self.workers
            .insert(module.trim().to_lowercase(), Arc::new(factory));
        self
    }

    /// Whether a worker module is known.
    #[must_use]
    pub fn has_worker(&self, module: &str) -> bool {
        self.workers.contains_key(&module.trim().to_lowercase())
    }

    /// Build and initialize a worker.
    pub fn create_worker(&self, module: &str, settings: &Value) -> BrokerResult<Arc<dyn Worker>> {
        let factory = self
            .workers
            .get(&module.trim().to_lowercase())
            .ok_or_else(|| BrokerError::ConfigUnableToLoadWorkerModule(module.to_string()))?;

        match catch_unwind(AssertUnwindSafe(|| factory(settings))) {
            Ok(Ok(worker)) => Ok(worker),
            Ok(Err(e)) => Err(BrokerError::ConfigUnableToInitializeWorkerModule {
                module: module.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(BrokerError::ConfigUnknown(format!(
                "worker module [{module}] panicked during initialization"
            ))),
        }
    }

    /// Build a queue; its settings are validated now, the backend is contacted on connect.
    pub fn create_queue(&self, definition: QueueDefinition<'_>) -> BrokerResult<QueueHandle> {
        let module = definition.module;
        let kind: QueueKind = module
            .parse()
            .map_err(|_| BrokerError::ConfigUnableToLoadQueueModule(module.to_string()))?;
        if kind == QueueKind::Sqs && !cfg!(feature = "sqs") {
            return Err(BrokerError::ConfigUnableToLoadQueueModule(module.to_string()));
        }

        let init_error = |reason: String| BrokerError::ConfigUnableToInitializeQueueModule {
            module: module.to_string(),
            reason,
        };
        let settings =
            QueueSettings::from_value(definition.settings).map_err(|e| init_error(e.to_string()))?;
        let name = definition.name.trim().to_lowercase();
        let info = QueueInfo {
            worker_number: definition.worker_number,
            job_type: normalize_job_type(definition.job_type),
            kind,
            name: name.clone(),
            settings,
        };

        let queue: QueueHandle = match kind {
            QueueKind::Memory => {
                let backend = MemoryBackend::from_settings(
                    self.memory.clone(),
                    name,
                    definition.settings,
                    settings.invisibility_timeout,
                )
                .map_err(|e| init_error(e.to_string()))?;
                Arc::new(ManagedQueue::new(info, backend))
            }
            QueueKind::Redis => {
                let redis = RedisSettings::from_value(definition.settings)
                    .map_err(|e| init_error(e.to_string()))?;
                let backend = RedisBackend::new(&redis, name, settings.invisibility_timeout)
                    .map_err(|e| init_error(e.to_string()))?;
                Arc::new(ManagedQueue::new(info, backend))
            }
            #[cfg(feature = "sqs")]
            QueueKind::Sqs => {
                let backend = crate::queue::SqsBackend::from_settings(
                    definition.settings,
                    name,
                    settings.invisibility_timeout,
                )
                .map_err(|e| init_error(e.to_string()))?;
                Arc::new(ManagedQueue::new(info, backend))
            }
            #[cfg(not(feature = "sqs"))]
            QueueKind::Sqs => {
                return Err(BrokerError::ConfigUnableToLoadQueueModule(module.to_string()));
            }
        };
        Ok(queue)
    }
}
