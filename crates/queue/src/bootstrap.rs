//! Builds a [`Broker`] from a broker definition file.
//!
//! Checks run in a fixed order and loading stops at the first failure, so a
//! broken file always yields the same error.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use jobbroker_common::config::non_blank;
use jobbroker_common::{BrokerError, BrokerFile, BrokerResult};
use regex::Regex;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerBuilder};
use crate::queue::QueueKind;
use crate::registry::{QueueDefinition, Registry};

static QUEUE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]{1,15}$").expect("queue name pattern is valid")
});

/// Whether `name` is a usable queue name.
#[must_use]
pub fn is_valid_queue_name(name: &str) -> bool {
    QUEUE_NAME.is_match(name)
}

/// Load a broker definition file and register every entry.
pub fn load<P: AsRef<Path>>(path: P, registry: &Registry) -> BrokerResult<Broker> {
    load_with(path, registry, BrokerBuilder::new())
}

/// Like [`load`], registering into a caller-supplied builder (e.g. one with a
/// custom event capacity, or one already subscribed to).
pub fn load_with<P: AsRef<Path>>(
    path: P,
    registry: &Registry,
    builder: BrokerBuilder,
) -> BrokerResult<Broker> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Loading broker definition");
    let file = BrokerFile::from_file(path)?;
    let broker = from_definition(&file, registry, builder)?;
    info!(
        path = %path.display(),
        queues = broker.queues().len(),
        "Broker definition loaded"
    );
    Ok(broker)
}

/// Register every entry of an already parsed definition.
pub fn from_definition(
    file: &BrokerFile,
    registry: &Registry,
    mut builder: BrokerBuilder,
) -> BrokerResult<Broker> {
    let entries = file.workers.as_ref().ok_or(BrokerError::ConfigNoWorkersArray)?;
    if entries.is_empty() {
        return Err(BrokerError::ConfigWorkersArrayEmpty);
    }

    let mut defined: HashSet<(QueueKind, String)> = HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        let number = index + 1;

        let job_type =
            non_blank(entry.job_type.as_ref()).ok_or(BrokerError::ConfigJobTypeMissing(number))?;

        let worker_node = entry
            .worker
            .as_ref()
            .ok_or(BrokerError::ConfigWorkerNodeMissing(number))?;
        let worker_module = non_blank(worker_node.module.as_ref())
            .ok_or(BrokerError::ConfigWorkerModuleMissing(number))?;
        let worker = registry.create_worker(worker_module, &worker_node.settings)?;

        let queue_node = entry
            .queue
            .as_ref()
            .ok_or(BrokerError::ConfigQueueNodeMissing(number))?;
        let queue_module = non_blank(queue_node.module.as_ref())
            .ok_or(BrokerError::ConfigQueueModuleMissing(number))?;
        let queue_name = non_blank(queue_node.name.as_ref())
            .ok_or(BrokerError::ConfigQueueNameMissing(number))?;
        if !is_valid_queue_name(queue_name) {
            return Err(BrokerError::ConfigInvalidQueueName(queue_name.to_string()));
        }

        let queue = registry.create_queue(QueueDefinition {
            worker_number: number,
            job_type,
            module: queue_module,
            name: queue_name,
            settings: &queue_node.settings,
        })?;

        let key = (queue.info().kind, queue.info().name.clone());
        if !defined.insert(key) {
            return Err(BrokerError::ConfigQueueDefinedTwice {
                module: queue_module.to_string(),
                name: queue_name.to_string(),
            });
        }

        builder.register(job_type, worker, queue)?;
    }

    Ok(builder.build())
}
