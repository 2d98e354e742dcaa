//! Job broker: routes typed messages to queues and runs workers on them.
//!
//! - **Broker**: job-type routing table, lifecycle aggregation, event stream
//! - **Queues**: one engine (polling, poison detection, batching) over
//!   pluggable backends: in-memory, Redis (RSMQ layout), SQS (`sqs` feature)
//! - **Workers**: user code behind a panic boundary
//! - **Bootstrap**: building a broker from a JSON definition file

pub mod bootstrap;
pub mod broker;
pub mod events;
pub mod message;
pub mod queue;
pub mod registry;
pub mod settings;
pub mod worker;

pub use bootstrap::{load, load_with};
pub use broker::{Broker, BrokerBuilder, MAX_PUSH_MANY};
pub use events::{BrokerEvent, EventMeta};
pub use message::{Message, PushFailure, PushManyReport};
pub use queue::{
    ManagedQueue, MemoryStore, Queue, QueueHandle, QueueInfo, QueueKind, QueueObserver, QueueState,
};
pub use registry::{FactoryError, Registry, WorkerFactory};
pub use settings::{QueueSettings, SettingsError};
pub use worker::{ConsoleSettingsWorker, NoWorker, WorkContext, Worker, WorkerInfo};

pub use jobbroker_common::{BrokerError, BrokerResult, ErrorCategory};
