//! Common types shared by the jobbroker crates.
//!
//! - **Error handling**: the closed error taxonomy [`BrokerError`] with stable
//!   categories and codes
//! - **Configuration**: the broker definition file ([`BrokerFile`]) and process
//!   settings ([`AppConfig`])
//! - **ID Generation**: message ids via [`IdGenerator`]

pub mod config;
pub mod error;
pub mod id;

pub use config::{AppConfig, BrokerFile, QueueNode, WorkerEntry, WorkerNode};
pub use error::{BrokerError, BrokerResult, ErrorCategory};
pub use id::IdGenerator;
