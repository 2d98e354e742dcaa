//! Workers shipped with the broker.

use async_trait::async_trait;
use jobbroker_common::BrokerResult;
use serde_json::Value;
use tracing::info;

use super::{WorkContext, Worker};
use crate::message::Message;
use crate::settings::{SettingsError, require_object, required_str};

/// Accepts every message without doing anything.
///
/// Meant for producer-only processes: they must declare a worker for each
/// job type they push, but the consuming happens elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWorker;

impl NoWorker {
    /// Module name.
    pub const NAME: &'static str = "noworker";
}

#[async_trait]
impl Worker for NoWorker {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn work(&self, _message: &Message, _ctx: &WorkContext) -> BrokerResult<()> {
        Ok(())
    }
}

/// Logs every message it receives. Requires a `name` setting.
#[derive(Debug, Clone)]
pub struct ConsoleSettingsWorker {
    label: String,
}

impl ConsoleSettingsWorker {
    /// Module name.
    pub const NAME: &'static str = "console-settings";

    /// Build from `worker-settings`.
    pub fn from_settings(settings: &Value) -> Result<Self, SettingsError> {
        let settings = require_object(settings)?;
        let label = required_str(settings, "name")
            .map_err(|_| SettingsError::Invalid("This module requires name to be defined".into()))?;
        Ok(Self {
            label: label.to_string(),
        })
    }
}

#[async_trait]
impl Worker for ConsoleSettingsWorker {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn work(&self, message: &Message, ctx: &WorkContext) -> BrokerResult<()> {
        info!(
            worker = %self.label,
            queue = %ctx.queue().info().name,
            id = ?message.id,
            job_type = %message.job_type,
            payload = %message.payload,
            "Worker says"
        );
        Ok(())
    }
}
