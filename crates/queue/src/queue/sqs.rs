//! Amazon SQS backend.
//!
//! Credentials come from a JSON file named by `aws-config-file`:
//! `{ "accessKeyId": "...", "secretAccessKey": "...", "region": "...", "endpoint": "..." }`
//! where `endpoint` is optional (for SQS-compatible services).

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
use aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, MessageSystemAttributeName, QueueAttributeName,
    SendMessageBatchRequestEntry,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::backend::{
    BackendError, DeleteEntry, DeletePolicy, EntryResult, QueueBackend, Received, SendEntry,
};
use super::QueueKind;
use crate::settings::{SettingsError, optional_u64, require_object, required_str};

/// Messages per SQS batch call.
const BATCH_SIZE: usize = 10;
/// Longest wait, in seconds, SQS accepts for a long poll.
const MAX_WAIT_SECONDS: u64 = 20;
/// Longest delivery delay, in seconds, SQS accepts.
const MAX_DELAY_SECONDS: u64 = 900;
/// Default `delete-frequency-seconds`.
const DEFAULT_DELETE_FREQUENCY: u64 = 10;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwsFile {
    access_key_id: String,
    secret_access_key: String,
    region: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
}

impl AwsFile {
    fn load(path: &str) -> Result<Self, SettingsError> {
        let invalid = |reason: String| {
            SettingsError::Invalid(format!("Error initialising AWS from '{path}': {reason}"))
        };
        let contents = std::fs::read_to_string(Path::new(path)).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))
    }
}

/// An SQS queue.
pub struct SqsBackend {
    client: aws_sdk_sqs::Client,
    name: String,
    invisibility_timeout: Duration,
    delete_every: Duration,
    queue_url: OnceLock<String>,
}

impl SqsBackend {
    /// Build from a `queue-settings` node.
    pub fn from_settings(
        settings: &Value,
        name: impl Into<String>,
        invisibility_timeout: Duration,
    ) -> Result<Self, SettingsError> {
        let settings = require_object(settings)?;
        let delete_every = optional_u64(settings, "delete-frequency-seconds")?
            .unwrap_or(DEFAULT_DELETE_FREQUENCY);
        let aws = AwsFile::load(required_str(settings, "aws-config-file")?)?;

        let credentials = Credentials::new(
            aws.access_key_id,
            aws.secret_access_key,
            aws.session_token,
            None,
            "jobbroker",
        );
        let mut config = aws_sdk_sqs::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(aws.region))
            .credentials_provider(credentials);
        if let Some(endpoint) = aws.endpoint {
            config = config.endpoint_url(endpoint);
        }

        Ok(Self {
            client: aws_sdk_sqs::Client::from_conf(config.build()),
            name: name.into(),
            invisibility_timeout,
            delete_every: Duration::from_secs(delete_every),
            queue_url: OnceLock::new(),
        })
    }

    fn url(&self) -> Result<&str, BackendError> {
        self.queue_url
            .get()
            .map(String::as_str)
            .ok_or_else(|| BackendError::Request(format!("queue [{}] has no url yet", self.name)))
    }
}

fn request_error<E: std::error::Error>(e: E) -> BackendError {
    BackendError::Request(DisplayErrorContext(e).to_string())
}

fn build_error(e: aws_sdk_sqs::error::BuildError) -> BackendError {
    BackendError::Request(e.to_string())
}

/// Rounds up to whole seconds; SQS takes no fractions.
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Long-poll wait in seconds, within `1..=20`.
fn wait_seconds(wait: Duration) -> i32 {
    whole_seconds(wait).clamp(1, MAX_WAIT_SECONDS) as i32
}

/// Delivery delay in seconds; SQS rejects anything past 15 minutes.
fn delay_seconds(delay: Duration) -> Result<i32, BackendError> {
    let seconds = whole_seconds(delay);
    if seconds > MAX_DELAY_SECONDS {
        return Err(BackendError::Request(format!(
            "delay of {seconds}s exceeds the SQS maximum of {MAX_DELAY_SECONDS}s"
        )));
    }
    Ok(seconds as i32)
}

/// `Ok` only when the lookup failed because the queue does not exist yet.
fn missing_queue(e: SdkError<GetQueueUrlError>) -> Result<(), BackendError> {
    if e.as_service_error()
        .is_some_and(GetQueueUrlError::is_queue_does_not_exist)
    {
        return Ok(());
    }
    Err(BackendError::ListQueues(DisplayErrorContext(e).to_string()))
}

#[async_trait]
impl QueueBackend for SqsBackend {
    fn kind(&self) -> QueueKind {
        QueueKind::Sqs
    }

    async fn ensure_queue(&self) -> Result<bool, BackendError> {
        match self.client.get_queue_url().queue_name(&self.name).send().await {
            Ok(existing) => {
                let url = existing
                    .queue_url()
                    .ok_or_else(|| BackendError::UnexpectedResponse("missing QueueUrl".into()))?;
                let _ = self.queue_url.set(url.to_string());
                return Ok(false);
            }
            Err(e) => missing_queue(e)?,
        }

        let created = self
            .client
            .create_queue()
            .queue_name(&self.name)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                self.invisibility_timeout.as_secs().to_string(),
            )
            .send()
            .await
            .map_err(|e| BackendError::CreateQueue(DisplayErrorContext(e).to_string()))?;
        let url = created
            .queue_url()
            .ok_or_else(|| BackendError::UnexpectedResponse("missing QueueUrl".into()))?;
        let _ = self.queue_url.set(url.to_string());
        Ok(true)
    }

    async fn send(&self, body: String, delay: Duration) -> Result<String, BackendError> {
        let delay = delay_seconds(delay)?;
        let sent = self
            .client
            .send_message()
            .queue_url(self.url()?)
            .message_body(body)
            .delay_seconds(delay)
            .send()
            .await
            .map_err(request_error)?;
        sent.message_id()
            .map(str::to_string)
            .ok_or_else(|| BackendError::UnexpectedResponse("missing MessageId".into()))
    }

    fn max_send_batch(&self) -> Option<usize> {
        Some(BATCH_SIZE)
    }

    async fn send_batch(
        &self,
        entries: Vec<SendEntry>,
    ) -> Result<Vec<EntryResult<String>>, BackendError> {
        let mut request = self.client.send_message_batch().queue_url(self.url()?);
        for entry in entries {
            request = request.entries(
                SendMessageBatchRequestEntry::builder()
                    .id(entry.entry_id)
                    .message_body(entry.body)
                    .build()
                    .map_err(build_error)?,
            );
        }
        let output = request.send().await.map_err(request_error)?;

        let mut results: Vec<EntryResult<String>> = output
            .successful()
            .iter()
            .map(|ok| (ok.id().to_string(), Ok(ok.message_id().to_string())))
            .collect();
        results.extend(output.failed().iter().map(|failed| {
            (
                failed.id().to_string(),
                Err(BackendError::Request(format!(
                    "{}: {}",
                    failed.code(),
                    failed.message().unwrap_or_default()
                ))),
            )
        }));
        Ok(results)
    }

    fn receive_batch_size(&self) -> usize {
        BATCH_SIZE
    }

    fn long_polls(&self) -> bool {
        true
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Received>, BackendError> {
        let output = self
            .client
            .receive_message()
            .queue_url(self.url()?)
            .max_number_of_messages(max.min(BATCH_SIZE) as i32)
            .wait_time_seconds(wait_seconds(wait))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(request_error)?;

        let mut received = Vec::new();
        for message in output.messages() {
            let Some(id) = message.message_id() else {
                debug!(queue = %self.name, "Skipping message without id");
                continue;
            };
            let receive_count = message
                .attributes()
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|count| count.parse().ok())
                .unwrap_or(1);
            received.push(Received {
                id: id.to_string(),
                body: message.body().unwrap_or_default().to_string(),
                receive_count,
                receipt_handle: message.receipt_handle().map(str::to_string),
            });
        }
        Ok(received)
    }

    fn delete_policy(&self) -> DeletePolicy {
        DeletePolicy::Batched {
            max_batch: BATCH_SIZE,
            flush_every: self.delete_every,
        }
    }

    async fn delete(
        &self,
        message_id: &str,
        receipt_handle: Option<&str>,
    ) -> Result<(), BackendError> {
        let receipt_handle = receipt_handle
            .ok_or_else(|| BackendError::MessageNotFound(message_id.to_string()))?;
        self.client
            .delete_message()
            .queue_url(self.url()?)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(request_error)?;
        Ok(())
    }

    async fn delete_batch(
        &self,
        entries: Vec<DeleteEntry>,
    ) -> Result<Vec<EntryResult<()>>, BackendError> {
        let mut request = self.client.delete_message_batch().queue_url(self.url()?);
        for entry in entries {
            request = request.entries(
                DeleteMessageBatchRequestEntry::builder()
                    .id(entry.entry_id)
                    .receipt_handle(entry.receipt_handle.unwrap_or_default())
                    .build()
                    .map_err(build_error)?,
            );
        }
        let output = request.send().await.map_err(request_error)?;

        let mut results: Vec<EntryResult<()>> = output
            .successful()
            .iter()
            .map(|ok| (ok.id().to_string(), Ok(())))
            .collect();
        results.extend(output.failed().iter().map(|failed| {
            (
                failed.id().to_string(),
                Err(BackendError::Request(format!(
                    "{}: {}",
                    failed.code(),
                    failed.message().unwrap_or_default()
                ))),
            )
        }));
        Ok(results)
    }

    fn supports_visibility(&self) -> bool {
        true
    }

    async fn change_visibility(
        &self,
        message_id: &str,
        receipt_handle: Option<&str>,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let receipt_handle = receipt_handle
            .ok_or_else(|| BackendError::MessageNotFound(message_id.to_string()))?;
        self.client
            .change_message_visibility()
            .queue_url(self.url()?)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout.as_secs() as i32)
            .send()
            .await
            .map_err(request_error)?;
        Ok(())
    }

    async fn purge(&self) -> Result<(), BackendError> {
        self.client
            .purge_queue()
            .queue_url(self.url()?)
            .send()
            .await
            .map_err(request_error)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_config_file() {
        let err = SqsBackend::from_settings(
            &json!({ "polling-interval": 20000, "invisibility-timeout": 30 }),
            "jobs",
            Duration::from_secs(30),
        )
        .err()
        .unwrap();
        assert_eq!(err, SettingsError::MissingField("aws-config-file"));
    }

    #[test]
    fn test_unreadable_config_file() {
        let err = SqsBackend::from_settings(
            &json!({ "aws-config-file": "/definitely/not/here.json" }),
            "jobs",
            Duration::from_secs(30),
        )
        .err()
        .unwrap();
        assert!(err.to_string().starts_with("Error initialising AWS"));
    }

    #[test]
    fn test_config_file_and_defaults() {
        let path = std::env::temp_dir().join(format!("jobbroker-aws-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "accessKeyId": "key", "secretAccessKey": "secret", "region": "us-east-1", "endpoint": "http://localhost:9324" }"#,
        )
        .unwrap();

        let backend = SqsBackend::from_settings(
            &json!({ "aws-config-file": path.to_str().unwrap() }),
            "jobs",
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(
            backend.delete_policy(),
            DeletePolicy::Batched {
                max_batch: 10,
                flush_every: Duration::from_secs(10)
            }
        );
        assert_eq!(backend.max_send_batch(), Some(10));
        assert!(backend.long_polls());
    }

    #[test]
    fn test_wait_rounds_up_within_limits() {
        assert_eq!(wait_seconds(Duration::ZERO), 1);
        assert_eq!(wait_seconds(Duration::from_millis(100)), 1);
        assert_eq!(wait_seconds(Duration::from_millis(2500)), 3);
        assert_eq!(wait_seconds(Duration::from_secs(20)), 20);
        assert_eq!(wait_seconds(Duration::from_secs(60)), 20);
    }

    #[test]
    fn test_delay_rounds_up_and_rejects_overlong() {
        assert_eq!(delay_seconds(Duration::ZERO), Ok(0));
        assert_eq!(delay_seconds(Duration::from_millis(1)), Ok(1));
        assert_eq!(delay_seconds(Duration::from_secs(900)), Ok(900));

        let err = delay_seconds(Duration::from_secs(901)).unwrap_err();
        assert_eq!(
            err,
            BackendError::Request("delay of 901s exceeds the SQS maximum of 900s".into())
        );
    }

    #[test]
    fn test_failed_lookup_is_not_a_missing_queue() {
        let err = missing_queue(SdkError::construction_failure("no endpoint")).unwrap_err();
        assert!(matches!(err, BackendError::ListQueues(_)));
    }
}
