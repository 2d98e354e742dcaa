//! Redis backend using the RSMQ data layout.
//!
//! Keys, for namespace `ns` and queue `q`:
//!
//! - `ns:QUEUES`: set of queue names
//! - `ns:q`: sorted set of message ids scored by the time (ms) they become visible
//! - `ns:q:Q`: hash holding queue attributes, message bodies, and per message
//!   `id:rc` (receive count) and `id:fr` (first receive time)
//!
//! Every multi-key operation runs as a Lua script so it is atomic on the server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fred::clients::Client;
use fred::interfaces::{ClientLike, LuaInterface, SetsInterface};
use fred::types::config::Config as RedisConfig;
use jobbroker_common::IdGenerator;
use serde_json::Value;
use tracing::info;

use super::backend::{BackendError, QueueBackend, Received};
use super::QueueKind;
use crate::settings::{SettingsError, require_object, required_str, required_u64};

const CREATE_QUEUE: &str = r#"
if redis.call("HSETNX", KEYS[1], "vt", ARGV[1]) == 0 then
    return 0
end
redis.call("HSET", KEYS[1], "delay", 0, "maxsize", 65536, "created", ARGV[2], "modified", ARGV[2])
redis.call("SADD", KEYS[2], ARGV[3])
return 1
"#;

const SEND_MESSAGE: &str = r#"
redis.call("ZADD", KEYS[1], ARGV[3], ARGV[1])
redis.call("HSET", KEYS[2], ARGV[1], ARGV[2])
redis.call("HINCRBY", KEYS[2], "totalsent", 1)
return 1
"#;

const RECEIVE_MESSAGE: &str = r#"
local msg = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", "0", "1")
if #msg == 0 then
    return {}
end
redis.call("ZADD", KEYS[1], ARGV[2], msg[1])
redis.call("HINCRBY", KEYS[2], "totalrecv", 1)
local body = redis.call("HGET", KEYS[2], msg[1])
local rc = redis.call("HINCRBY", KEYS[2], msg[1] .. ":rc", 1)
if rc == 1 then
    redis.call("HSET", KEYS[2], msg[1] .. ":fr", ARGV[1])
end
if not body then
    body = ""
end
return {msg[1], body, tostring(rc)}
"#;

const DELETE_MESSAGE: &str = r#"
local removed = redis.call("ZREM", KEYS[1], ARGV[1])
redis.call("HDEL", KEYS[2], ARGV[1], ARGV[1] .. ":rc", ARGV[1] .. ":fr")
return removed
"#;

const CHANGE_VISIBILITY: &str = r#"
if redis.call("ZSCORE", KEYS[1], ARGV[1]) == false then
    return 0
end
redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
return 1
"#;

const PURGE_QUEUE: &str = r#"
local ids = redis.call("ZRANGE", KEYS[1], 0, -1)
for _, id in ipairs(ids) do
    redis.call("HDEL", KEYS[2], id, id .. ":rc", id .. ":fr")
end
redis.call("DEL", KEYS[1])
return #ids
"#;

/// Redis connection settings taken from `queue-settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Key namespace.
    pub ns: String,
}

impl RedisSettings {
    /// Parse `host`, `port` and `ns`.
    pub fn from_value(settings: &Value) -> Result<Self, SettingsError> {
        let settings = require_object(settings)?;
        let host = required_str(settings, "host")?.to_string();
        let port = u16::try_from(required_u64(settings, "port")?)
            .map_err(|_| SettingsError::NotInteger("port"))?;
        let ns = required_str(settings, "ns")?.to_string();
        Ok(Self { host, port, ns })
    }

    /// Connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// An RSMQ queue on a Redis server.
pub struct RedisBackend {
    client: Client,
    name: String,
    ns: String,
    invisibility_timeout: Duration,
    ids: IdGenerator,
}

impl RedisBackend {
    /// Build a backend; the connection is opened on first use.
    pub fn new(
        settings: &RedisSettings,
        name: impl Into<String>,
        invisibility_timeout: Duration,
    ) -> Result<Self, SettingsError> {
        let config = RedisConfig::from_url(&settings.url())
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        Ok(Self {
            client: Client::new(config, None, None, None),
            name: name.into(),
            ns: settings.ns.clone(),
            invisibility_timeout,
            ids: IdGenerator::new(),
        })
    }

    fn queues_key(&self) -> String {
        format!("{}:QUEUES", self.ns)
    }

    fn messages_key(&self) -> String {
        format!("{}:{}", self.ns, self.name)
    }

    fn attributes_key(&self) -> String {
        format!("{}:{}:Q", self.ns, self.name)
    }

    fn queue_keys(&self) -> Vec<String> {
        vec![self.messages_key(), self.attributes_key()]
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn after_ms(duration: Duration) -> String {
        (Self::now_ms() + duration.as_millis() as i64).to_string()
    }

    async fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.client.is_connected() {
            return Ok(());
        }
        self.client
            .init()
            .await
            .map_err(|e| BackendError::ListQueues(e.to_string()))?;
        info!(namespace = %self.ns, "Connected to Redis");
        Ok(())
    }
}

fn request_error(e: fred::error::Error) -> BackendError {
    BackendError::Request(e.to_string())
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn kind(&self) -> QueueKind {
        QueueKind::Redis
    }

    async fn ensure_queue(&self) -> Result<bool, BackendError> {
        self.ensure_connected().await?;

        let existing: Vec<String> = self
            .client
            .smembers(self.queues_key())
            .await
            .map_err(|e| BackendError::ListQueues(e.to_string()))?;
        if existing.iter().any(|name| name == &self.name) {
            return Ok(false);
        }

        let created: i64 = self
            .client
            .eval(
                CREATE_QUEUE,
                vec![self.attributes_key(), self.queues_key()],
                vec![
                    self.invisibility_timeout.as_secs().to_string(),
                    Self::now_ms().to_string(),
                    self.name.clone(),
                ],
            )
            .await
            .map_err(|e| BackendError::CreateQueue(e.to_string()))?;
        match created {
            1 => Ok(true),
            other => Err(BackendError::UnexpectedResponse(other.to_string())),
        }
    }

    async fn send(&self, body: String, delay: Duration) -> Result<String, BackendError> {
        let id = self.ids.message_id();
        let _: i64 = self
            .client
            .eval(
                SEND_MESSAGE,
                self.queue_keys(),
                vec![id.clone(), body, Self::after_ms(delay)],
            )
            .await
            .map_err(request_error)?;
        Ok(id)
    }

    async fn receive(&self, _max: usize, _wait: Duration) -> Result<Vec<Received>, BackendError> {
        let reply: Vec<String> = self
            .client
            .eval(
                RECEIVE_MESSAGE,
                self.queue_keys(),
                vec![Self::now_ms().to_string(), Self::after_ms(self.invisibility_timeout)],
            )
            .await
            .map_err(request_error)?;

        match reply.as_slice() {
            [] => Ok(Vec::new()),
            [id, body, count] => {
                let receive_count = count
                    .parse()
                    .map_err(|_| BackendError::UnexpectedResponse(format!("receive count {count}")))?;
                Ok(vec![Received {
                    id: id.clone(),
                    body: body.clone(),
                    receive_count,
                    receipt_handle: None,
                }])
            }
            other => Err(BackendError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn delete(
        &self,
        message_id: &str,
        _receipt_handle: Option<&str>,
    ) -> Result<(), BackendError> {
        let removed: i64 = self
            .client
            .eval(DELETE_MESSAGE, self.queue_keys(), vec![message_id.to_string()])
            .await
            .map_err(request_error)?;
        if removed == 1 {
            Ok(())
        } else {
            Err(BackendError::MessageNotFound(message_id.to_string()))
        }
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
        let changed: i64 = self
            .client
            .eval(
                CHANGE_VISIBILITY,
                vec![self.messages_key()],
                vec![message_id.to_string(), Self::after_ms(timeout)],
            )
            .await
            .map_err(request_error)?;
        if changed == 1 {
            Ok(())
        } else {
            Err(BackendError::MessageNotFound(message_id.to_string()))
        }
    }

    async fn purge(&self) -> Result<(), BackendError> {
        let _: i64 = self
            .client
            .eval(PURGE_QUEUE, self.queue_keys(), Vec::<String>::new())
            .await
            .map_err(request_error)?;
        Ok(())
    }
}
