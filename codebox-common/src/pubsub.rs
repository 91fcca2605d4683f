//! Realtime fan-out. The engine publishes to exactly three channels; realtime
//! consumers (the WebSocket relay, dashboards) subscribe on their own
//! connections. Nothing in the engine holds a reference to any transport
//! other than the [`PubSubClient`] trait.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{JobStatus, StreamKind};

pub const STATUS_CHANNEL: &str = "job:status";
pub const LOGS_CHANNEL: &str = "job:logs";
pub const METRICS_CHANNEL: &str = "system:metrics";

/// How long a publish may stall before we give up. Log streaming must not
/// block on a slow pub/sub broker.
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("timed out publishing to {0}")]
    Timeout(String),
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<redis::RedisError> for PubSubError {
    fn from(err: redis::RedisError) -> Self {
        PubSubError::Redis(err.to_string())
    }
}

#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError>;
}

/// A status transition event on `job:status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(job_id: Uuid, status: JobStatus, data: Option<serde_json::Value>) -> Self {
        Self {
            job_id,
            status,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// A log chunk event on `job:logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub job_id: Uuid,
    pub kind: StreamKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(job_id: Uuid, kind: StreamKind, data: String) -> Self {
        Self {
            job_id,
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Serialize and publish one event, bounded by the publish timeout.
pub async fn publish_event<T: Serialize + Sync>(
    client: &dyn PubSubClient,
    channel: &str,
    event: &T,
) -> Result<(), PubSubError> {
    let payload = serde_json::to_string(event)?;
    client.publish(channel, payload).await
}

#[derive(Clone)]
pub struct RedisPubSub {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisPubSub {
    pub async fn new(addr: String) -> Result<RedisPubSub, PubSubError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(RedisPubSub { connection })
    }
}

#[async_trait]
impl PubSubClient for RedisPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError> {
        let mut conn = self.connection.clone();
        tokio::time::timeout(PUBLISH_TIMEOUT, conn.publish::<_, _, ()>(channel, payload))
            .await
            .map_err(|_| PubSubError::Timeout(channel.to_owned()))??;

        Ok(())
    }
}

/// In-memory pub/sub for tests: records everything published, optionally
/// failing every publish to exercise degradation paths.
#[derive(Clone, Default)]
pub struct MockPubSub {
    published: Arc<Mutex<Vec<(String, String)>>>,
    fail_publishes: Arc<Mutex<bool>>,
}

impl MockPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        *self.lock_flag() = fail;
    }

    /// All payloads published on a channel, in order.
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.lock_published()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn lock_published(&self) -> std::sync::MutexGuard<'_, Vec<(String, String)>> {
        match self.published.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_flag(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.fail_publishes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PubSubClient for MockPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError> {
        if *self.lock_flag() {
            return Err(PubSubError::Redis("injected failure".to_owned()));
        }
        self.lock_published().push((channel.to_owned(), payload));
        Ok(())
    }
}
