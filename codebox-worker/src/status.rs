//! Single-consumer pipeline serializing status writes per job.
//!
//! Workers publish transitions into an mpsc channel; one consumer applies
//! them to the durable store in order and republishes on the realtime status
//! channel. Keeping the store write off the worker's hot path means a slow
//! database never stalls container supervision.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use codebox_common::job::JobStatus;
use codebox_common::pubsub::{publish_event, PubSubClient, StatusEvent, STATUS_CHANNEL};
use codebox_common::store::{JobStore, StatusFields};

const CHANNEL_CAPACITY: usize = 256;

/// A terminal transition must not be lost to a transient database outage, so
/// writes are retried with backoff before we give up and let the queue's
/// visibility timeout redeliver the claim.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug)]
struct StatusMessage {
    job_id: Uuid,
    status: JobStatus,
    fields: StatusFields,
}

/// Cloneable producer half of the pipeline.
#[derive(Clone)]
pub struct StatusPipeline {
    sender: mpsc::Sender<StatusMessage>,
}

impl StatusPipeline {
    /// Start the consumer task. The pipeline drains and stops once every
    /// producer clone has been dropped.
    pub fn start(
        store: Arc<dyn JobStore>,
        pubsub: Arc<dyn PubSubClient>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run_consumer(receiver, store, pubsub));

        (Self { sender }, handle)
    }

    /// Queue a status transition. Awaits only for channel capacity, never for
    /// the database.
    pub async fn publish(&self, job_id: Uuid, status: JobStatus, fields: StatusFields) {
        let message = StatusMessage {
            job_id,
            status,
            fields,
        };
        if self.sender.send(message).await.is_err() {
            error!(job_id = %job_id, status = %status, "status pipeline is closed, dropping transition");
        }
    }
}

async fn run_consumer(
    mut receiver: mpsc::Receiver<StatusMessage>,
    store: Arc<dyn JobStore>,
    pubsub: Arc<dyn PubSubClient>,
) {
    let mut last_applied: HashMap<Uuid, JobStatus> = HashMap::new();

    while let Some(message) = receiver.recv().await {
        match last_applied.get(&message.job_id) {
            // Replaying the current status is a no-op.
            Some(previous) if *previous == message.status => continue,
            Some(previous) if !previous.can_transition_to(message.status) => {
                warn!(
                    job_id = %message.job_id,
                    "dropping invalid status transition {} -> {}",
                    previous,
                    message.status
                );
                continue;
            }
            // The first event we see for a job is trusted; the enqueue path
            // already persisted it as waiting.
            _ => {}
        }

        if !write_with_backoff(store.as_ref(), &message).await {
            error!(
                job_id = %message.job_id,
                status = %message.status,
                "giving up on status write after {} attempts",
                WRITE_ATTEMPTS
            );
            continue;
        }

        if message.status.is_terminal() {
            last_applied.remove(&message.job_id);
        } else {
            last_applied.insert(message.job_id, message.status);
        }

        let data = status_event_data(&message.fields);
        let event = StatusEvent::new(message.job_id, message.status, data);
        if let Err(err) = publish_event(pubsub.as_ref(), STATUS_CHANNEL, &event).await {
            warn!(job_id = %message.job_id, "failed to publish status event: {}", err);
        }
    }
}

async fn write_with_backoff(store: &dyn JobStore, message: &StatusMessage) -> bool {
    let mut backoff = WRITE_BACKOFF;
    for attempt in 1..=WRITE_ATTEMPTS {
        match store
            .update_job_status(message.job_id, message.status, message.fields.clone())
            .await
        {
            Ok(()) => return true,
            Err(err) if attempt < WRITE_ATTEMPTS => {
                warn!(
                    job_id = %message.job_id,
                    "status write failed (attempt {}): {}",
                    attempt,
                    err
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(_) => {}
        }
    }
    false
}

fn status_event_data(fields: &StatusFields) -> Option<serde_json::Value> {
    let mut data = serde_json::Map::new();
    if let Some(exit_code) = fields.exit_code {
        data.insert("exit_code".to_owned(), exit_code.into());
    }
    if let Some(error) = &fields.error {
        data.insert("error".to_owned(), error.as_str().into());
    }
    if let Some(attempts) = fields.attempts_made {
        data.insert("attempts_made".to_owned(), attempts.into());
    }
    if data.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(data))
    }
}
