//! Fan-out for container output.
//!
//! Realtime subscribers receive every chunk as it arrives, including repeats.
//! Durable storage receives exactly one consolidated record per (job, stream)
//! when the job terminates, with duplicate chunks collapsed. This keeps the
//! log table at two rows per job no matter how chatty the container was.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use tracing::warn;
use uuid::Uuid;

use codebox_common::job::StreamKind;
use codebox_common::pubsub::{publish_event, LogEvent, PubSubClient, LOGS_CHANNEL};
use codebox_common::store::JobStore;

struct JobLogBuffer {
    chunks: VecDeque<(StreamKind, String)>,
    seen: HashSet<u64>,
    overflow_warned: bool,
}

impl JobLogBuffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            seen: HashSet::new(),
            overflow_warned: false,
        }
    }
}

pub struct LogMultiplexer {
    store: Arc<dyn JobStore>,
    pubsub: Arc<dyn PubSubClient>,
    max_chunks: usize,
    buffers: Mutex<HashMap<Uuid, JobLogBuffer>>,
}

impl LogMultiplexer {
    pub fn new(
        store: Arc<dyn JobStore>,
        pubsub: Arc<dyn PubSubClient>,
        max_chunks: usize,
    ) -> Self {
        Self {
            store,
            pubsub,
            max_chunks: max_chunks.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Accept one chunk of container output. The accumulator write happens
    /// before any publish so a stalled broker can never lose logs.
    pub async fn append(&self, job_id: Uuid, kind: StreamKind, chunk: &str) {
        let trimmed = chunk.trim();
        if trimmed.is_empty() {
            return;
        }

        {
            let mut buffers = self.lock();
            let buffer = buffers.entry(job_id).or_insert_with(JobLogBuffer::new);
            let digest = chunk_digest(kind, trimmed);
            if buffer.seen.insert(digest) {
                buffer.chunks.push_back((kind, trimmed.to_owned()));
                if buffer.chunks.len() > self.max_chunks {
                    buffer.chunks.pop_front();
                    if !buffer.overflow_warned {
                        buffer.overflow_warned = true;
                        warn!(
                            job_id = %job_id,
                            "log buffer overflow, dropping oldest chunks"
                        );
                    }
                }
            }
        }

        // Repeats still go out live, they just don't get stored twice.
        let event = LogEvent::new(job_id, kind, trimmed.to_owned());
        if let Err(err) = publish_event(self.pubsub.as_ref(), LOGS_CHANNEL, &event).await {
            warn!(job_id = %job_id, "failed to publish log chunk: {}", err);
        }
    }

    /// Persist the consolidated records and destroy the accumulator. Called
    /// once per job on the terminal transition; calling again is a no-op.
    pub async fn flush(&self, job_id: Uuid) {
        let Some(buffer) = self.lock().remove(&job_id) else {
            return;
        };

        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            let content = buffer
                .chunks
                .iter()
                .filter(|(chunk_kind, _)| *chunk_kind == kind)
                .map(|(_, chunk)| chunk.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if content.is_empty() {
                continue;
            }
            if let Err(err) = self.store.save_job_log(job_id, kind, &content).await {
                warn!(job_id = %job_id, kind = %kind, "failed to persist consolidated log: {}", err);
            }
        }
    }

    /// Number of jobs with live accumulators, for tests and gauges.
    pub fn open_buffers(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobLogBuffer>> {
        match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn chunk_digest(kind: StreamKind, chunk: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    kind.hash(&mut hasher);
    chunk.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codebox_common::pubsub::MockPubSub;
    use codebox_common::store::MemoryJobStore;

    fn multiplexer(max_chunks: usize) -> (LogMultiplexer, MemoryJobStore, MockPubSub) {
        let store = MemoryJobStore::new();
        let pubsub = MockPubSub::new();
        let mux = LogMultiplexer::new(
            Arc::new(store.clone()),
            Arc::new(pubsub.clone()),
            max_chunks,
        );
        (mux, store, pubsub)
    }

    #[tokio::test]
    async fn test_duplicates_stream_live_but_store_once() {
        let (mux, store, pubsub) = multiplexer(100);
        let job_id = Uuid::now_v7();

        for _ in 0..5 {
            mux.append(job_id, StreamKind::Stdout, "LINE\n").await;
        }
        mux.flush(job_id).await;

        // Every chunk went out on the realtime channel.
        assert_eq!(pubsub.published_on(LOGS_CHANNEL).len(), 5);

        // Exactly one stored record containing the line once.
        let logs = store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, StreamKind::Stdout);
        assert_eq!(logs[0].content, "LINE");
    }

    #[tokio::test]
    async fn test_whitespace_only_chunks_are_dropped() {
        let (mux, store, pubsub) = multiplexer(100);
        let job_id = Uuid::now_v7();

        mux.append(job_id, StreamKind::Stdout, "   \n\t").await;
        mux.flush(job_id).await;

        assert!(pubsub.published_on(LOGS_CHANNEL).is_empty());
        assert!(store.logs().is_empty());
    }

    #[tokio::test]
    async fn test_streams_consolidate_separately_in_arrival_order() {
        let (mux, store, _pubsub) = multiplexer(100);
        let job_id = Uuid::now_v7();

        mux.append(job_id, StreamKind::Stdout, "one").await;
        mux.append(job_id, StreamKind::Stderr, "oops").await;
        mux.append(job_id, StreamKind::Stdout, "two").await;
        mux.flush(job_id).await;

        let logs = store.logs();
        assert_eq!(logs.len(), 2);
        let stdout = logs.iter().find(|r| r.kind == StreamKind::Stdout).unwrap();
        assert_eq!(stdout.content, "one\ntwo");
        let stderr = logs.iter().find(|r| r.kind == StreamKind::Stderr).unwrap();
        assert_eq!(stderr.content, "oops");
    }

    #[tokio::test]
    async fn test_overflow_drops_the_oldest_chunks() {
        let (mux, store, _pubsub) = multiplexer(3);
        let job_id = Uuid::now_v7();

        for i in 0..5 {
            mux.append(job_id, StreamKind::Stdout, &format!("line-{i}"))
                .await;
        }
        mux.flush(job_id).await;

        let logs = store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].content, "line-2\nline-3\nline-4");
    }

    #[tokio::test]
    async fn test_flush_destroys_the_accumulator() {
        let (mux, store, _pubsub) = multiplexer(100);
        let job_id = Uuid::now_v7();

        mux.append(job_id, StreamKind::Stdout, "hello").await;
        assert_eq!(mux.open_buffers(), 1);

        mux.flush(job_id).await;
        assert_eq!(mux.open_buffers(), 0);
        assert_eq!(store.logs().len(), 1);

        // A second flush has nothing left to persist.
        mux.flush(job_id).await;
        assert_eq!(store.logs().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_lose_stored_logs() {
        let (mux, store, pubsub) = multiplexer(100);
        let job_id = Uuid::now_v7();

        pubsub.fail_publishes(true);
        mux.append(job_id, StreamKind::Stdout, "kept").await;
        mux.flush(job_id).await;

        assert!(pubsub.published_on(LOGS_CHANNEL).is_empty());
        assert_eq!(store.logs().len(), 1);
        assert_eq!(store.logs()[0].content, "kept");
    }
}
