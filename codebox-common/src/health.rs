//! Liveness tracking for the engine's long-running loops.
//!
//! Each loop (worker pool, status pipeline, metrics collector, reaper)
//! registers itself with a deadline and must beat more often than that
//! deadline. The process is healthy only while every tracked loop has a
//! fresh beat; staleness is computed when a probe reads the tracker, so
//! there is no background task to keep alive. Liveness and readiness get
//! separate trackers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeatState {
    /// Registered but has not beaten yet.
    Pending,
    /// Last beat at the contained instant.
    SeenAt(OffsetDateTime),
    /// The loop reported that it is broken.
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct TrackedLoop {
    deadline: Duration,
    state: BeatState,
}

impl TrackedLoop {
    fn verdict(&self, now: OffsetDateTime) -> LoopVerdict {
        match self.state {
            BeatState::Pending => LoopVerdict::Pending,
            BeatState::Failed => LoopVerdict::Failed,
            BeatState::SeenAt(at) if at + self.deadline > now => LoopVerdict::Ok,
            BeatState::SeenAt(_) => LoopVerdict::Stalled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopVerdict {
    Ok,
    Pending,
    Stalled,
    Failed,
}

impl LoopVerdict {
    fn is_ok(self) -> bool {
        self == LoopVerdict::Ok
    }
}

type SharedLoops = Arc<Mutex<HashMap<String, TrackedLoop>>>;

/// Handed to a loop so it can beat. Dropping the reporter without a `fail`
/// leaves the last beat in place; the deadline turns it stale on its own.
#[derive(Clone)]
pub struct HealthReporter {
    component: String,
    loops: SharedLoops,
}

impl HealthReporter {
    /// Record a fresh beat. Must be called more often than the deadline.
    pub fn beat(&self) {
        self.set(BeatState::SeenAt(OffsetDateTime::now_utc()));
    }

    /// Mark the loop broken until it beats again.
    pub fn fail(&self) {
        self.set(BeatState::Failed);
    }

    fn set(&self, state: BeatState) {
        if let Some(tracked) = lock_loops(&self.loops).get_mut(&self.component) {
            tracked.state = state;
        }
    }
}

#[derive(Clone)]
pub struct HealthTracker {
    name: String,
    loops: SharedLoops,
}

impl HealthTracker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            loops: Default::default(),
        }
    }

    /// Start tracking a loop. The returned reporter is the loop's only way
    /// to influence the verdict.
    pub fn track(&self, component: &str, deadline: Duration) -> HealthReporter {
        lock_loops(&self.loops).insert(
            component.to_owned(),
            TrackedLoop {
                deadline,
                state: BeatState::Pending,
            },
        );
        HealthReporter {
            component: component.to_owned(),
            loops: Arc::clone(&self.loops),
        }
    }

    /// Current overall verdict. Usable directly as an axum handler result.
    pub fn check(&self) -> HealthReport {
        let now = OffsetDateTime::now_utc();
        let loops = lock_loops(&self.loops);

        let components: HashMap<String, LoopVerdict> = loops
            .iter()
            .map(|(name, tracked)| (name.clone(), tracked.verdict(now)))
            .collect();
        // A tracker nothing registered with is not healthy, it is unused.
        let healthy = !components.is_empty() && components.values().all(|v| v.is_ok());

        if !healthy {
            warn!("{} health check failed: {:?}", self.name, components);
        }
        HealthReport {
            healthy,
            components,
        }
    }
}

fn lock_loops(loops: &SharedLoops) -> std::sync::MutexGuard<'_, HashMap<String, TrackedLoop>> {
    match loops.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: HashMap<String, LoopVerdict>,
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, Json(self)).into_response()
    }
}
