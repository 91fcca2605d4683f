//! Process-wide admission control for container capacity.
//!
//! Workers must acquire a permit before launching a container. Capacity is
//! two-dimensional: a slot count and a memory-reservation budget.

use std::sync::{Arc, Mutex};

use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_concurrent: u32,
    pub memory_per_container_mb: u64,
    pub total_memory_mb: u64,
    /// Share of total memory that may be reserved, in (0, 1].
    pub memory_threshold: f64,
}

impl ResourceLimits {
    fn memory_budget_mb(&self) -> u64 {
        (self.total_memory_mb as f64 * self.memory_threshold) as u64
    }
}

/// A host-resource view used to recompute limits at runtime.
#[derive(Debug, Clone, Copy)]
pub struct HostResources {
    pub total_memory_mb: u64,
}

#[derive(Debug)]
struct GovernorState {
    active: u32,
    limits: ResourceLimits,
}

/// Point-in-time view for metrics.
#[derive(Debug, Clone, Copy)]
pub struct GovernorSnapshot {
    pub active_containers: u32,
    pub max_concurrent: u32,
    pub memory_per_container_mb: u64,
    pub memory_budget_mb: u64,
}

pub struct ResourceGovernor {
    state: Mutex<GovernorState>,
}

impl ResourceGovernor {
    pub fn new(limits: ResourceLimits) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GovernorState { active: 0, limits }),
        })
    }

    /// Try to reserve capacity for one container. The returned permit releases
    /// the reservation exactly once, on drop.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut state = self.lock();

        if state.active >= state.limits.max_concurrent {
            return None;
        }
        let next_reservation =
            u64::from(state.active + 1) * state.limits.memory_per_container_mb;
        if next_reservation > state.limits.memory_budget_mb() {
            return None;
        }

        state.active += 1;
        drop(state);

        Some(AdmissionPermit {
            governor: Arc::clone(self),
        })
    }

    pub fn active_containers(&self) -> u32 {
        self.lock().active
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.lock();
        GovernorSnapshot {
            active_containers: state.active,
            max_concurrent: state.limits.max_concurrent,
            memory_per_container_mb: state.limits.memory_per_container_mb,
            memory_budget_mb: state.limits.memory_budget_mb(),
        }
    }

    /// Adjust `max_concurrent` to what the host's memory can actually hold.
    /// Never raises the limit above its configured value.
    pub fn recompute_limits(&self, host: HostResources) {
        let mut state = self.lock();
        state.limits.total_memory_mb = host.total_memory_mb;
        let by_memory = if state.limits.memory_per_container_mb == 0 {
            state.limits.max_concurrent
        } else {
            (state.limits.memory_budget_mb() / state.limits.memory_per_container_mb) as u32
        };
        state.limits.max_concurrent = state.limits.max_concurrent.min(by_memory);
    }

    fn release(&self) {
        let mut state = self.lock();
        if state.active == 0 {
            // The counter must never go negative; a double release is a bug.
            error!("admission permit released with no active containers");
            debug_assert!(false, "admission counter underflow");
            return;
        }
        state.active -= 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Reserved capacity for one container. Dropping the permit releases it.
pub struct AdmissionPermit {
    governor: Arc<ResourceGovernor>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.governor.release();
    }
}
