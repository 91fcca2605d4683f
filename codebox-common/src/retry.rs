use std::time;

/// Delay applied before each retry attempt, indexed by the number of attempts
/// already made. Attempts beyond the table reuse the last entry.
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    delays: Vec<time::Duration>,
    max_retries: u32,
}

const DEFAULT_DELAYS_SECS: [u64; 5] = [1, 5, 15, 60, 300];

impl RetrySchedule {
    pub fn new(delays: Vec<time::Duration>, max_retries: u32) -> Self {
        let delays = if delays.is_empty() {
            Self::default().delays
        } else {
            delays
        };
        Self {
            delays,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a job that has made `attempts_made` attempts may try again.
    /// A per-job `max_attempts` of 0 disables retries regardless of the
    /// configured maximum.
    pub fn can_retry(&self, attempts_made: u32, job_max_attempts: Option<u32>) -> bool {
        match job_max_attempts {
            Some(0) => false,
            Some(limit) => attempts_made < limit.min(self.max_retries),
            None => attempts_made < self.max_retries,
        }
    }

    /// The delay before the next attempt, given attempts already made.
    pub fn delay_for(&self, attempts_made: u32) -> time::Duration {
        let index = (attempts_made as usize).min(self.delays.len() - 1);
        self.delays[index]
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: DEFAULT_DELAYS_SECS
                .iter()
                .map(|s| time::Duration::from_secs(*s))
                .collect(),
            max_retries: DEFAULT_DELAYS_SECS.len() as u32,
        }
    }
}
