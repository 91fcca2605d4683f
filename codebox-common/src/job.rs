use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::Visitor, Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::RuntimeCatalog;

/// Hard cap on job wall-clock timeouts. Submissions above this are rejected at enqueue.
pub const TIMEOUT_CAP_MS: u64 = 300_000;

/// Timeout applied when a submission does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 180_000;

/// Memory limit applied when a submission does not set one.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("timeout_ms {0} exceeds the maximum of {TIMEOUT_CAP_MS}")]
    TimeoutTooLarge(u64),
    #[error("{0} is not a supported runtime for raw code submissions")]
    UnsupportedRuntime(String),
    #[error("{0} is not a valid environment variable name")]
    InvalidEnvName(String),
    #[error("{0} is not a valid memory limit, expected <N>MB or <N>GB")]
    InvalidMemoryLimit(String),
    #[error("git_link must not be empty")]
    EmptyGitLink,
    #[error("raw_code must not be empty")]
    EmptyRawCode,
    #[error("docker_image must not be empty")]
    EmptyDockerImage,
}

/// What the client asked us to run. The tag decides which source field is
/// required, so an ill-formed combination cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "submission_type", rename_all = "snake_case")]
pub enum Submission {
    GitRepo { git_link: String },
    RawCode { raw_code: String },
    CustomImage { docker_image: String },
}

impl Submission {
    pub fn kind(&self) -> &'static str {
        match self {
            Submission::GitRepo { .. } => "git_repo",
            Submission::RawCode { .. } => "raw_code",
            Submission::CustomImage { .. } => "custom_image",
        }
    }
}

/// A memory limit expressed as `<N>MB` or `<N>GB`, stored in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit(u64);

impl MemoryLimit {
    pub fn from_megabytes(mb: u64) -> Self {
        Self(mb)
    }

    pub fn megabytes(&self) -> u64 {
        self.0
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self(DEFAULT_MEMORY_LIMIT_MB)
    }
}

impl FromStr for MemoryLimit {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let parse = |digits: &str, scale: u64| {
            digits
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .map(|n| MemoryLimit(n * scale))
        };
        let parsed = if let Some(digits) = upper.strip_suffix("GB") {
            parse(digits, 1024)
        } else if let Some(digits) = upper.strip_suffix("MB") {
            parse(digits, 1)
        } else {
            None
        };

        parsed.ok_or_else(|| ValidationError::InvalidMemoryLimit(s.to_owned()))
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{}GB", self.0 / 1024)
        } else {
            write!(f, "{}MB", self.0)
        }
    }
}

struct MemoryLimitVisitor;

impl Visitor<'_> for MemoryLimitVisitor {
    type Value = MemoryLimit;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a memory limit like \"512MB\" or \"2GB\"")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        MemoryLimit::from_str(s)
            .map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self))
    }
}

impl<'de> Deserialize<'de> for MemoryLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(MemoryLimitVisitor)
    }
}

impl Serialize for MemoryLimit {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// The immutable payload of a job, as submitted and as carried through the
/// queue on retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(flatten)]
    pub submission: Submission,
    #[serde(default = "JobRequest::default_runtime")]
    pub runtime: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub start_directory: Option<String>,
    #[serde(default)]
    pub initial_cmds: Vec<String>,
    #[serde(default)]
    pub build_cmd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub memory_limit: MemoryLimit,
    #[serde(default = "JobRequest::default_timeout_ms")]
    pub timeout_ms: u64,
    /// `Some(0)` disables retries entirely. `None` uses the configured maximum.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl JobRequest {
    fn default_runtime() -> String {
        "nodejs".to_owned()
    }

    fn default_timeout_ms() -> u64 {
        DEFAULT_TIMEOUT_MS
    }

    /// Check everything a submission can get wrong that the type system cannot.
    pub fn validate(&self, catalog: &RuntimeCatalog) -> Result<(), ValidationError> {
        match &self.submission {
            Submission::GitRepo { git_link } if git_link.trim().is_empty() => {
                return Err(ValidationError::EmptyGitLink)
            }
            Submission::RawCode { raw_code } if raw_code.trim().is_empty() => {
                return Err(ValidationError::EmptyRawCode)
            }
            Submission::CustomImage { docker_image } if docker_image.trim().is_empty() => {
                return Err(ValidationError::EmptyDockerImage)
            }
            _ => {}
        }

        if matches!(self.submission, Submission::RawCode { .. })
            && !catalog.supports(&self.runtime)
        {
            return Err(ValidationError::UnsupportedRuntime(self.runtime.clone()));
        }

        if self.timeout_ms > TIMEOUT_CAP_MS {
            return Err(ValidationError::TimeoutTooLarge(self.timeout_ms));
        }

        for name in self.env.keys() {
            if !is_valid_env_name(name) {
                return Err(ValidationError::InvalidEnvName(name.clone()));
            }
        }

        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Application-level job status, as persisted and published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    TimedOut,
    Retrying,
    FailedPermanently,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::FailedPermanently)
    }

    /// The status DAG. Everything not listed here is an invalid transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::{
            Active, Completed, Delayed, Failed, FailedPermanently, Retrying, TimedOut, Waiting,
        };
        matches!(
            (self, next),
            (Waiting, Active)
                | (Waiting, Delayed)
                | (Waiting, FailedPermanently)
                | (Delayed, Waiting)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, TimedOut)
                | (Failed, Retrying)
                | (Failed, FailedPermanently)
                | (TimedOut, Retrying)
                | (TimedOut, FailedPermanently)
                | (Retrying, Waiting)
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "delayed" => Ok(JobStatus::Delayed),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timed_out" => Ok(JobStatus::TimedOut),
            "retrying" => Ok(JobStatus::Retrying),
            "failed_permanently" => Ok(JobStatus::FailedPermanently),
            invalid => Err(format!("{invalid} is not a valid JobStatus")),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Retrying => "retrying",
            JobStatus::FailedPermanently => "failed_permanently",
        };
        write!(f, "{s}")
    }
}

impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct JobStatusVisitor;

impl Visitor<'_> for JobStatusVisitor {
    type Value = JobStatus;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of JobStatus")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        JobStatus::from_str(s)
            .map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self))
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(JobStatusVisitor)
    }
}

/// Which container stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(StreamKind::Stdout),
            "stderr" => Ok(StreamKind::Stderr),
            invalid => Err(format!("{invalid} is not a valid StreamKind")),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

impl Serialize for StreamKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct StreamKindVisitor;

impl Visitor<'_> for StreamKindVisitor {
    type Value = StreamKind;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "\"stdout\" or \"stderr\"")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        StreamKind::from_str(s)
            .map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self))
    }
}

impl<'de> Deserialize<'de> for StreamKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(StreamKindVisitor)
    }
}

/// A read-model of one job, merged from the queue row and the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: uuid::Uuid,
    pub status: JobStatus,
    pub request: JobRequest,
    pub attempts_made: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}
