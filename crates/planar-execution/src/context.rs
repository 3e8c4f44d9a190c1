//! Per-fire execution context.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// String-valued data map carried by jobs and triggers.
pub type DataMap = BTreeMap<String, String>;

/// Reserved trigger/job data keys.
///
/// These are persisted with trigger data, so their spelling is part of the
/// stored format.
pub mod keys {
    /// Fixed backoff delay between retries (seconds or `HH:MM:SS`).
    pub const RETRY_SPAN: &str = "__retry_span";
    /// Number of retries already scheduled for this lineage.
    pub const RETRY_COUNTER: &str = "__retry_counter";
    /// Per-trigger override of the maximum number of retries.
    pub const MAX_RETRIES: &str = "__max_retries";
    /// Stable trigger id shared by a lineage.
    pub const TRIGGER_ID: &str = "__trigger_id";
    /// Author of the job.
    pub const AUTHOR: &str = "__author";
    /// Job id.
    pub const JOB_ID: &str = "__job_id";
    /// Per-trigger execution timeout (seconds or `HH:MM:SS`).
    pub const TIMEOUT: &str = "__timeout";

    /// Whether a key is reserved for internal use.
    pub fn is_reserved(key: &str) -> bool {
        key.starts_with("__")
    }
}

/// Identifies a job by group and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identifies a trigger by group and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Snapshot of the job being executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    pub key: JobKey,
    pub id: String,
    /// Unit kind name ("process", "rest", or a registered unit).
    pub job_type: String,
    pub description: Option<String>,
    /// Durable jobs keep data written by their executions.
    pub durable: bool,
    pub author: Option<String>,
    pub data: DataMap,
}

/// Snapshot of the trigger that fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDetails {
    pub key: TriggerKey,
    pub id: String,
    pub calendar: Option<String>,
    pub data: DataMap,
}

impl TriggerDetails {
    /// The retry span configured on this trigger, if any.
    pub fn retry_span(&self) -> Option<Duration> {
        self.data.get(keys::RETRY_SPAN).and_then(|v| parse_span(v))
    }

    /// The per-trigger execution timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.data.get(keys::TIMEOUT).and_then(|v| parse_span(v))
    }

    /// The retry counter stored on this trigger, if any.
    pub fn retry_counter(&self) -> Option<u32> {
        self.data
            .get(keys::RETRY_COUNTER)
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Everything an execution unit knows about the fire it belongs to.
///
/// Immutable for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub fire_instance_id: String,
    pub job: JobDetails,
    pub trigger: TriggerDetails,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub refire_count: u32,
    pub recovering: bool,
    pub environment: String,
    /// Job data overlaid with trigger data.
    pub merged_data: DataMap,
}

impl ExecutionContext {
    /// Build a context, computing the merged data map.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fire_instance_id: impl Into<String>,
        job: JobDetails,
        trigger: TriggerDetails,
        fire_time: DateTime<Utc>,
        scheduled_fire_time: DateTime<Utc>,
        next_fire_time: Option<DateTime<Utc>>,
        previous_fire_time: Option<DateTime<Utc>>,
        environment: impl Into<String>,
    ) -> Self {
        let merged_data = merge_data(&job.data, &trigger.data);
        Self {
            fire_instance_id: fire_instance_id.into(),
            job,
            trigger,
            fire_time,
            scheduled_fire_time,
            next_fire_time,
            previous_fire_time,
            refire_count: 0,
            recovering: false,
            environment: environment.into(),
            merged_data,
        }
    }

    /// Job id, falling back to the `__job_id` data key.
    pub fn job_id(&self) -> &str {
        if self.job.id.is_empty() {
            self.merged_data
                .get(keys::JOB_ID)
                .map(String::as_str)
                .unwrap_or_default()
        } else {
            &self.job.id
        }
    }

    /// Job author, falling back to the `__author` data key.
    pub fn author(&self) -> Option<&str> {
        self.job
            .author
            .as_deref()
            .or_else(|| self.merged_data.get(keys::AUTHOR).map(String::as_str))
    }

    /// Time elapsed since the fire time.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fire_time).to_std().unwrap_or_default()
    }
}

/// Overlay trigger data on job data. Trigger values win.
pub fn merge_data(job: &DataMap, trigger: &DataMap) -> DataMap {
    let mut merged = job.clone();
    merged.extend(trigger.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Parse a span written either as whole seconds (`"90"`) or as
/// `HH:MM:SS` / `D.HH:MM:SS`.
///
/// Empty and zero spans parse to `None`.
pub fn parse_span(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let secs = if let Ok(secs) = raw.parse::<u64>() {
        secs
    } else {
        let (days, clock) = match raw.split_once('.') {
            Some((d, rest)) if rest.contains(':') => (d.parse::<u64>().ok()?, rest),
            _ => (0, raw),
        };
        let parts: Vec<&str> = clock.split(':').collect();
        if parts.len() != 3 {
            return None;
        }
        let h: u64 = parts[0].parse().ok()?;
        let m: u64 = parts[1].parse().ok()?;
        let s: u64 = parts[2].parse().ok()?;
        if m >= 60 || s >= 60 {
            return None;
        }
        days * 86_400 + h * 3600 + m * 60 + s
    };

    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Format a span as `HH:MM:SS`.
pub fn format_span(span: Duration) -> String {
    let secs = span.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
