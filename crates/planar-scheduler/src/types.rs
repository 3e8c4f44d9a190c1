//! Scheduler types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use planar_execution::{DataMap, JobDetails, JobKey, TriggerDetails, TriggerKey, UnitKind};

/// A job definition: what to run and with which static data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub key: JobKey,
    /// Stable job id used for monitor scoping.
    pub id: String,
    /// The execution unit this job runs.
    pub unit: UnitKind,
    pub description: Option<String>,
    /// Durable jobs keep data written by their executions.
    pub durable: bool,
    pub author: Option<String>,
    pub data: DataMap,
    pub created_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Create a durable job with a fresh id.
    pub fn new(key: JobKey, unit: UnitKind) -> Self {
        Self {
            key,
            id: uuid::Uuid::new_v4().to_string(),
            unit,
            description: None,
            durable: true,
            author: None,
            data: DataMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Snapshot of this job for an execution context.
    pub fn details(&self) -> JobDetails {
        JobDetails {
            key: self.key.clone(),
            id: self.id.clone(),
            job_type: self.unit.type_name().to_string(),
            description: self.description.clone(),
            durable: self.durable,
            author: self.author.clone(),
            data: self.data.clone(),
        }
    }
}

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSchedule {
    /// Fire once at a specific time.
    Once { at: DateTime<Utc> },
    /// Fire every N seconds from the last fire.
    Interval { seconds: u64 },
}

/// Current status of a trigger.
///
/// One-shot triggers are removed once they have fired, so there is no
/// terminal status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Waiting for its next fire time.
    #[default]
    Pending,
    /// Currently firing.
    Running,
    /// Was firing when the scheduler loop shut down.
    Interrupted,
}

/// A trigger bound to one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    /// Fresh for every trigger, including retries.
    pub id: String,
    pub job_key: JobKey,
    pub schedule: TriggerSchedule,
    pub status: TriggerStatus,
    pub calendar: Option<String>,
    /// Trigger data, including reserved retry and timeout keys.
    pub data: DataMap,
    pub last_fire: Option<DateTime<Utc>>,
    pub next_fire: DateTime<Utc>,
    pub fire_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// Create a one-shot trigger.
    pub fn once(key: TriggerKey, job_key: JobKey, at: DateTime<Utc>) -> Self {
        Self::new(key, job_key, TriggerSchedule::Once { at }, at)
    }

    /// Create an interval trigger that is due immediately.
    pub fn interval(key: TriggerKey, job_key: JobKey, seconds: u64) -> Self {
        Self::new(key, job_key, TriggerSchedule::Interval { seconds }, Utc::now())
    }

    fn new(
        key: TriggerKey,
        job_key: JobKey,
        schedule: TriggerSchedule,
        next_fire: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            id: uuid::Uuid::new_v4().to_string(),
            job_key,
            schedule,
            status: TriggerStatus::Pending,
            calendar: None,
            data: DataMap::new(),
            last_fire: None,
            next_fire,
            fire_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Set a trigger data value.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Check if this trigger is due to fire.
    pub fn is_due(&self) -> bool {
        self.is_due_at(Utc::now())
    }

    /// Check if this trigger is due to fire at `now`.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        match &self.status {
            TriggerStatus::Pending => self.next_fire <= now,
            // Interrupted triggers fire again as soon as possible
            TriggerStatus::Interrupted => true,
            TriggerStatus::Running => false,
        }
    }

    /// Next fire time after a fire at `fired_at`.
    pub fn calculate_next_fire(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.schedule {
            TriggerSchedule::Once { .. } => None,
            TriggerSchedule::Interval { seconds } => {
                Some(fired_at + Duration::seconds(*seconds as i64))
            }
        }
    }

    /// Snapshot of this trigger for an execution context.
    pub fn details(&self) -> TriggerDetails {
        TriggerDetails {
            key: self.key.clone(),
            id: self.id.clone(),
            calendar: self.calendar.clone(),
            data: self.data.clone(),
        }
    }
}
