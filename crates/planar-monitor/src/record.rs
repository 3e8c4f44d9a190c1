//! Records handed to hooks, and the serialized payload they travel in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use planar_execution::{DataMap, ExecutionContext, FailureInfo, JobKey, TriggerKey};

use crate::event::MonitorEvent;
use crate::rules::{MonitorAction, MonitorGroup, MonitorUser};

/// Everything a hook learns about one (rule, execution) match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub event_id: u32,
    pub event_title: String,
    pub monitor_id: i64,
    pub monitor_title: String,
    /// Hook the record is addressed to.
    pub hook: String,
    pub environment: String,
    pub job_id: String,
    pub job_key: JobKey,
    pub job_description: Option<String>,
    pub author: Option<String>,
    pub trigger_id: String,
    pub trigger_key: TriggerKey,
    pub fire_instance_id: String,
    pub fire_time: DateTime<Utc>,
    /// Milliseconds since the fire time.
    pub run_duration_ms: Option<u64>,
    pub progress: Option<u8>,
    pub effected_rows: Option<i64>,
    pub data: DataMap,
    pub exception: Option<String>,
    pub most_inner_exception_message: Option<String>,
    pub users: Vec<MonitorUser>,
    pub group: MonitorGroup,
    pub global_config: BTreeMap<String, String>,
    pub argument: Option<String>,
}

/// Execution facts known when a record is built.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFacts {
    pub run_duration_ms: Option<u64>,
    pub progress: Option<u8>,
    pub effected_rows: Option<i64>,
    pub failure: Option<FailureInfo>,
}

impl DispatchRecord {
    pub fn build(
        event: MonitorEvent,
        rule: &MonitorAction,
        context: &ExecutionContext,
        facts: ExecutionFacts,
        group: MonitorGroup,
        global_config: BTreeMap<String, String>,
    ) -> Self {
        Self {
            event_id: event.id(),
            event_title: event.title().to_string(),
            monitor_id: rule.id,
            monitor_title: rule.title.clone(),
            hook: rule.hook.clone(),
            environment: context.environment.clone(),
            job_id: context.job_id().to_string(),
            job_key: context.job.key.clone(),
            job_description: context.job.description.clone(),
            author: context.author().map(str::to_string),
            trigger_id: context.trigger.id.clone(),
            trigger_key: context.trigger.key.clone(),
            fire_instance_id: context.fire_instance_id.clone(),
            fire_time: context.fire_time,
            run_duration_ms: facts.run_duration_ms,
            progress: facts.progress,
            effected_rows: facts.effected_rows,
            data: context.merged_data.clone(),
            exception: facts.failure.as_ref().map(ToString::to_string),
            most_inner_exception_message: facts
                .failure
                .as_ref()
                .map(|f| f.innermost_message().to_string()),
            users: group.users.clone(),
            group,
            global_config,
            argument: rule.argument.clone(),
        }
    }
}

/// Everything a hook learns about a system event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDispatchRecord {
    pub event_id: u32,
    pub event_title: String,
    pub monitor_id: i64,
    pub monitor_title: String,
    pub hook: String,
    pub environment: String,
    pub message: String,
    pub job_key: Option<JobKey>,
    pub trigger_key: Option<TriggerKey>,
    pub data: BTreeMap<String, String>,
    pub users: Vec<MonitorUser>,
    pub group: MonitorGroup,
    pub global_config: BTreeMap<String, String>,
}

/// The serialized boundary a hook sees: three JSON documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookPayload {
    pub details: String,
    pub users: String,
    pub group: String,
}

impl HookPayload {
    pub fn from_record(record: &DispatchRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            details: serde_json::to_string(record)?,
            users: serde_json::to_string(&record.users)?,
            group: serde_json::to_string(&record.group)?,
        })
    }

    pub fn from_system(record: &SystemDispatchRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            details: serde_json::to_string(record)?,
            users: serde_json::to_string(&record.users)?,
            group: serde_json::to_string(&record.group)?,
        })
    }

    /// Decode the details document.
    pub fn details<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.details)
    }
}
