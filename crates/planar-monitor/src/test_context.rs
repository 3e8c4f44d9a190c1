//! Synthetic execution context for invoking hooks without a live scheduler.

use std::collections::BTreeMap;

use chrono::Utc;

use planar_execution::{
    DataMap, ExecutionContext, FailureInfo, JobDetails, JobKey, TriggerDetails, TriggerKey,
};

use crate::event::MonitorEvent;
use crate::record::{DispatchRecord, ExecutionFacts, HookPayload};
use crate::rules::{MonitorAction, MonitorGroup};

pub const TEST_FIRE_INSTANCE_ID: &str = "__test_fire_instance_id__";
pub const TEST_GROUP: &str = "__test_group__";
pub const TEST_JOB: &str = "__test_job__";
pub const TEST_TRIGGER: &str = "__test_trigger__";
pub const TEST_JOB_ID: &str = "__test_job_id__";
pub const TEST_TRIGGER_ID: &str = "__test_trigger_id__";

/// A fixed fake context.
pub fn context() -> ExecutionContext {
    let now = Utc::now();
    let mut data = DataMap::new();
    data.insert("test_key".to_string(), "test_value".to_string());

    ExecutionContext::new(
        TEST_FIRE_INSTANCE_ID,
        JobDetails {
            key: JobKey::new(TEST_GROUP, TEST_JOB),
            id: TEST_JOB_ID.to_string(),
            job_type: "test".to_string(),
            description: Some("synthetic job for hook tests".to_string()),
            durable: false,
            author: Some("planar".to_string()),
            data,
        },
        TriggerDetails {
            key: TriggerKey::new(TEST_GROUP, TEST_TRIGGER),
            id: TEST_TRIGGER_ID.to_string(),
            calendar: None,
            data: DataMap::new(),
        },
        now,
        now,
        None,
        None,
        "test",
    )
}

/// A dispatch record for `event` built from the synthetic context.
pub fn record(event: MonitorEvent, hook: &str, group: MonitorGroup) -> DispatchRecord {
    let rule = MonitorAction {
        id: 0,
        title: "Test Monitor".to_string(),
        event,
        argument: None,
        job_id: None,
        job_group: None,
        group: group.name.clone(),
        hook: hook.to_string(),
        active: true,
    };
    let facts = ExecutionFacts {
        run_duration_ms: Some(1_000),
        progress: Some(100),
        effected_rows: Some(0),
        failure: Some(
            FailureInfo::new("test exception")
                .caused_by(FailureInfo::new("test inner exception")),
        ),
    };
    DispatchRecord::build(event, &rule, &context(), facts, group, BTreeMap::new())
}

/// A hook payload built from the synthetic context.
pub fn payload(event: MonitorEvent, hook: &str, group: MonitorGroup) -> Result<HookPayload, serde_json::Error> {
    HookPayload::from_record(&record(event, hook, group))
}
