//! Monitor event ids and the lifecycle events they are derived from.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use planar_execution::{
    ExecutionContext, ExecutionOutcome, ExecutionStatus, JobKey, TriggerKey,
};

/// Events a monitor rule can subscribe to.
///
/// The numeric ids are stored in rule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum MonitorEvent {
    ExecutionVetoed,
    ExecutionRetry,
    ExecutionFail,
    ExecutionSuccess,
    ExecutionStart,
    ExecutionEnd,
    ExecutionFailTimesInRow,
    ExecutionFailTimesInHour,
    ExecutionDurationGreaterThanMinutes,
    ExecutionEffectedRowsGreaterThan,
    ExecutionEffectedRowsLessThan,
    ExecutionProgressChanged,
    ExecutionTimeout,
    ExecutionLastRetryFail,
    SchedulerStarted,
    SchedulerShutdown,
    SchedulerError,
    HookLoadFailed,
}

impl MonitorEvent {
    pub const ALL: [MonitorEvent; 18] = [
        MonitorEvent::ExecutionVetoed,
        MonitorEvent::ExecutionRetry,
        MonitorEvent::ExecutionFail,
        MonitorEvent::ExecutionSuccess,
        MonitorEvent::ExecutionStart,
        MonitorEvent::ExecutionEnd,
        MonitorEvent::ExecutionFailTimesInRow,
        MonitorEvent::ExecutionFailTimesInHour,
        MonitorEvent::ExecutionDurationGreaterThanMinutes,
        MonitorEvent::ExecutionEffectedRowsGreaterThan,
        MonitorEvent::ExecutionEffectedRowsLessThan,
        MonitorEvent::ExecutionProgressChanged,
        MonitorEvent::ExecutionTimeout,
        MonitorEvent::ExecutionLastRetryFail,
        MonitorEvent::SchedulerStarted,
        MonitorEvent::SchedulerShutdown,
        MonitorEvent::SchedulerError,
        MonitorEvent::HookLoadFailed,
    ];

    pub fn id(self) -> u32 {
        match self {
            MonitorEvent::ExecutionVetoed => 1,
            MonitorEvent::ExecutionRetry => 2,
            MonitorEvent::ExecutionFail => 3,
            MonitorEvent::ExecutionSuccess => 4,
            MonitorEvent::ExecutionStart => 5,
            MonitorEvent::ExecutionEnd => 6,
            MonitorEvent::ExecutionFailTimesInRow => 7,
            MonitorEvent::ExecutionFailTimesInHour => 8,
            MonitorEvent::ExecutionDurationGreaterThanMinutes => 9,
            MonitorEvent::ExecutionEffectedRowsGreaterThan => 10,
            MonitorEvent::ExecutionEffectedRowsLessThan => 11,
            MonitorEvent::ExecutionProgressChanged => 12,
            MonitorEvent::ExecutionTimeout => 13,
            MonitorEvent::ExecutionLastRetryFail => 14,
            MonitorEvent::SchedulerStarted => 100,
            MonitorEvent::SchedulerShutdown => 101,
            MonitorEvent::SchedulerError => 102,
            MonitorEvent::HookLoadFailed => 103,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.id() == id)
    }

    pub fn title(self) -> &'static str {
        match self {
            MonitorEvent::ExecutionVetoed => "Execution Vetoed",
            MonitorEvent::ExecutionRetry => "Execution Retry",
            MonitorEvent::ExecutionFail => "Execution Fail",
            MonitorEvent::ExecutionSuccess => "Execution Success",
            MonitorEvent::ExecutionStart => "Execution Start",
            MonitorEvent::ExecutionEnd => "Execution End",
            MonitorEvent::ExecutionFailTimesInRow => "Execution Fail x Times In Row",
            MonitorEvent::ExecutionFailTimesInHour => "Execution Fail x Times In Hour",
            MonitorEvent::ExecutionDurationGreaterThanMinutes => {
                "Execution Duration Greater Than x Minutes"
            }
            MonitorEvent::ExecutionEffectedRowsGreaterThan => "Execution Effected Rows Greater Than x",
            MonitorEvent::ExecutionEffectedRowsLessThan => "Execution Effected Rows Less Than x",
            MonitorEvent::ExecutionProgressChanged => "Execution Progress Changed",
            MonitorEvent::ExecutionTimeout => "Execution Timeout",
            MonitorEvent::ExecutionLastRetryFail => "Execution Last Retry Fail",
            MonitorEvent::SchedulerStarted => "Scheduler Started",
            MonitorEvent::SchedulerShutdown => "Scheduler Shutdown",
            MonitorEvent::SchedulerError => "Scheduler Error",
            MonitorEvent::HookLoadFailed => "Hook Load Failed",
        }
    }

    /// Whether rules for this event compare a metric to their argument.
    pub fn has_threshold(self) -> bool {
        matches!(
            self,
            MonitorEvent::ExecutionFailTimesInRow
                | MonitorEvent::ExecutionFailTimesInHour
                | MonitorEvent::ExecutionDurationGreaterThanMinutes
                | MonitorEvent::ExecutionEffectedRowsGreaterThan
                | MonitorEvent::ExecutionEffectedRowsLessThan
        )
    }

    pub fn is_system(self) -> bool {
        self.id() >= 100
    }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl From<MonitorEvent> for u32 {
    fn from(event: MonitorEvent) -> Self {
        event.id()
    }
}

impl TryFrom<u32> for MonitorEvent {
    type Error = String;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or_else(|| format!("unknown monitor event id {id}"))
    }
}

/// Something that happened to an execution or to the scheduler.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Vetoed {
        context: Arc<ExecutionContext>,
        reason: String,
    },
    Started {
        context: Arc<ExecutionContext>,
    },
    Finished {
        outcome: Arc<ExecutionOutcome>,
    },
    Retrying {
        outcome: Arc<ExecutionOutcome>,
        attempt: u32,
    },
    RetriesExhausted {
        outcome: Arc<ExecutionOutcome>,
        attempts: u32,
    },
    ProgressChanged {
        context: Arc<ExecutionContext>,
        progress: u8,
    },
    System {
        event: MonitorEvent,
        message: String,
        job_key: Option<JobKey>,
        trigger_key: Option<TriggerKey>,
        data: BTreeMap<String, String>,
    },
}

impl LifecycleEvent {
    /// A system event without job context.
    pub fn system(event: MonitorEvent, message: impl Into<String>) -> Self {
        LifecycleEvent::System {
            event,
            message: message.into(),
            job_key: None,
            trigger_key: None,
            data: BTreeMap::new(),
        }
    }

    /// The execution context, for execution events.
    pub fn context(&self) -> Option<&Arc<ExecutionContext>> {
        match self {
            LifecycleEvent::Vetoed { context, .. }
            | LifecycleEvent::Started { context }
            | LifecycleEvent::ProgressChanged { context, .. } => Some(context),
            LifecycleEvent::Finished { outcome }
            | LifecycleEvent::Retrying { outcome, .. }
            | LifecycleEvent::RetriesExhausted { outcome, .. } => Some(&outcome.context),
            LifecycleEvent::System { .. } => None,
        }
    }

    pub fn outcome(&self) -> Option<&Arc<ExecutionOutcome>> {
        match self {
            LifecycleEvent::Finished { outcome }
            | LifecycleEvent::Retrying { outcome, .. }
            | LifecycleEvent::RetriesExhausted { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    /// Monitor events this lifecycle event may raise.
    pub fn candidates(&self) -> Vec<MonitorEvent> {
        match self {
            LifecycleEvent::Vetoed { .. } => vec![MonitorEvent::ExecutionVetoed],
            LifecycleEvent::Started { .. } => vec![MonitorEvent::ExecutionStart],
            LifecycleEvent::Finished { outcome } => {
                let mut events = vec![MonitorEvent::ExecutionEnd];
                if outcome.is_success() {
                    events.push(MonitorEvent::ExecutionSuccess);
                } else {
                    events.push(MonitorEvent::ExecutionFail);
                    events.push(MonitorEvent::ExecutionFailTimesInRow);
                    events.push(MonitorEvent::ExecutionFailTimesInHour);
                }
                if outcome.status == ExecutionStatus::Timeout {
                    events.push(MonitorEvent::ExecutionTimeout);
                }
                events.push(MonitorEvent::ExecutionEffectedRowsGreaterThan);
                events.push(MonitorEvent::ExecutionEffectedRowsLessThan);
                events
            }
            LifecycleEvent::Retrying { .. } => vec![MonitorEvent::ExecutionRetry],
            LifecycleEvent::RetriesExhausted { .. } => vec![MonitorEvent::ExecutionLastRetryFail],
            LifecycleEvent::ProgressChanged { .. } => vec![MonitorEvent::ExecutionProgressChanged],
            LifecycleEvent::System { event, .. } => vec![*event],
        }
    }
}
