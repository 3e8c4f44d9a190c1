//! Trigger-level retry state machine.
//!
//! A lineage starts with an original trigger whose data carries a non-empty
//! `__retry_span`. Each failed fire derives a new one-shot trigger named
//! `Retry.Count.<n>.<original id>` that starts one span later and carries the
//! same span with the counter incremented. Once the counter would exceed the
//! maximum, the lineage is exhausted and nothing more is scheduled.
//!
//! ```text
//! FirstAttempt -> Retrying(1) -> ... -> Retrying(max) -> RetriesExhausted
//!       \               \                     \
//!        `---------------`---------------------`-> Succeeded
//! ```

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use planar_execution::{TriggerKey, keys};

use crate::types::{Trigger, TriggerSchedule, TriggerStatus};

/// Name prefix for derived retry triggers.
pub const RETRY_TRIGGER_PREFIX: &str = "Retry.Count";

/// Where a trigger sits in its retry lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageState {
    /// Not retry-enabled.
    Disabled,
    FirstAttempt,
    Retrying(u32),
}

/// What to do after a trigger's execution completed.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// The trigger has no retry span.
    NotEnabled,
    /// The execution succeeded; the lineage ends.
    Succeeded,
    /// The counter would exceed the maximum; the lineage ends.
    Exhausted { attempts: u32, max_retries: u32 },
    /// Schedule this one-shot trigger.
    Retry { trigger: Trigger, attempt: u32 },
}

/// Retry configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Used when a trigger carries no `__max_retries`.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Whether a trigger is retry-enabled.
    pub fn is_enabled(trigger: &Trigger) -> bool {
        trigger.details().retry_span().is_some()
    }

    /// The lineage state of a trigger.
    pub fn lineage_state(trigger: &Trigger) -> LineageState {
        if !Self::is_enabled(trigger) {
            return LineageState::Disabled;
        }
        match trigger.details().retry_counter() {
            None | Some(0) => LineageState::FirstAttempt,
            Some(n) => LineageState::Retrying(n),
        }
    }

    /// Maximum retries for a trigger's lineage.
    pub fn max_retries_for(&self, trigger: &Trigger) -> u32 {
        trigger
            .data
            .get(keys::MAX_RETRIES)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.max_retries)
    }

    /// Called when a trigger fires. Initializes the counter of a
    /// retry-enabled trigger that has none.
    ///
    /// Returns true if the trigger's data changed.
    pub fn on_fired(&self, trigger: &mut Trigger) -> bool {
        if !Self::is_enabled(trigger) || trigger.data.contains_key(keys::RETRY_COUNTER) {
            return false;
        }
        trigger
            .data
            .insert(keys::RETRY_COUNTER.to_string(), "0".to_string());
        true
    }

    /// Decide what follows a completed execution of `trigger`.
    pub fn on_complete(&self, trigger: &Trigger, success: bool, now: DateTime<Utc>) -> RetryDecision {
        let details = trigger.details();
        let Some(span) = details.retry_span() else {
            return RetryDecision::NotEnabled;
        };
        if success {
            return RetryDecision::Succeeded;
        }

        let attempt = details.retry_counter().unwrap_or(0).saturating_add(1);
        let max_retries = self.max_retries_for(trigger);
        let original_id = trigger
            .data
            .get(keys::TRIGGER_ID)
            .cloned()
            .unwrap_or_else(|| trigger.id.clone());

        if attempt > max_retries {
            error!(
                trigger = %trigger.key,
                job = %trigger.job_key,
                original_trigger_id = %original_id,
                retries = max_retries,
                "retries exhausted, giving up"
            );
            return RetryDecision::Exhausted {
                attempts: attempt - 1,
                max_retries,
            };
        }

        let start = now + Duration::from_std(span).unwrap_or_else(|_| Duration::zero());
        let mut retry = trigger.clone();
        retry.key = TriggerKey::new(
            trigger.key.group.clone(),
            format!("{RETRY_TRIGGER_PREFIX}.{attempt}.{original_id}"),
        );
        retry.id = uuid::Uuid::new_v4().to_string();
        retry.schedule = TriggerSchedule::Once { at: start };
        retry.status = TriggerStatus::Pending;
        retry.next_fire = start;
        retry.last_fire = None;
        retry.fire_count = 0;
        retry.created_at = now;
        retry
            .data
            .insert(keys::RETRY_COUNTER.to_string(), attempt.to_string());
        retry
            .data
            .insert(keys::TRIGGER_ID.to_string(), original_id.clone());

        if attempt == 1 {
            info!(
                trigger = %retry.key,
                job = %trigger.job_key,
                attempt,
                max_retries,
                start = %start,
                "scheduling retry"
            );
        } else {
            warn!(
                trigger = %retry.key,
                job = %trigger.job_key,
                attempt,
                max_retries,
                start = %start,
                "scheduling retry"
            );
        }

        RetryDecision::Retry {
            trigger: retry,
            attempt,
        }
    }
}
