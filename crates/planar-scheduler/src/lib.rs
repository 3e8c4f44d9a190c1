//! Trigger scheduler for Planar.
//!
//! This crate provides an in-memory scheduler that:
//! - Holds job definitions and their triggers
//! - Fires due one-shot and interval triggers concurrently
//! - Applies durable job data written by executions
//! - Reschedules failed triggers through the retry state machine

mod error;
mod retry;
mod scheduler;
mod types;

pub use error::SchedulerError;
pub use retry::{LineageState, RETRY_TRIGGER_PREFIX, RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerEvent, SchedulerListener};
pub use types::{JobDefinition, Trigger, TriggerSchedule, TriggerStatus};
