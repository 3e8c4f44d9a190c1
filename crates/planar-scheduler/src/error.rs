//! Error types for the scheduler.

use planar_execution::{JobKey, TriggerKey};
use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job already exists.
    #[error("job already exists: {0}")]
    JobExists(JobKey),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobKey),

    /// Trigger already exists.
    #[error("trigger already exists: {0}")]
    TriggerExists(TriggerKey),

    /// Trigger not found.
    #[error("trigger not found: {0}")]
    TriggerNotFound(TriggerKey),

    /// The trigger is already firing.
    #[error("trigger is already firing: {0}")]
    TriggerBusy(TriggerKey),

    /// Invalid job or trigger configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The execution could not be started.
    #[error("execution error: {0}")]
    Execution(#[from] planar_execution::ExecutionError),
}
