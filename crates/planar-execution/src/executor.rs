//! Runs one execution unit for one fire instance.
//!
//! The executor registers the fire in [`RunningExecutions`], hands the unit a
//! [`JobChannel`], enforces the timeout, and finalizes the metadata exactly
//! once whichever way the unit ends: return, failure, stop, timeout, panic or
//! transport breakdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::channel::{JobChannel, LocalTransport};
use crate::context::ExecutionContext;
use crate::error::ExecutionError;
use crate::failure::FailureInfo;
use crate::host::ChannelHost;
use crate::metadata::ExecutionMetadata;
use crate::protocol::StartupSnapshot;
use crate::registry::{RunningEntry, RunningExecutions};
use crate::unit::{ExecutionUnit, UnitError};

/// Receives notifications about running executions.
pub trait ExecutionObserver: Send + Sync {
    /// Progress of a running execution changed.
    fn progress_changed(&self, _context: &Arc<ExecutionContext>, _progress: u8) {}
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout applied when the trigger carries no `__timeout`.
    pub default_timeout: Option<Duration>,
    /// How long a timed-out unit may keep running after its stop request.
    pub stop_grace: Duration,
    /// Read-only settings exposed to every unit.
    pub global_config: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            stop_grace: Duration::from_secs(10),
            global_config: BTreeMap::new(),
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Fail,
    /// The unit exceeded its timeout.
    Timeout,
    /// The unit honoured a stop request.
    Stopped,
    /// The unit panicked or its transport broke.
    Unhandled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Fail => "fail",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Unhandled => "unhandled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The finalized result of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub context: Arc<ExecutionContext>,
    pub metadata: ExecutionMetadata,
    pub status: ExecutionStatus,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The fatal failure recorded for this execution, if any.
    pub fn failure(&self) -> Option<&FailureInfo> {
        self.metadata.fatal.as_ref()
    }
}

/// How the unit task ended, before the outcome is recorded.
enum Completion {
    Returned(Result<(), UnitError>),
    Panicked(String),
    Abandoned,
}

impl Completion {
    fn from_join(result: Result<Result<(), UnitError>, JoinError>) -> Self {
        match result {
            Ok(result) => Completion::Returned(result),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unit panicked".to_string());
                Completion::Panicked(message)
            }
            Err(_) => Completion::Abandoned,
        }
    }
}

/// Runs units and finalizes their metadata.
pub struct Executor {
    running: Arc<RunningExecutions>,
    host: ChannelHost,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(running: Arc<RunningExecutions>, config: ExecutorConfig) -> Self {
        Self {
            host: ChannelHost::new(Arc::clone(&running)),
            running,
            config,
        }
    }

    /// Notify `observer` of progress changes of every execution.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.host = self.host.with_observer(observer);
        self
    }

    pub fn running(&self) -> &Arc<RunningExecutions> {
        &self.running
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Ask a running execution to stop. Returns false if it is not running.
    pub fn stop(&self, fire_instance_id: &str) -> bool {
        self.running.request_stop(fire_instance_id)
    }

    /// Run `unit` for `context` to completion.
    ///
    /// Only registration fails with an error; every unit failure is folded
    /// into the returned outcome.
    #[tracing::instrument(
        skip(self, context, unit),
        fields(fire_instance_id = %context.fire_instance_id, job = %context.job.key)
    )]
    pub async fn execute(
        &self,
        context: Arc<ExecutionContext>,
        unit: Arc<dyn ExecutionUnit>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let entry = self.running.register(Arc::clone(&context))?;
        let started = Instant::now();

        let log = {
            let mut metadata = entry.metadata.lock().await;
            if let Err(e) = metadata.start() {
                warn!(error = %e, "execution metadata could not be started");
            }
            metadata.log.clone()
        };

        let snapshot = StartupSnapshot {
            context: (*context).clone(),
            log,
            stop_requested: entry.stop.is_requested(),
            global_config: self.config.global_config.clone(),
        };
        let transport = LocalTransport::new(self.host.clone(), context.fire_instance_id.clone());
        let channel = JobChannel::new(Arc::new(transport), snapshot)
            .with_stop_signal(entry.stop.subscribe());

        debug!(unit = unit.kind(), "starting execution unit");
        let mut task = tokio::spawn(async move { unit.execute(channel).await });

        let limit = context.trigger.timeout().or(self.config.default_timeout);
        let mut timed_out = false;
        let completion = match limit {
            None => Completion::from_join((&mut task).await),
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => Completion::from_join(joined),
                Err(_) => {
                    timed_out = true;
                    warn!(timeout = ?limit, "execution timed out, requesting stop");
                    entry.stop.request();
                    match tokio::time::timeout(self.config.stop_grace, &mut task).await {
                        Ok(joined) => Completion::from_join(joined),
                        Err(_) => {
                            warn!(grace = ?self.config.stop_grace, "unit ignored stop request, aborting");
                            task.abort();
                            Completion::Abandoned
                        }
                    }
                }
            },
        };

        let outcome = self
            .finish(&entry, context, completion, timed_out, limit, started)
            .await;
        self.running.remove(&outcome.context.fire_instance_id);
        Ok(outcome)
    }

    async fn finish(
        &self,
        entry: &RunningEntry,
        context: Arc<ExecutionContext>,
        completion: Completion,
        timed_out: bool,
        limit: Option<Duration>,
        started: Instant,
    ) -> ExecutionOutcome {
        let mut metadata = entry.metadata.lock().await;

        if timed_out {
            let limit = limit.unwrap_or_default();
            record_fatal(
                &mut metadata,
                FailureInfo::with_kind(
                    FailureInfo::KIND_TIMEOUT,
                    format!("execution exceeded timeout of {}s", limit.as_secs_f64()),
                ),
            );
        }

        let mut status = match completion {
            Completion::Returned(Ok(())) => None,
            Completion::Returned(Err(UnitError::Failed(failure))) => {
                let stopped = failure.kind == FailureInfo::KIND_STOPPED;
                record_fatal(&mut metadata, failure);
                stopped.then_some(ExecutionStatus::Stopped)
            }
            Completion::Returned(Err(UnitError::Transport(e))) => {
                error!(error = %e, "execution channel broke");
                record_fatal(
                    &mut metadata,
                    FailureInfo::with_kind(FailureInfo::KIND_TRANSPORT, e.to_string()),
                );
                Some(ExecutionStatus::Unhandled)
            }
            Completion::Panicked(message) => {
                error!(panic = %message, "execution unit panicked");
                record_fatal(
                    &mut metadata,
                    FailureInfo::with_kind(FailureInfo::KIND_PANIC, message),
                );
                Some(ExecutionStatus::Unhandled)
            }
            Completion::Abandoned => None,
        };
        if timed_out {
            status = Some(ExecutionStatus::Timeout);
        }

        let success = metadata.finalize();
        let status = status.unwrap_or(if success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Fail
        });
        let duration = started.elapsed();

        match status {
            ExecutionStatus::Success => info!(
                status = %status,
                duration_ms = duration.as_millis() as u64,
                effected_rows = ?metadata.effected_rows,
                "execution finished"
            ),
            _ => warn!(
                status = %status,
                duration_ms = duration.as_millis() as u64,
                failure = ?metadata.fatal.as_ref().map(|f| f.to_string()),
                "execution finished"
            ),
        }

        ExecutionOutcome {
            context,
            metadata: metadata.clone(),
            status,
            duration,
        }
    }
}

fn record_fatal(metadata: &mut ExecutionMetadata, failure: FailureInfo) {
    if let Err(e) = metadata.report_fatal(failure) {
        debug!(error = %e, "fatal failure arrived after finalization");
    }
}
