//! Daemon command for running the Planar engine.
//!
//! The daemon wires the engine together:
//! - Scheduler loop firing due triggers through the executor
//! - Lifecycle producer feeding the monitor scanner
//! - Audit, security and notification producers with their consumers
//! - Maintenance loop (limiter eviction, duration scans, running-state persistence)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::{IntoDiagnostic, Result};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use planar_events::{
    AuditRecord, EventConsumer, EventProducer, JsonLinesConsumer, LogConsumer, NotificationRecord,
    SecurityOutcome, SecurityRecord, spawn_consumer,
};
use planar_execution::{
    ExecutionContext, ExecutionObserver, Executor, RunningExecutions, UnitCatalog,
};
use planar_monitor::{
    DirectoryHookLoader, GroupDirectory, HookDispatcher, HookLoader, HookRegistry, InMemoryRules,
    LifecycleEvent, MonitorEvent, MonitorLimiter, MonitorScanner,
};
use planar_scheduler::{Scheduler, SchedulerEvent, SchedulerListener};

use crate::config::PlanarConfig;

/// File holding the persisted view of running executions.
pub const RUNNING_STATE_FILE: &str = "running.json";

/// How long execution history is kept for threshold metrics.
const HISTORY_RETENTION_HOURS: i64 = 24;

/// Resolved daemon options.
pub struct DaemonOptions {
    pub config: PlanarConfig,
    pub environment: String,
    pub state_dir: PathBuf,
    pub hooks_dir: Option<PathBuf>,
}

/// Map a scheduler event onto the monitor's lifecycle event.
pub fn to_lifecycle(event: &SchedulerEvent) -> LifecycleEvent {
    match event {
        SchedulerEvent::Vetoed { context, reason } => LifecycleEvent::Vetoed {
            context: Arc::clone(context),
            reason: reason.clone(),
        },
        SchedulerEvent::Started { context } => LifecycleEvent::Started {
            context: Arc::clone(context),
        },
        SchedulerEvent::Finished { outcome } => LifecycleEvent::Finished {
            outcome: Arc::clone(outcome),
        },
        SchedulerEvent::RetryScheduled {
            outcome, attempt, ..
        } => LifecycleEvent::Retrying {
            outcome: Arc::clone(outcome),
            attempt: *attempt,
        },
        SchedulerEvent::RetriesExhausted { outcome, attempts } => {
            LifecycleEvent::RetriesExhausted {
                outcome: Arc::clone(outcome),
                attempts: *attempts,
            }
        }
    }
}

/// Forwards scheduler events to the lifecycle and audit producers.
struct LifecycleBridge {
    lifecycle: EventProducer<LifecycleEvent>,
    audit: EventProducer<AuditRecord>,
}

impl SchedulerListener for LifecycleBridge {
    fn on_event(&self, event: &SchedulerEvent) {
        if let Some(record) = audit_record(event) {
            self.audit.publish(record);
        }
        self.lifecycle.publish(to_lifecycle(event));
    }
}

fn audit_record(event: &SchedulerEvent) -> Option<AuditRecord> {
    match event {
        SchedulerEvent::Finished { outcome } => Some(
            AuditRecord::new(
                "scheduler",
                "execution.finished",
                &outcome.context.fire_instance_id,
            )
            .with_details(json!({
                "job": outcome.context.job.key.to_string(),
                "status": outcome.status,
                "duration_ms": outcome.duration.as_millis() as u64,
            })),
        ),
        SchedulerEvent::RetryScheduled {
            trigger_key,
            attempt,
            start,
            ..
        } => Some(
            AuditRecord::new("scheduler", "trigger.retry_scheduled", trigger_key.to_string())
                .with_details(json!({ "attempt": attempt, "start": start })),
        ),
        _ => None,
    }
}

/// Publishes progress changes as lifecycle events.
struct ProgressBridge {
    lifecycle: EventProducer<LifecycleEvent>,
}

impl ExecutionObserver for ProgressBridge {
    fn progress_changed(&self, context: &Arc<ExecutionContext>, progress: u8) {
        self.lifecycle.publish(LifecycleEvent::ProgressChanged {
            context: Arc::clone(context),
            progress,
        });
    }
}

/// The wired engine.
pub struct Engine {
    pub scheduler: Arc<Scheduler>,
    pub catalog: Arc<UnitCatalog>,
    pub scanner: Arc<MonitorScanner>,
    pub registry: Arc<HookRegistry>,
    pub lifecycle: EventProducer<LifecycleEvent>,
    pub audit: EventProducer<AuditRecord>,
    pub security: EventProducer<SecurityRecord>,
    consumers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build the engine and load jobs, triggers, rules and hooks from config.
    pub async fn build(
        options: &DaemonOptions,
        extra_loaders: Vec<Arc<dyn HookLoader>>,
    ) -> Result<Self> {
        let config = &options.config;
        tokio::fs::create_dir_all(&options.state_dir)
            .await
            .into_diagnostic()?;

        // Producers and their consumers
        let mut consumers = Vec::new();
        let (audit, audit_rx) = EventProducer::channel("audit", config.producers.audit_capacity);
        consumers.push(spawn_consumer(
            audit_rx,
            Arc::new(JsonLinesConsumer::<AuditRecord>::new(
                "audit",
                options.state_dir.join("audit.jsonl"),
            )),
        ));
        let (security, security_rx) =
            EventProducer::channel("security", config.producers.security_capacity);
        consumers.push(spawn_consumer(
            security_rx,
            Arc::new(JsonLinesConsumer::<SecurityRecord>::new(
                "security",
                options.state_dir.join("security.jsonl"),
            )),
        ));
        let (notifications, notification_rx) = EventProducer::<NotificationRecord>::channel(
            "notifications",
            config.producers.notification_capacity,
        );
        consumers.push(spawn_consumer(
            notification_rx,
            Arc::new(LogConsumer::<NotificationRecord>::new("notifications")),
        ));
        let (lifecycle, lifecycle_rx) =
            EventProducer::channel("lifecycle", config.producers.lifecycle_capacity);

        // Hooks
        let mut loaders = extra_loaders;
        if let Some(dir) = &options.hooks_dir {
            loaders.push(Arc::new(DirectoryHookLoader::new(dir)));
            security.publish(
                SecurityRecord::new("daemon", "hooks.load", SecurityOutcome::Allowed)
                    .with_reason(format!("hooks directory {}", dir.display())),
            );
        }
        let registry = Arc::new(HookRegistry::new(loaders));
        let summary = registry.refresh().await;
        for failure in &summary.failed {
            lifecycle.publish(LifecycleEvent::system(
                MonitorEvent::HookLoadFailed,
                failure.clone(),
            ));
        }

        // Monitor
        let limiter = Arc::new(MonitorLimiter::new(config.limiter_config()));
        let dispatcher = HookDispatcher::new(
            Arc::clone(&registry),
            Duration::from_secs(config.monitor.hook_timeout_secs),
        )
        .with_notifications(notifications);
        let scanner = Arc::new(MonitorScanner::new(
            Arc::new(InMemoryRules::new(config.rules.clone())),
            Arc::new(GroupDirectory::new(config.groups.clone())),
            limiter,
            Arc::new(dispatcher),
            config.scanner_config(&options.environment),
        ));
        if let Err(e) = scanner.refresh_duration_cache().await {
            warn!(error = %e, "failed to build duration monitor cache");
        }
        consumers.push(spawn_consumer(
            lifecycle_rx,
            Arc::clone(&scanner) as Arc<dyn EventConsumer<LifecycleEvent>>,
        ));

        // Execution and scheduling
        let executor_config = config.executor_config();
        let catalog = Arc::new(UnitCatalog::new(executor_config.stop_grace));
        let executor = Executor::new(RunningExecutions::new(), executor_config).with_observer(
            Arc::new(ProgressBridge {
                lifecycle: lifecycle.clone(),
            }),
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(executor),
            Arc::clone(&catalog),
            config.scheduler_config(&options.environment),
        ));
        scheduler
            .add_listener(Arc::new(LifecycleBridge {
                lifecycle: lifecycle.clone(),
                audit: audit.clone(),
            }))
            .await;

        for entry in &config.jobs {
            let job = entry.to_definition();
            audit.publish(
                AuditRecord::new("config", "job.added", job.key.to_string())
                    .with_details(json!({ "id": job.id, "type": job.unit.type_name() })),
            );
            scheduler.add_job(job).await.into_diagnostic()?;
        }
        for entry in &config.triggers {
            let trigger = entry.to_trigger()?;
            audit.publish(AuditRecord::new(
                "config",
                "trigger.scheduled",
                trigger.key.to_string(),
            ));
            scheduler.schedule_trigger(trigger).await.into_diagnostic()?;
        }

        info!(
            jobs = config.jobs.len(),
            triggers = config.triggers.len(),
            rules = config.rules.len(),
            hooks = summary.loaded,
            environment = %options.environment,
            "engine built"
        );

        Ok(Self {
            scheduler,
            catalog,
            scanner,
            registry,
            lifecycle,
            audit,
            security,
            consumers,
        })
    }

    /// Stop accepting events, clear hooks and wait for consumers to drain.
    pub async fn shutdown(self) {
        let Engine {
            scheduler,
            scanner,
            registry,
            lifecycle,
            audit,
            security,
            consumers,
            ..
        } = self;

        // Dispatch the shutdown notice before the hooks go away
        scanner
            .scan(&LifecycleEvent::system(
                MonitorEvent::SchedulerShutdown,
                "scheduler shutting down",
            ))
            .await;

        // Producers live on in the scheduler's listener and observer
        drop(scheduler);
        drop(lifecycle);
        drop(audit);
        drop(security);
        drop(scanner);

        for handle in consumers {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("event consumer did not drain in time");
            }
        }
        registry.clear().await;
    }
}

/// Write the running-executions view with an atomic replace.
pub async fn persist_running(running: &RunningExecutions, path: &Path) -> std::io::Result<usize> {
    let snapshot = running.snapshot().await;
    let json = serde_json::to_vec_pretty(&snapshot).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(snapshot.len())
}

/// Run periodic maintenance until shutdown.
fn spawn_maintenance(
    engine: &Engine,
    config: &PlanarConfig,
    state_dir: &Path,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let scanner = Arc::clone(&engine.scanner);
    let running = Arc::clone(engine.scheduler.running());
    let state_path = state_dir.join(RUNNING_STATE_FILE);

    let mut eviction =
        tokio::time::interval(Duration::from_secs(config.monitor.eviction_interval_secs.max(1)));
    let mut duration_scan = tokio::time::interval(Duration::from_secs(
        config.monitor.duration_scan_interval_secs.max(1),
    ));
    let mut persist =
        tokio::time::interval(Duration::from_secs(config.daemon.persist_interval_secs.max(1)));

    tokio::spawn(async move {
        info!("maintenance started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = eviction.tick() => {
                    let now = Utc::now();
                    let limits = scanner.limiter().evict_stale(now);
                    let history = scanner
                        .history()
                        .evict_before(now - chrono::Duration::hours(HISTORY_RETENTION_HOURS));
                    debug!(limits, history, "evicted stale monitor state");
                }

                _ = duration_scan.tick() => {
                    if let Err(e) = scanner.refresh_duration_cache().await {
                        warn!(error = %e, "failed to refresh duration monitor cache");
                    }
                    let report = scanner.scan_running_durations(&running).await;
                    if report.matched > 0 {
                        info!(matched = report.matched, delivered = report.delivered, "duration scan finished");
                    }
                }

                _ = persist.tick() => {
                    match persist_running(&running, &state_path).await {
                        Ok(count) => debug!(count, path = %state_path.display(), "persisted running executions"),
                        Err(e) => error!(error = %e, path = %state_path.display(), "failed to persist running executions"),
                    }
                }
            }
        }

        // Final snapshot after the scheduler has drained
        if let Err(e) = persist_running(&running, &state_path).await {
            error!(error = %e, "failed to persist running executions at shutdown");
        }
        info!("maintenance stopped");
    })
}

pub async fn run(options: DaemonOptions) -> Result<()> {
    info!(
        environment = %options.environment,
        state_dir = %options.state_dir.display(),
        "starting Planar daemon"
    );

    let engine = Engine::build(&options, Vec::new()).await?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    engine.lifecycle.publish(LifecycleEvent::system(
        MonitorEvent::SchedulerStarted,
        format!("scheduler started in {}", options.environment),
    ));

    let scheduler_handle = tokio::spawn(Arc::clone(&engine.scheduler).run(shutdown_rx.clone()));
    let maintenance_handle =
        spawn_maintenance(&engine, &options.config, &options.state_dir, shutdown_rx.clone());

    // Wait for shutdown signal
    let mut main_shutdown_rx = shutdown_rx.clone();
    loop {
        if main_shutdown_rx.changed().await.is_err() || *main_shutdown_rx.borrow() {
            break;
        }
    }

    info!("shutting down daemon tasks");

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task failed");
        engine.lifecycle.publish(LifecycleEvent::system(
            MonitorEvent::SchedulerError,
            e.to_string(),
        ));
    }
    let _ = maintenance_handle.await;

    engine.shutdown().await;
    info!("daemon shut down gracefully");
    Ok(())
}
