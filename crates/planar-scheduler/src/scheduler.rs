//! Trigger scheduler implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use planar_execution::{
    DataChange, ExecutionContext, ExecutionOutcome, Executor, JobKey, RunningExecutions,
    TriggerKey, UnitCatalog,
};

use crate::retry::{RetryDecision, RetryPolicy};
use crate::types::{JobDefinition, Trigger, TriggerSchedule, TriggerStatus};
use crate::SchedulerError;

/// Minimum sleep duration between scheduler checks.
const MIN_SLEEP_SECS: u64 = 1;

/// Maximum sleep duration between scheduler checks.
const MAX_SLEEP_SECS: u64 = 60;

/// Name prefix for triggers created by [`Scheduler::trigger_job_now`].
const MANUAL_TRIGGER_PREFIX: &str = "MT_";

/// Lifecycle notifications emitted while firing triggers.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The fire was abandoned before the unit started.
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
    /// A failed fire was rescheduled as a retry trigger.
    RetryScheduled {
        outcome: Arc<ExecutionOutcome>,
        trigger_key: TriggerKey,
        attempt: u32,
        start: DateTime<Utc>,
    },
    /// A failed fire ended its retry lineage.
    RetriesExhausted {
        outcome: Arc<ExecutionOutcome>,
        attempts: u32,
    },
}

/// Receives [`SchedulerEvent`]s.
///
/// Called inline on the firing task, so implementations must not block.
pub trait SchedulerListener: Send + Sync {
    fn on_event(&self, event: &SchedulerEvent);
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Environment tag copied into every execution context.
    pub environment: String,
    pub retry: RetryPolicy,
    /// How long shutdown waits for in-flight executions after requesting stop.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// The trigger scheduler.
pub struct Scheduler {
    jobs: RwLock<BTreeMap<JobKey, JobDefinition>>,
    triggers: RwLock<Vec<Trigger>>,
    executor: Arc<Executor>,
    catalog: Arc<UnitCatalog>,
    listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
    /// Wakes the run loop when the earliest fire time may have moved.
    wake: Notify,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(executor: Arc<Executor>, catalog: Arc<UnitCatalog>, config: SchedulerConfig) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            triggers: RwLock::new(Vec::new()),
            executor,
            catalog,
            listeners: RwLock::new(Vec::new()),
            wake: Notify::new(),
            config,
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Live executions started by this scheduler.
    pub fn running(&self) -> &Arc<RunningExecutions> {
        self.executor.running()
    }

    /// Add a new job.
    #[tracing::instrument(skip(self, job), fields(job = %job.key))]
    pub async fn add_job(&self, job: JobDefinition) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.key) {
            return Err(SchedulerError::JobExists(job.key));
        }
        info!(job_id = %job.id, unit = job.unit.type_name(), "added job");
        jobs.insert(job.key.clone(), job);
        Ok(())
    }

    /// Remove a job and all of its triggers.
    pub async fn remove_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.remove(key).is_none() {
            return Err(SchedulerError::JobNotFound(key.clone()));
        }
        let mut triggers = self.triggers.write().await;
        let before = triggers.len();
        triggers.retain(|t| &t.job_key != key);
        info!(job = %key, triggers = before - triggers.len(), "removed job");
        Ok(())
    }

    pub async fn get_job(&self, key: &JobKey) -> Option<JobDefinition> {
        self.jobs.read().await.get(key).cloned()
    }

    pub async fn list_jobs(&self) -> Vec<JobDefinition> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Add a trigger.
    ///
    /// The check for an existing key and the insert happen under one lock, so
    /// concurrent callers can never register the same trigger twice.
    pub async fn schedule_trigger(&self, trigger: Trigger) -> Result<(), SchedulerError> {
        let jobs = self.jobs.read().await;
        if !jobs.contains_key(&trigger.job_key) {
            return Err(SchedulerError::JobNotFound(trigger.job_key));
        }
        if let TriggerSchedule::Interval { seconds: 0 } = trigger.schedule {
            return Err(SchedulerError::InvalidConfig(format!(
                "trigger {} has a zero interval",
                trigger.key
            )));
        }

        let mut triggers = self.triggers.write().await;
        if triggers.iter().any(|t| t.key == trigger.key) {
            return Err(SchedulerError::TriggerExists(trigger.key));
        }
        debug!(trigger = %trigger.key, job = %trigger.job_key, next_fire = %trigger.next_fire, "scheduled trigger");
        triggers.push(trigger);
        self.wake.notify_one();
        Ok(())
    }

    /// Remove a trigger. Returns false if it did not exist.
    pub async fn unschedule_trigger(&self, key: &TriggerKey) -> bool {
        let mut triggers = self.triggers.write().await;
        let before = triggers.len();
        triggers.retain(|t| &t.key != key);
        before != triggers.len()
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Option<Trigger> {
        self.triggers
            .read()
            .await
            .iter()
            .find(|t| &t.key == key)
            .cloned()
    }

    pub async fn list_triggers(&self) -> Vec<Trigger> {
        self.triggers.read().await.clone()
    }

    /// Schedule a one-shot trigger that fires `job` immediately.
    pub async fn trigger_job_now(
        &self,
        job: &JobKey,
        data: BTreeMap<String, String>,
    ) -> Result<TriggerKey, SchedulerError> {
        let key = TriggerKey::new(
            job.group.clone(),
            format!("{MANUAL_TRIGGER_PREFIX}{}", uuid::Uuid::new_v4()),
        );
        let mut trigger = Trigger::once(key.clone(), job.clone(), Utc::now());
        trigger.data = data;
        self.schedule_trigger(trigger).await?;
        info!(job = %job, trigger = %key, "triggered job manually");
        Ok(key)
    }

    /// Ask a running execution to stop. Returns false if it is not running.
    pub fn stop_execution(&self, fire_instance_id: &str) -> bool {
        self.executor.stop(fire_instance_id)
    }

    /// Run the scheduler loop until `shutdown_rx` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduler starting");
        let mut in_flight = JoinSet::new();

        loop {
            // Check for shutdown
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "trigger task failed");
                }
            }

            for trigger in self.take_due_triggers().await {
                let scheduler = Arc::clone(&self);
                in_flight.spawn(async move {
                    scheduler.fire(trigger).await;
                });
            }

            let sleep_duration = self.calculate_sleep_duration().await;

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = self.wake.notified() => {
                    debug!("trigger table changed, recalculating sleep");
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        self.drain(in_flight).await;
        info!("scheduler shut down gracefully");
    }

    /// Stop in-flight executions and wait for them, up to the shutdown grace.
    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        for entry in self.running().entries() {
            self.running().request_stop(&entry.context.fire_instance_id);
        }
        info!(count = in_flight.len(), "waiting for in-flight executions");

        let wait = async { while in_flight.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, wait).await.is_err() {
            warn!(
                remaining = in_flight.len(),
                "in-flight executions outlived shutdown grace, aborting"
            );
            in_flight.abort_all();
        }

        let mut triggers = self.triggers.write().await;
        for trigger in triggers.iter_mut().filter(|t| t.status == TriggerStatus::Running) {
            trigger.status = TriggerStatus::Interrupted;
        }
    }

    /// Take every due trigger and mark it as running.
    ///
    /// Returned triggers carry their status from before the take, so an
    /// interrupted trigger can be recognised as recovering.
    pub async fn take_due_triggers(&self) -> Vec<Trigger> {
        let now = Utc::now();
        let mut triggers = self.triggers.write().await;
        let mut due = Vec::new();
        for trigger in triggers.iter_mut().filter(|t| t.is_due_at(now)) {
            due.push(trigger.clone());
            trigger.status = TriggerStatus::Running;
        }
        due
    }

    /// Fire one trigger now, regardless of its fire time.
    ///
    /// Returns `None` when the fire was vetoed.
    pub async fn fire_trigger(
        &self,
        key: &TriggerKey,
    ) -> Result<Option<Arc<ExecutionOutcome>>, SchedulerError> {
        let trigger = {
            let mut triggers = self.triggers.write().await;
            let trigger = triggers
                .iter_mut()
                .find(|t| &t.key == key)
                .ok_or_else(|| SchedulerError::TriggerNotFound(key.clone()))?;
            if trigger.status == TriggerStatus::Running {
                return Err(SchedulerError::TriggerBusy(key.clone()));
            }
            let taken = trigger.clone();
            trigger.status = TriggerStatus::Running;
            taken
        };
        Ok(self.fire(trigger).await)
    }

    /// Calculate how long to sleep until the next trigger is due.
    pub async fn calculate_sleep_duration(&self) -> Duration {
        let triggers = self.triggers.read().await;
        let now = Utc::now();

        let next_due = triggers
            .iter()
            .filter_map(|t| match t.status {
                TriggerStatus::Pending => Some(t.next_fire),
                TriggerStatus::Interrupted => Some(now),
                TriggerStatus::Running => None,
            })
            .min();

        let secs = match next_due {
            Some(next) => {
                let diff = (next - now).num_seconds();
                (diff.max(MIN_SLEEP_SECS as i64) as u64).min(MAX_SLEEP_SECS)
            }
            None => MAX_SLEEP_SECS,
        };

        Duration::from_secs(secs)
    }

    /// Execute a taken trigger.
    ///
    /// This handles the execution itself, durable data, trigger rescheduling
    /// and the retry decision.
    #[tracing::instrument(skip(self, trigger), fields(trigger = %trigger.key, job = %trigger.job_key))]
    async fn fire(&self, mut trigger: Trigger) -> Option<Arc<ExecutionOutcome>> {
        let fired_at = Utc::now();

        if self.config.retry.on_fired(&mut trigger) {
            let data = trigger.data.clone();
            self.update_trigger(&trigger.key, |t| t.data = data).await;
        }

        let Some(job) = self.get_job(&trigger.job_key).await else {
            warn!("trigger references a missing job");
            self.complete_trigger(&trigger, fired_at, false).await;
            return None;
        };

        let mut context = ExecutionContext::new(
            uuid::Uuid::new_v4().to_string(),
            job.details(),
            trigger.details(),
            fired_at,
            trigger.next_fire,
            trigger.calculate_next_fire(fired_at),
            trigger.last_fire,
            self.config.environment.clone(),
        );
        context.recovering = trigger.status == TriggerStatus::Interrupted;
        let context = Arc::new(context);

        let unit = match self.catalog.resolve(&job.unit) {
            Ok(unit) => unit,
            Err(e) => {
                self.veto(&trigger, context, fired_at, e.to_string()).await;
                return None;
            }
        };

        self.emit(&SchedulerEvent::Started {
            context: Arc::clone(&context),
        })
        .await;

        let outcome = match self.executor.execute(Arc::clone(&context), unit).await {
            Ok(outcome) => Arc::new(outcome),
            Err(e) => {
                self.veto(&trigger, context, fired_at, e.to_string()).await;
                return None;
            }
        };

        self.emit(&SchedulerEvent::Finished {
            outcome: Arc::clone(&outcome),
        })
        .await;

        if !outcome.metadata.data_changes.is_empty() {
            if job.durable {
                self.apply_data_changes(&job.key, &outcome.metadata.data_changes)
                    .await;
            } else {
                debug!(
                    changes = outcome.metadata.data_changes.len(),
                    "discarding data changes of non-durable job"
                );
            }
        }

        self.complete_trigger(&trigger, fired_at, outcome.is_success())
            .await;

        match self
            .config
            .retry
            .on_complete(&trigger, outcome.is_success(), Utc::now())
        {
            RetryDecision::Retry {
                trigger: retry,
                attempt,
            } => {
                let trigger_key = retry.key.clone();
                let start = retry.next_fire;
                match self.schedule_trigger(retry).await {
                    Ok(()) => {
                        self.emit(&SchedulerEvent::RetryScheduled {
                            outcome: Arc::clone(&outcome),
                            trigger_key,
                            attempt,
                            start,
                        })
                        .await;
                    }
                    Err(e) => {
                        error!(retry_trigger = %trigger_key, error = %e, "failed to schedule retry");
                    }
                }
            }
            RetryDecision::Exhausted { attempts, .. } => {
                self.emit(&SchedulerEvent::RetriesExhausted {
                    outcome: Arc::clone(&outcome),
                    attempts,
                })
                .await;
            }
            RetryDecision::NotEnabled | RetryDecision::Succeeded => {}
        }

        Some(outcome)
    }

    async fn veto(
        &self,
        trigger: &Trigger,
        context: Arc<ExecutionContext>,
        fired_at: DateTime<Utc>,
        reason: String,
    ) {
        warn!(fire_instance_id = %context.fire_instance_id, reason = %reason, "fire vetoed");
        self.emit(&SchedulerEvent::Vetoed { context, reason }).await;
        self.complete_trigger(trigger, fired_at, false).await;
    }

    /// Record a finished fire: one-shots are removed, intervals rescheduled.
    async fn complete_trigger(&self, fired: &Trigger, fired_at: DateTime<Utc>, success: bool) {
        let mut triggers = self.triggers.write().await;
        match fired.calculate_next_fire(fired_at) {
            None => {
                triggers.retain(|t| t.key != fired.key);
                debug!(trigger = %fired.key, success, "one-shot trigger finished");
            }
            Some(next_fire) => {
                if let Some(t) = triggers.iter_mut().find(|t| t.key == fired.key) {
                    t.last_fire = Some(fired_at);
                    t.next_fire = next_fire;
                    t.fire_count += 1;
                    t.status = TriggerStatus::Pending;
                    debug!(trigger = %fired.key, next_fire = %next_fire, success, "rescheduled interval trigger");
                    self.wake.notify_one();
                }
            }
        }
    }

    async fn update_trigger(&self, key: &TriggerKey, update: impl FnOnce(&mut Trigger)) {
        let mut triggers = self.triggers.write().await;
        if let Some(trigger) = triggers.iter_mut().find(|t| &t.key == key) {
            update(trigger);
        }
    }

    /// Apply staged data changes to a durable job.
    async fn apply_data_changes(&self, key: &JobKey, changes: &BTreeMap<String, DataChange>) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(key) else {
            warn!(job = %key, "job removed before its data changes could be applied");
            return;
        };
        for (name, change) in changes {
            match change {
                DataChange::Put(value) => {
                    job.data.insert(name.clone(), value.clone());
                }
                DataChange::Remove => {
                    job.data.remove(name);
                }
            }
        }
        info!(job = %key, changes = changes.len(), "applied job data changes");
    }

    async fn emit(&self, event: &SchedulerEvent) {
        for listener in self.listeners.read().await.iter() {
            listener.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use planar_execution::{
        ExecutionStatus, ExecutorConfig, ExecutionUnit, FailureInfo, JobChannel, UnitError,
        UnitKind,
    };

    use super::*;

    struct CursorUnit;

    #[async_trait]
    impl ExecutionUnit for CursorUnit {
        fn kind(&self) -> &str {
            "cursor"
        }

        async fn execute(&self, channel: JobChannel) -> Result<(), UnitError> {
            let next = channel
                .setting("cursor")
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(0)
                + 1;
            channel.put_job_data("cursor", next.to_string()).await?;
            channel.remove_job_data("stale").await?;
            Ok(())
        }
    }

    struct FailingUnit;

    #[async_trait]
    impl ExecutionUnit for FailingUnit {
        fn kind(&self) -> &str {
            "failing"
        }

        async fn execute(&self, _channel: JobChannel) -> Result<(), UnitError> {
            Err(FailureInfo::new("upstream unavailable").into())
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<String>>,
    }

    impl SchedulerListener for RecordingListener {
        fn on_event(&self, event: &SchedulerEvent) {
            let name = match event {
                SchedulerEvent::Vetoed { .. } => "vetoed",
                SchedulerEvent::Started { .. } => "started",
                SchedulerEvent::Finished { .. } => "finished",
                SchedulerEvent::RetryScheduled { .. } => "retry",
                SchedulerEvent::RetriesExhausted { .. } => "exhausted",
            };
            self.events.lock().unwrap().push(name.to_string());
        }
    }

    fn scheduler() -> Arc<Scheduler> {
        let catalog = Arc::new(UnitCatalog::default());
        catalog.register("cursor", Arc::new(CursorUnit));
        catalog.register("failing", Arc::new(FailingUnit));
        let executor = Arc::new(Executor::new(
            RunningExecutions::new(),
            ExecutorConfig::default(),
        ));
        Arc::new(Scheduler::new(executor, catalog, SchedulerConfig::default()))
    }

    fn job(name: &str, unit: &str) -> JobDefinition {
        JobDefinition::new(
            JobKey::new("etl", name),
            UnitKind::Registered {
                name: unit.to_string(),
            },
        )
    }

    #[test]
    fn test_sleep_bounds() {
        assert_eq!(MIN_SLEEP_SECS, 1);
        assert_eq!(MAX_SLEEP_SECS, 60);
        assert!(MIN_SLEEP_SECS < MAX_SLEEP_SECS);
    }

    #[tokio::test]
    async fn test_add_job_rejects_duplicates() {
        let scheduler = scheduler();
        scheduler.add_job(job("import", "cursor")).await.unwrap();
        let err = scheduler.add_job(job("import", "cursor")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobExists(_)));
    }

    #[tokio::test]
    async fn test_schedule_trigger_is_atomic_per_key() {
        let scheduler = scheduler();
        scheduler.add_job(job("import", "cursor")).await.unwrap();

        let key = TriggerKey::new("etl", "hourly");
        let trigger = Trigger::interval(key.clone(), JobKey::new("etl", "import"), 3600);
        scheduler.schedule_trigger(trigger.clone()).await.unwrap();

        let err = scheduler.schedule_trigger(trigger).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TriggerExists(k) if k == key));
        assert_eq!(scheduler.list_triggers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_trigger_requires_job() {
        let scheduler = scheduler();
        let trigger = Trigger::interval(
            TriggerKey::new("etl", "hourly"),
            JobKey::new("etl", "missing"),
            60,
        );
        let err = scheduler.schedule_trigger(trigger).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_take_due_fires_each_trigger_once() {
        let scheduler = scheduler();
        scheduler.add_job(job("import", "cursor")).await.unwrap();
        scheduler
            .schedule_trigger(Trigger::interval(
                TriggerKey::new("etl", "hourly"),
                JobKey::new("etl", "import"),
                3600,
            ))
            .await
            .unwrap();

        assert_eq!(scheduler.take_due_triggers().await.len(), 1);
        assert!(scheduler.take_due_triggers().await.is_empty());

        let err = scheduler
            .fire_trigger(&TriggerKey::new("etl", "hourly"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TriggerBusy(_)));
    }

    #[tokio::test]
    async fn test_durable_job_keeps_execution_data() {
        let scheduler = scheduler();
        let mut definition = job("import", "cursor");
        definition.data.insert("stale".to_string(), "x".to_string());
        scheduler.add_job(definition).await.unwrap();

        let key = TriggerKey::new("etl", "hourly");
        scheduler
            .schedule_trigger(Trigger::interval(key.clone(), JobKey::new("etl", "import"), 3600))
            .await
            .unwrap();

        scheduler.fire_trigger(&key).await.unwrap().unwrap();
        scheduler.fire_trigger(&key).await.unwrap().unwrap();

        let stored = scheduler.get_job(&JobKey::new("etl", "import")).await.unwrap();
        assert_eq!(stored.data.get("cursor").map(String::as_str), Some("2"));
        assert!(!stored.data.contains_key("stale"));

        let trigger = scheduler.get_trigger(&key).await.unwrap();
        assert_eq!(trigger.fire_count, 2);
        assert_eq!(trigger.status, TriggerStatus::Pending);
        assert!(trigger.next_fire > Utc::now());
    }

    #[tokio::test]
    async fn test_non_durable_job_discards_execution_data() {
        let scheduler = scheduler();
        let mut definition = job("import", "cursor");
        definition.durable = false;
        scheduler.add_job(definition).await.unwrap();

        let key = scheduler
            .trigger_job_now(&JobKey::new("etl", "import"), BTreeMap::new())
            .await
            .unwrap();
        let outcome = scheduler.fire_trigger(&key).await.unwrap().unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Success);
        let stored = scheduler.get_job(&JobKey::new("etl", "import")).await.unwrap();
        assert!(stored.data.is_empty());
        // One-shot triggers are removed after firing.
        assert!(scheduler.get_trigger(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_unit_is_vetoed() {
        let scheduler = scheduler();
        let listener = Arc::new(RecordingListener::default());
        scheduler.add_listener(listener.clone()).await;
        scheduler.add_job(job("import", "nope")).await.unwrap();

        let key = scheduler
            .trigger_job_now(&JobKey::new("etl", "import"), BTreeMap::new())
            .await
            .unwrap();
        assert!(scheduler.fire_trigger(&key).await.unwrap().is_none());
        assert_eq!(*listener.events.lock().unwrap(), vec!["vetoed"]);
    }

    #[tokio::test]
    async fn test_failure_without_span_never_retries() {
        let scheduler = scheduler();
        let listener = Arc::new(RecordingListener::default());
        scheduler.add_listener(listener.clone()).await;
        scheduler.add_job(job("import", "failing")).await.unwrap();

        let key = scheduler
            .trigger_job_now(&JobKey::new("etl", "import"), BTreeMap::new())
            .await
            .unwrap();
        let outcome = scheduler.fire_trigger(&key).await.unwrap().unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Fail);
        assert!(scheduler.list_triggers().await.is_empty());
        assert_eq!(*listener.events.lock().unwrap(), vec!["started", "finished"]);
    }

    #[tokio::test]
    async fn test_run_loop_fires_due_trigger_and_shuts_down() {
        let scheduler = scheduler();
        let listener = Arc::new(RecordingListener::default());
        scheduler.add_listener(listener.clone()).await;
        scheduler.add_job(job("import", "cursor")).await.unwrap();
        scheduler
            .schedule_trigger(Trigger::interval(
                TriggerKey::new("etl", "hourly"),
                JobKey::new("etl", "import"),
                3600,
            ))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

        for _ in 0..200 {
            if listener.events.lock().unwrap().contains(&"finished".to_string()) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(listener.events.lock().unwrap().contains(&"finished".to_string()));
        let stored = scheduler.get_job(&JobKey::new("etl", "import")).await.unwrap();
        assert_eq!(stored.data.get("cursor").map(String::as_str), Some("1"));
    }

    async fn wait_for_event(
        listener: &RecordingListener,
        name: &str,
        count: usize,
        within: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            let seen = listener
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| *e == name)
                .count();
            if seen >= count {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_run_loop_fires_retry_after_its_span() {
        let scheduler = scheduler();
        let listener = Arc::new(RecordingListener::default());
        scheduler.add_listener(listener.clone()).await;
        scheduler.add_job(job("import", "failing")).await.unwrap();
        scheduler
            .schedule_trigger(
                Trigger::once(
                    TriggerKey::new("etl", "nightly"),
                    JobKey::new("etl", "import"),
                    Utc::now(),
                )
                .with_data("__retry_span", "1")
                .with_data("__max_retries", "1"),
            )
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

        // Nothing else is pending while the first fire runs, so the loop
        // would otherwise sleep for the full maximum.
        let fired_twice = wait_for_event(&listener, "finished", 2, Duration::from_secs(10)).await;
        let exhausted = wait_for_event(&listener, "exhausted", 1, Duration::from_secs(2)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(fired_twice, "retry did not fire: {:?}", listener.events.lock().unwrap());
        assert!(exhausted);
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec!["started", "finished", "retry", "started", "finished", "exhausted"]
        );
        assert!(scheduler.list_triggers().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_wakes_for_trigger_added_while_idle() {
        let scheduler = scheduler();
        let listener = Arc::new(RecordingListener::default());
        scheduler.add_listener(listener.clone()).await;
        scheduler.add_job(job("import", "cursor")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

        // Let the loop settle into its idle sleep first.
        sleep(Duration::from_millis(100)).await;
        scheduler
            .trigger_job_now(&JobKey::new("etl", "import"), BTreeMap::new())
            .await
            .unwrap();

        let finished = wait_for_event(&listener, "finished", 1, Duration::from_secs(5)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(finished, "manual trigger did not fire while the loop was idle");
    }
}
