//! Evaluates lifecycle events against monitor rules.
//!
//! For each candidate monitor event the scanner loads the active rules whose
//! scope covers the job, keeps the ones whose threshold (if any) is met,
//! consults the limiter and hands one [`DispatchRecord`] per surviving rule to
//! the dispatcher. Duration thresholds are checked separately by
//! [`MonitorScanner::scan_running_durations`], once per (rule, fire instance).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use planar_events::{ConsumerError, EventConsumer};
use planar_execution::{FailureInfo, RunningExecutions};

use crate::dispatcher::HookDispatcher;
use crate::error::MonitorError;
use crate::event::{LifecycleEvent, MonitorEvent};
use crate::history::ExecutionHistory;
use crate::limiter::MonitorLimiter;
use crate::record::{DispatchRecord, ExecutionFacts, SystemDispatchRecord};
use crate::rules::{GroupDirectory, MonitorAction, MonitorCacheItem, MonitorGroup, RuleSource};

/// Limiter key used for system events, which have no job.
const SYSTEM_JOB_ID: &str = "__system__";

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Upper bound on one rule lookup.
    pub rule_lookup_timeout: Duration,
    pub environment: String,
    /// Read-only settings copied into every record.
    pub global_config: BTreeMap<String, String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rule_lookup_timeout: Duration::from_secs(5),
            environment: "default".to_string(),
            global_config: BTreeMap::new(),
        }
    }
}

/// Counts from one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Rules whose scope and threshold matched.
    pub matched: usize,
    /// Matches dropped by a mute or the rate limit.
    pub suppressed: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// The monitor scanner.
pub struct MonitorScanner {
    rules: Arc<dyn RuleSource>,
    groups: Arc<GroupDirectory>,
    history: ExecutionHistory,
    limiter: Arc<MonitorLimiter>,
    dispatcher: Arc<HookDispatcher>,
    config: ScannerConfig,
    duration_rules: RwLock<Vec<(MonitorCacheItem, MonitorAction)>>,
    /// (rule id, fire instance id) pairs already alerted for duration.
    duration_alerted: RwLock<HashSet<(i64, String)>>,
}

impl MonitorScanner {
    pub fn new(
        rules: Arc<dyn RuleSource>,
        groups: Arc<GroupDirectory>,
        limiter: Arc<MonitorLimiter>,
        dispatcher: Arc<HookDispatcher>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            rules,
            groups,
            history: ExecutionHistory::default(),
            limiter,
            dispatcher,
            config,
            duration_rules: RwLock::new(Vec::new()),
            duration_alerted: RwLock::new(HashSet::new()),
        }
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn limiter(&self) -> &Arc<MonitorLimiter> {
        &self.limiter
    }

    pub fn dispatcher(&self) -> &Arc<HookDispatcher> {
        &self.dispatcher
    }

    /// Load active rules for `event`, bounded by the lookup timeout.
    pub async fn lookup_rules(
        &self,
        event: MonitorEvent,
        job_id: Option<&str>,
        job_group: Option<&str>,
    ) -> Result<Vec<MonitorAction>, MonitorError> {
        let timeout = self.config.rule_lookup_timeout;
        tokio::time::timeout(timeout, self.rules.rules_for(event, job_id, job_group))
            .await
            .map_err(|_| MonitorError::RuleLookupTimeout(timeout))?
    }

    /// Rebuild the duration-threshold projection from the rule source.
    pub async fn refresh_duration_cache(&self) -> Result<usize, MonitorError> {
        let timeout = self.config.rule_lookup_timeout;
        let rules = tokio::time::timeout(timeout, self.rules.all_rules())
            .await
            .map_err(|_| MonitorError::RuleLookupTimeout(timeout))??;

        let cache: Vec<(MonitorCacheItem, MonitorAction)> = rules
            .into_iter()
            .filter_map(|rule| rule.cache_item().map(|item| (item, rule)))
            .collect();
        let count = cache.len();
        *self.duration_rules.write().await = cache;
        debug!(rules = count, "refreshed duration monitor cache");
        Ok(count)
    }

    /// Evaluate one lifecycle event now.
    pub async fn scan(&self, event: &LifecycleEvent) -> ScanReport {
        self.scan_at(event, Utc::now()).await
    }

    /// Evaluate one lifecycle event as of `now`.
    pub async fn scan_at(&self, event: &LifecycleEvent, now: DateTime<Utc>) -> ScanReport {
        if let LifecycleEvent::System { .. } = event {
            return self.scan_system(event, now).await;
        }

        let Some(context) = event.context() else {
            return ScanReport::default();
        };
        let job_id = context.job_id().to_string();
        let job_group = context.job.key.group.clone();

        if let LifecycleEvent::Finished { outcome } = event {
            self.history.record(&job_id, now, outcome.is_success());
        }

        let mut report = ScanReport::default();
        let mut records = Vec::new();

        for candidate in event.candidates() {
            let rules = match self
                .lookup_rules(candidate, Some(&job_id), Some(&job_group))
                .await
            {
                Ok(rules) => rules,
                Err(e) => {
                    error!(event = %candidate, job_id = %job_id, error = %e, "monitor rule lookup failed");
                    continue;
                }
            };

            for rule in rules {
                if candidate.has_threshold() && !self.threshold_met(candidate, &rule, event, &job_id, now) {
                    continue;
                }
                report.matched += 1;

                if !self.limiter.check(rule.id, &job_id, now).is_allowed() {
                    report.suppressed += 1;
                    continue;
                }

                let group = self.group_for(&rule).await;
                records.push(DispatchRecord::build(
                    candidate,
                    &rule,
                    context,
                    facts(event),
                    group,
                    self.config.global_config.clone(),
                ));
            }
        }

        if !records.is_empty() {
            info!(
                fire_instance_id = %context.fire_instance_id,
                records = records.len(),
                "dispatching monitor alerts"
            );
            let dispatched = self.dispatcher.dispatch(records).await;
            report.delivered = dispatched.delivered;
            report.failed = dispatched.failed;
        }
        report
    }

    async fn scan_system(&self, event: &LifecycleEvent, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::default();
        let LifecycleEvent::System {
            event,
            message,
            job_key,
            trigger_key,
            data,
        } = event
        else {
            return report;
        };
        let rules = match self.lookup_rules(*event, None, None).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(event = %event, error = %e, "monitor rule lookup failed");
                return report;
            }
        };

        let mut records = Vec::new();
        for rule in rules {
            report.matched += 1;
            if !self.limiter.check(rule.id, SYSTEM_JOB_ID, now).is_allowed() {
                report.suppressed += 1;
                continue;
            }
            let group = self.group_for(&rule).await;
            records.push(SystemDispatchRecord {
                event_id: event.id(),
                event_title: event.title().to_string(),
                monitor_id: rule.id,
                monitor_title: rule.title.clone(),
                hook: rule.hook.clone(),
                environment: self.config.environment.clone(),
                message: message.clone(),
                job_key: job_key.clone(),
                trigger_key: trigger_key.clone(),
                data: data.clone(),
                users: group.users.clone(),
                group,
                global_config: self.config.global_config.clone(),
            });
        }

        if !records.is_empty() {
            let dispatched = self.dispatcher.dispatch_system(records).await;
            report.delivered = dispatched.delivered;
            report.failed = dispatched.failed;
        }
        report
    }

    /// Alert on running executions that exceed a duration threshold.
    ///
    /// Each (rule, fire instance) pair alerts at most once.
    pub async fn scan_running_durations(&self, running: &RunningExecutions) -> ScanReport {
        self.scan_running_durations_at(running, Utc::now()).await
    }

    pub async fn scan_running_durations_at(
        &self,
        running: &RunningExecutions,
        now: DateTime<Utc>,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        let entries = running.entries();
        let live: HashSet<&str> = entries
            .iter()
            .map(|e| e.context.fire_instance_id.as_str())
            .collect();

        // Forget fire instances that are no longer running
        self.duration_alerted
            .write()
            .await
            .retain(|(_, fire)| live.contains(fire.as_str()));

        let cache = self.duration_rules.read().await.clone();
        if cache.is_empty() {
            return report;
        }

        let mut records = Vec::new();
        for entry in &entries {
            let context = &entry.context;
            let elapsed = context.elapsed(now);
            let job_id = context.job_id();

            for (item, rule) in &cache {
                if !item.applies_to(job_id, &context.job.key.group) || elapsed <= item.limit {
                    continue;
                }
                let key = (item.rule_id, context.fire_instance_id.clone());
                if self.duration_alerted.read().await.contains(&key) {
                    continue;
                }
                report.matched += 1;

                // A suppressed pair stays eligible for a later scan
                if !self.limiter.check(rule.id, job_id, now).is_allowed() {
                    report.suppressed += 1;
                    continue;
                }
                self.duration_alerted.write().await.insert(key);

                let metadata = entry.metadata.lock().await;
                let facts = ExecutionFacts {
                    run_duration_ms: Some(elapsed.as_millis() as u64),
                    progress: Some(metadata.progress),
                    effected_rows: metadata.effected_rows,
                    failure: None,
                };
                drop(metadata);

                warn!(
                    fire_instance_id = %context.fire_instance_id,
                    rule_id = rule.id,
                    elapsed_secs = elapsed.as_secs(),
                    limit_secs = item.limit.as_secs(),
                    "execution exceeded duration threshold"
                );
                let group = self.group_for(rule).await;
                records.push(DispatchRecord::build(
                    MonitorEvent::ExecutionDurationGreaterThanMinutes,
                    rule,
                    context,
                    facts,
                    group,
                    self.config.global_config.clone(),
                ));
            }
        }

        if !records.is_empty() {
            let dispatched = self.dispatcher.dispatch(records).await;
            report.delivered = dispatched.delivered;
            report.failed = dispatched.failed;
        }
        report
    }

    fn threshold_met(
        &self,
        candidate: MonitorEvent,
        rule: &MonitorAction,
        event: &LifecycleEvent,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(argument) = rule.numeric_argument() else {
            return false;
        };
        let rows = event.outcome().and_then(|o| o.metadata.effected_rows);

        match candidate {
            MonitorEvent::ExecutionFailTimesInRow => {
                self.history.consecutive_failures(job_id) as i64 >= argument
            }
            MonitorEvent::ExecutionFailTimesInHour => {
                let since = now - chrono::Duration::hours(1);
                self.history.failures_since(job_id, since) as i64 >= argument
            }
            MonitorEvent::ExecutionDurationGreaterThanMinutes => event
                .outcome()
                .is_some_and(|o| o.duration > Duration::from_secs(argument.max(0) as u64 * 60)),
            MonitorEvent::ExecutionEffectedRowsGreaterThan => rows.is_some_and(|r| r > argument),
            MonitorEvent::ExecutionEffectedRowsLessThan => rows.is_some_and(|r| r < argument),
            _ => true,
        }
    }

    async fn group_for(&self, rule: &MonitorAction) -> MonitorGroup {
        match self.groups.get(&rule.group).await {
            Some(group) => group,
            None => {
                warn!(rule_id = rule.id, group = %rule.group, "monitor group not found");
                MonitorGroup {
                    name: rule.group.clone(),
                    ..MonitorGroup::default()
                }
            }
        }
    }
}

/// Execution facts carried by a lifecycle event.
fn facts(event: &LifecycleEvent) -> ExecutionFacts {
    match event {
        LifecycleEvent::Finished { outcome }
        | LifecycleEvent::Retrying { outcome, .. }
        | LifecycleEvent::RetriesExhausted { outcome, .. } => ExecutionFacts {
            run_duration_ms: Some(outcome.duration.as_millis() as u64),
            progress: Some(outcome.metadata.progress),
            effected_rows: outcome.metadata.effected_rows,
            failure: outcome.metadata.fatal.clone(),
        },
        LifecycleEvent::ProgressChanged { progress, .. } => ExecutionFacts {
            progress: Some(*progress),
            ..ExecutionFacts::default()
        },
        LifecycleEvent::Vetoed { reason, .. } => ExecutionFacts {
            failure: Some(FailureInfo::with_kind("vetoed", reason.clone())),
            ..ExecutionFacts::default()
        },
        LifecycleEvent::Started { .. } | LifecycleEvent::System { .. } => ExecutionFacts::default(),
    }
}

#[async_trait]
impl EventConsumer<LifecycleEvent> for MonitorScanner {
    fn name(&self) -> &str {
        "monitor-scanner"
    }

    async fn consume(&self, event: LifecycleEvent) -> Result<(), ConsumerError> {
        let report = self.scan(&event).await;
        if report.matched > 0 {
            debug!(
                matched = report.matched,
                suppressed = report.suppressed,
                delivered = report.delivered,
                failed = report.failed,
                "monitor scan finished"
            );
        }
        Ok(())
    }
}
