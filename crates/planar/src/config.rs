//! Daemon configuration loaded from a TOML file.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;

use planar_execution::{DataMap, ExecutorConfig, JobKey, TriggerKey, UnitKind};
use planar_monitor::{LimiterConfig, MonitorAction, MonitorGroup, ScannerConfig};
use planar_scheduler::{JobDefinition, RetryPolicy, SchedulerConfig, Trigger};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlanarConfig {
    /// Environment tag; the CLI flag overrides it.
    pub environment: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub hooks_dir: Option<PathBuf>,
    /// Read-only settings exposed to units and hooks.
    pub global: BTreeMap<String, String>,
    pub scheduler: SchedulerSection,
    pub executor: ExecutorSection,
    pub monitor: MonitorSection,
    pub producers: ProducerSection,
    pub daemon: DaemonSection,
    pub jobs: Vec<JobEntry>,
    pub triggers: Vec<TriggerEntry>,
    pub rules: Vec<MonitorAction>,
    pub groups: Vec<MonitorGroup>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Default retry budget for triggers without `__max_retries`.
    pub max_retries: u32,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub default_timeout_secs: Option<u64>,
    pub stop_grace_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: None,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub max_alerts_per_monitor: u32,
    pub max_alerts_period_secs: u64,
    pub manual_mute_max_period_secs: u64,
    pub rule_lookup_timeout_secs: u64,
    pub hook_timeout_secs: u64,
    pub duration_scan_interval_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            max_alerts_per_monitor: 10,
            max_alerts_period_secs: 3600,
            manual_mute_max_period_secs: 86_400,
            rule_lookup_timeout_secs: 5,
            hook_timeout_secs: 30,
            duration_scan_interval_secs: 60,
            eviction_interval_secs: 300,
        }
    }
}

/// Bounded channel capacities for the background producers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerSection {
    pub lifecycle_capacity: usize,
    pub audit_capacity: usize,
    pub security_capacity: usize,
    pub notification_capacity: usize,
}

impl Default for ProducerSection {
    fn default() -> Self {
        Self {
            lifecycle_capacity: 1024,
            audit_capacity: 256,
            security_capacity: 256,
            notification_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// How often the running-executions view is written to disk.
    pub persist_interval_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            persist_interval_secs: 30,
        }
    }
}

/// A `[[jobs]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub group: String,
    pub name: String,
    /// Stable id used for monitor scoping; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub unit: UnitKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub data: DataMap,
}

fn default_durable() -> bool {
    true
}

impl JobEntry {
    pub fn to_definition(&self) -> JobDefinition {
        let mut job = JobDefinition::new(JobKey::new(&self.group, &self.name), self.unit.clone());
        if let Some(id) = &self.id {
            job.id = id.clone();
        }
        job.description = self.description.clone();
        job.durable = self.durable;
        job.author = self.author.clone();
        job.data = self.data.clone();
        job
    }
}

/// A `[[triggers]]` entry. Exactly one of `interval_secs` and `at` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerEntry {
    pub group: String,
    pub name: String,
    pub job_group: String,
    pub job_name: String,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calendar: Option<String>,
    #[serde(default)]
    pub data: DataMap,
}

impl TriggerEntry {
    pub fn to_trigger(&self) -> Result<Trigger> {
        let key = TriggerKey::new(&self.group, &self.name);
        let job_key = JobKey::new(&self.job_group, &self.job_name);
        let mut trigger = match (self.interval_secs, self.at) {
            (Some(seconds), None) => Trigger::interval(key, job_key, seconds),
            (None, Some(at)) => Trigger::once(key, job_key, at),
            _ => {
                return Err(miette::miette!(
                    "trigger {} needs exactly one of interval_secs and at",
                    key
                ));
            }
        };
        trigger.calendar = self.calendar.clone();
        trigger.data = self.data.clone();
        Ok(trigger)
    }
}

impl PlanarConfig {
    /// Load a configuration file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).wrap_err_with(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).into_diagnostic()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject rules and triggers that can never work.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            rule.validate().into_diagnostic()?;
        }
        for trigger in &self.triggers {
            trigger.to_trigger()?;
        }
        Ok(())
    }

    pub fn scheduler_config(&self, environment: &str) -> SchedulerConfig {
        SchedulerConfig {
            environment: environment.to_string(),
            retry: RetryPolicy::new(self.scheduler.max_retries),
            shutdown_grace: Duration::from_secs(self.scheduler.shutdown_grace_secs),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_timeout: self.executor.default_timeout_secs.map(Duration::from_secs),
            stop_grace: Duration::from_secs(self.executor.stop_grace_secs),
            global_config: self.global.clone(),
        }
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            max_alerts_per_monitor: self.monitor.max_alerts_per_monitor,
            max_alerts_period: Duration::from_secs(self.monitor.max_alerts_period_secs),
            manual_mute_max_period: Duration::from_secs(self.monitor.manual_mute_max_period_secs),
        }
    }

    pub fn scanner_config(&self, environment: &str) -> ScannerConfig {
        ScannerConfig {
            rule_lookup_timeout: Duration::from_secs(self.monitor.rule_lookup_timeout_secs),
            environment: environment.to_string(),
            global_config: self.global.clone(),
        }
    }
}
