//! Monitor rules, notification groups, and where they come from.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::MonitorError;
use crate::event::MonitorEvent;

fn default_true() -> bool {
    true
}

/// A configured (event, scope, hook, target) tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAction {
    pub id: i64,
    pub title: String,
    pub event: MonitorEvent,
    /// Threshold for events that compare a metric.
    #[serde(default)]
    pub argument: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_group: Option<String>,
    /// Name of the notification group to alert.
    pub group: String,
    pub hook: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl MonitorAction {
    /// True if the rule has neither a job id nor a job group.
    pub fn is_any_job(&self) -> bool {
        self.job_id.is_none() && self.job_group.is_none()
    }

    /// Whether the rule's scope covers a job.
    pub fn applies_to(&self, job_id: Option<&str>, job_group: Option<&str>) -> bool {
        if self.is_any_job() {
            return true;
        }
        let id_match = matches!((self.job_id.as_deref(), job_id), (Some(a), Some(b)) if a == b);
        let group_match =
            matches!((self.job_group.as_deref(), job_group), (Some(a), Some(b)) if a == b);
        id_match || group_match
    }

    /// Parse the argument as a number. Unparsable arguments never match.
    pub fn numeric_argument(&self) -> Option<i64> {
        let raw = self.argument.as_deref()?.trim();
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(rule_id = self.id, argument = raw, "monitor argument is not a number");
                None
            }
        }
    }

    /// Duration-threshold projection of this rule.
    pub fn cache_item(&self) -> Option<MonitorCacheItem> {
        if !self.active || self.event != MonitorEvent::ExecutionDurationGreaterThanMinutes {
            return None;
        }
        let minutes = u64::try_from(self.numeric_argument()?).ok()?;
        Some(MonitorCacheItem {
            rule_id: self.id,
            job_id: self.job_id.clone(),
            job_group: self.job_group.clone(),
            limit: Duration::from_secs(minutes * 60),
        })
    }

    /// Check that the rule can ever fire.
    pub fn validate(&self) -> Result<(), MonitorError> {
        let invalid = |reason: &str| MonitorError::InvalidRule {
            id: self.id,
            reason: reason.to_string(),
        };
        if self.hook.trim().is_empty() {
            return Err(invalid("hook name is empty"));
        }
        if self.group.trim().is_empty() {
            return Err(invalid("target group is empty"));
        }
        if self.event.has_threshold()
            && self
                .argument
                .as_deref()
                .and_then(|a| a.trim().parse::<i64>().ok())
                .is_none()
        {
            return Err(invalid("threshold event needs a numeric argument"));
        }
        Ok(())
    }
}

/// Duration-threshold rule prepared for the periodic running scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorCacheItem {
    pub rule_id: i64,
    pub job_id: Option<String>,
    pub job_group: Option<String>,
    pub limit: Duration,
}

impl MonitorCacheItem {
    pub fn applies_to(&self, job_id: &str, job_group: &str) -> bool {
        match (&self.job_id, &self.job_group) {
            (None, None) => true,
            (id, group) => {
                id.as_deref() == Some(job_id) || group.as_deref() == Some(job_group)
            }
        }
    }
}

/// Someone who receives notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorUser {
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// A named set of users a rule notifies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorGroup {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub users: Vec<MonitorUser>,
}

/// Source of monitor rules.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Active rules for `event` whose scope covers the job.
    async fn rules_for(
        &self,
        event: MonitorEvent,
        job_id: Option<&str>,
        job_group: Option<&str>,
    ) -> Result<Vec<MonitorAction>, MonitorError>;

    /// Every configured rule.
    async fn all_rules(&self) -> Result<Vec<MonitorAction>, MonitorError>;
}

/// Rules held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRules {
    rules: RwLock<Vec<MonitorAction>>,
}

impl InMemoryRules {
    pub fn new(rules: Vec<MonitorAction>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub async fn add(&self, rule: MonitorAction) {
        self.rules.write().await.push(rule);
    }

    pub async fn replace(&self, rules: Vec<MonitorAction>) {
        *self.rules.write().await = rules;
    }
}

#[async_trait]
impl RuleSource for InMemoryRules {
    async fn rules_for(
        &self,
        event: MonitorEvent,
        job_id: Option<&str>,
        job_group: Option<&str>,
    ) -> Result<Vec<MonitorAction>, MonitorError> {
        let rules = self.rules.read().await;
        Ok(rules
            .iter()
            .filter(|r| r.active && r.event == event)
            .filter(|r| event.is_system() || r.applies_to(job_id, job_group))
            .cloned()
            .collect())
    }

    async fn all_rules(&self) -> Result<Vec<MonitorAction>, MonitorError> {
        Ok(self.rules.read().await.clone())
    }
}

/// Notification groups by name.
#[derive(Debug, Default)]
pub struct GroupDirectory {
    groups: RwLock<HashMap<String, MonitorGroup>>,
}

impl GroupDirectory {
    pub fn new(groups: Vec<MonitorGroup>) -> Self {
        Self {
            groups: RwLock::new(groups.into_iter().map(|g| (g.name.clone(), g)).collect()),
        }
    }

    pub async fn get(&self, name: &str) -> Option<MonitorGroup> {
        self.groups.read().await.get(name).cloned()
    }

    pub async fn upsert(&self, group: MonitorGroup) {
        self.groups.write().await.insert(group.name.clone(), group);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn rule(id: i64, event: MonitorEvent, hook: &str) -> MonitorAction {
        MonitorAction {
            id,
            title: format!("rule {id}"),
            event,
            argument: None,
            job_id: None,
            job_group: None,
            group: "ops".to_string(),
            hook: hook.to_string(),
            active: true,
        }
    }
}
