//! Observability records carried by the producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Something changed in the scheduler's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub at: DateTime<Utc>,
    /// Who or what made the change.
    pub actor: String,
    /// Dotted action name, e.g. `job.added`.
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub details: Value,
}

impl AuditRecord {
    pub fn new(actor: impl Into<String>, action: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            at: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityOutcome {
    Allowed,
    Denied,
}

/// A privileged operation was attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRecord {
    pub id: String,
    pub at: DateTime<Utc>,
    pub principal: String,
    pub operation: String,
    pub outcome: SecurityOutcome,
    pub reason: Option<String>,
}

impl SecurityRecord {
    pub fn new(
        principal: impl Into<String>,
        operation: impl Into<String>,
        outcome: SecurityOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            at: Utc::now(),
            principal: principal.into(),
            operation: operation.into(),
            outcome,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Result of delivering one notification through a hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub at: DateTime<Utc>,
    pub hook: String,
    /// Event title that caused the notification.
    pub event: String,
    pub monitor: Option<String>,
    pub fire_instance_id: Option<String>,
    pub delivered: bool,
    pub error: Option<String>,
}

impl NotificationRecord {
    pub fn delivered(hook: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            at: Utc::now(),
            hook: hook.into(),
            event: event.into(),
            monitor: None,
            fire_instance_id: None,
            delivered: true,
            error: None,
        }
    }

    pub fn failed(hook: impl Into<String>, event: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            error: Some(error.into()),
            ..Self::delivered(hook, event)
        }
    }

    pub fn for_monitor(mut self, monitor: impl Into<String>, fire_instance_id: Option<String>) -> Self {
        self.monitor = Some(monitor.into());
        self.fire_instance_id = fire_instance_id;
        self
    }
}
