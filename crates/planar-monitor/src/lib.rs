//! Monitoring for Planar executions.
//!
//! Lifecycle events from the scheduler are matched against configured
//! monitor rules. Matches pass through a per-(rule, job) rate limiter and
//! manual mutes, then fan out to notification hooks:
//!
//! - **Rules**: [`MonitorAction`] scopes, thresholds and the [`RuleSource`] seam
//! - **Scanner**: turns a [`LifecycleEvent`] into dispatch records
//! - **Limiter**: fixed-window rate limiting and mutes
//! - **Hooks**: the [`Hook`] plugin contract, loaders and the registry
//! - **Dispatcher**: isolated, time-bounded hook calls

mod dispatcher;
mod error;
mod event;
mod history;
mod hook;
mod limiter;
mod process_hook;
mod record;
mod rules;
mod scanner;
pub mod test_context;

pub use dispatcher::{DispatchReport, HookDispatcher};
pub use error::{HookError, MonitorError};
pub use event::{LifecycleEvent, MonitorEvent};
pub use history::ExecutionHistory;
pub use hook::{Hook, HookLoader, HookRegistry, RefreshSummary, StaticHookLoader};
pub use limiter::{LimitDecision, LimiterConfig, MonitorLimiter, MuteScope};
pub use process_hook::{DirectoryHookLoader, ProcessHook};
pub use record::{DispatchRecord, ExecutionFacts, HookPayload, SystemDispatchRecord};
pub use rules::{
    GroupDirectory, InMemoryRules, MonitorAction, MonitorCacheItem, MonitorGroup, MonitorUser,
    RuleSource,
};
pub use scanner::{MonitorScanner, ScanReport, ScannerConfig};
