//! Error types for monitoring and hook dispatch.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while evaluating monitor rules.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The rule source did not answer in time.
    #[error("rule lookup timed out after {0:?}")]
    RuleLookupTimeout(Duration),

    /// The rule source failed.
    #[error("rule source error: {0}")]
    RuleSource(String),

    /// A rule is malformed.
    #[error("invalid monitor rule {id}: {reason}")]
    InvalidRule { id: i64, reason: String },

    #[error("hook error: {0}")]
    Hook(#[from] HookError),
}

/// Errors raised by hooks and hook loaders.
#[derive(Debug, Error)]
pub enum HookError {
    /// No hook is registered under this name.
    #[error("hook not found: {0}")]
    NotFound(String),

    /// The hook did not finish in time.
    #[error("hook {hook} timed out after {after:?}")]
    Timeout { hook: String, after: Duration },

    /// The hook panicked.
    #[error("hook {0} panicked")]
    Panicked(String),

    /// The hook reported a failure.
    #[error("hook {hook} failed: {message}")]
    Failed { hook: String, message: String },

    /// The hook process could not be run.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
