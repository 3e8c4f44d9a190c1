//! Serializable failure chains.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A failure as it crosses the unit/host boundary.
///
/// Units may run in another process, so failures are carried as plain data:
/// a kind, a message and an optional inner cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Short classification (error type name, "timeout", "stopped", ...).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// The cause of this failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<FailureInfo>>,
}

impl FailureInfo {
    /// Kind used for failures raised by unit code.
    pub const KIND_ERROR: &'static str = "error";
    /// Kind used when a unit honoured a stop request.
    pub const KIND_STOPPED: &'static str = "stopped";
    /// Kind used when the host timed the unit out.
    pub const KIND_TIMEOUT: &'static str = "timeout";
    /// Kind used when the unit/host boundary broke.
    pub const KIND_TRANSPORT: &'static str = "transport";
    /// Kind used when a unit panicked.
    pub const KIND_PANIC: &'static str = "panic";
    /// Kind used for the summary raised by `check_aggregate_exception`.
    pub const KIND_AGGREGATE: &'static str = "aggregate";

    /// Create a failure with the default kind.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(Self::KIND_ERROR, message)
    }

    /// Create a failure with an explicit kind.
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            inner: None,
        }
    }

    /// Attach an inner cause.
    pub fn caused_by(mut self, inner: FailureInfo) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Build a failure chain from an error and its `source()` chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut messages = vec![error.to_string()];
        let mut source = error.source();
        while let Some(err) = source {
            messages.push(err.to_string());
            source = err.source();
        }

        let mut chain: Option<FailureInfo> = None;
        for message in messages.into_iter().rev() {
            let mut failure = FailureInfo::new(message);
            failure.inner = chain.map(Box::new);
            chain = Some(failure);
        }
        chain.unwrap_or_else(|| FailureInfo::new(error.to_string()))
    }

    /// The innermost failure of the chain.
    pub fn innermost(&self) -> &FailureInfo {
        let mut current = self;
        while let Some(inner) = current.inner.as_deref() {
            current = inner;
        }
        current
    }

    /// Message of the innermost failure of the chain.
    pub fn innermost_message(&self) -> &str {
        &self.innermost().message
    }

    /// Whether this failure is a transport failure.
    pub fn is_transport(&self) -> bool {
        self.kind == Self::KIND_TRANSPORT
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " (caused by {inner})")?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureInfo {}
