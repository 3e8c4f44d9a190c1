//! Error types for execution coordination.

use thiserror::Error;

/// Errors raised while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON for the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The peer speaks a protocol version this host does not understand.
    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    /// A frame arrived that is not valid at this point of the exchange.
    #[error("unexpected frame: {0}")]
    Unexpected(String),
}

/// Errors raised by a channel transport.
///
/// Any of these means the boundary between unit and host is broken; the
/// host treats the execution as an unhandled failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Frame encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO on the underlying pipe failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer went away before answering.
    #[error("channel closed: {0}")]
    Closed(String),

    /// The host rejected the request.
    #[error("host rejected request: {0}")]
    Rejected(String),
}

/// Errors raised by metadata mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// The execution has already been finalized; the mutation was dropped.
    #[error("execution {0} is already finalized")]
    Finalized(String),
}

/// Errors raised by the executor and the running-executions registry.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A live execution already exists for this fire instance id.
    #[error("fire instance already running: {0}")]
    AlreadyRunning(String),

    /// No live execution exists for this fire instance id.
    #[error("fire instance not found: {0}")]
    NotFound(String),

    /// No registered unit matches the requested name.
    #[error("unknown execution unit: {0}")]
    UnknownUnit(String),

    /// Channel failure outside of a running unit.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}
