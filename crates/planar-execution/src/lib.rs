//! Execution coordination for Planar jobs.
//!
//! This crate owns everything that happens between "a trigger fired" and
//! "the execution is finalized":
//!
//! - **Context**: the immutable per-fire [`ExecutionContext`]
//! - **Metadata**: the mutable per-fire [`ExecutionMetadata`] record
//! - **Protocol**: versioned, serialized frames exchanged with execution units
//! - **Channel**: the unit-side [`JobChannel`] and its transports
//! - **Host**: the host-side [`ChannelHost`] applying requests to metadata
//! - **Registry**: the table of [`RunningExecutions`] keyed by fire instance id
//! - **Executor**: runs one unit, enforces timeout and stop, finalizes once
//! - **Units**: process and REST execution units plus an in-process catalog

pub mod channel;
pub mod context;
mod error;
pub mod executor;
mod failure;
pub mod host;
pub mod metadata;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod rest;
pub mod unit;

pub use channel::{JobChannel, LocalTransport, Transport};
pub use context::{
    DataMap, ExecutionContext, JobDetails, JobKey, TriggerDetails, TriggerKey, keys,
};
pub use error::{ChannelError, ExecutionError, MetadataError, ProtocolError};
pub use executor::{ExecutionObserver, ExecutionOutcome, ExecutionStatus, Executor, ExecutorConfig};
pub use failure::FailureInfo;
pub use host::ChannelHost;
pub use metadata::{AggregateFailure, DataChange, ExecutionMetadata, MetadataState};
pub use process::{ProcessUnit, StdioTransport};
pub use protocol::{PROTOCOL_VERSION, Reply, Request, StartupSnapshot};
pub use registry::{RunningEntry, RunningExecutions, RunningSnapshot, StopSignal};
pub use rest::RestUnit;
pub use unit::{ExecutionUnit, UnitCatalog, UnitError, UnitKind};
