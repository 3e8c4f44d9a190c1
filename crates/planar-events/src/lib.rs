//! Fire-and-forget event delivery for Planar.
//!
//! Audit, security, notification and lifecycle records are published through
//! an [`EventProducer`] backed by a bounded channel and handled by a
//! background consumer loop. Publishing never blocks the caller: a full
//! channel defers the send to a detached task, a closed channel drops the
//! event with an error log.

mod consumer;
mod error;
mod producer;
mod records;

pub use consumer::{EventConsumer, JsonLinesConsumer, LogConsumer, spawn_consumer};
pub use error::{ConsumerError, PublishError};
pub use producer::{EventProducer, PublishOutcome};
pub use records::{AuditRecord, NotificationRecord, SecurityOutcome, SecurityRecord};
