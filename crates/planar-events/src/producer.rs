//! Bounded, non-blocking event producer.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use crate::PublishError;

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enqueued immediately.
    Queued,
    /// The channel was full; a detached task awaits capacity.
    Deferred,
    /// The channel is closed or no runtime was available; the event was lost.
    Dropped,
}

/// Sending half of a bounded event channel.
///
/// Cloning is cheap; all clones feed the same consumer loop.
#[derive(Debug)]
pub struct EventProducer<T> {
    name: String,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for EventProducer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> EventProducer<T> {
    /// Create a producer and the receiver its consumer loop reads from.
    pub fn channel(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Publish an event without blocking.
    pub fn publish(&self, event: T) -> PublishOutcome {
        match self.try_publish(event) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(producer = %self.name, error = %e, "dropping event");
                PublishOutcome::Dropped
            }
        }
    }

    /// Like [`publish`](Self::publish), but reports a lost event as an error.
    pub fn try_publish(&self, event: T) -> Result<PublishOutcome, PublishError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(PublishOutcome::Queued),
            Err(TrySendError::Closed(_)) => Err(PublishError::Closed(self.name.clone())),
            Err(TrySendError::Full(event)) => {
                let handle = tokio::runtime::Handle::try_current()
                    .map_err(|_| PublishError::NoRuntime(self.name.clone()))?;
                debug!(producer = %self.name, "channel full, deferring send");
                let tx = self.tx.clone();
                let name = self.name.clone();
                handle.spawn(async move {
                    if tx.send(event).await.is_err() {
                        warn!(producer = %name, "consumer went away before a deferred send");
                    }
                });
                Ok(PublishOutcome::Deferred)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_queues_while_capacity_remains() {
        let (producer, mut rx) = EventProducer::channel("audit", 2);
        assert_eq!(producer.publish(1), PublishOutcome::Queued);
        assert_eq!(producer.publish(2), PublishOutcome::Queued);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_full_channel_defers_and_still_delivers() {
        let (producer, mut rx) = EventProducer::channel("audit", 1);
        assert_eq!(producer.publish("first"), PublishOutcome::Queued);
        assert_eq!(producer.publish("second"), PublishOutcome::Deferred);

        assert_eq!(rx.recv().await, Some("first"));
        assert_eq!(rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn test_closed_channel_drops() {
        let (producer, rx) = EventProducer::channel("security", 4);
        drop(rx);

        assert!(producer.is_closed());
        assert_eq!(producer.publish(7), PublishOutcome::Dropped);
        assert!(matches!(
            producer.try_publish(8),
            Err(PublishError::Closed(name)) if name == "security"
        ));
    }

    #[test]
    fn test_full_channel_without_runtime_drops() {
        let (producer, _rx) = EventProducer::channel("notification", 1);
        assert_eq!(producer.publish(1), PublishOutcome::Queued);
        assert_eq!(producer.publish(2), PublishOutcome::Dropped);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (producer, mut rx) = EventProducer::channel("audit", 0);
        assert_eq!(producer.publish(1), PublishOutcome::Queued);
        assert_eq!(rx.try_recv().ok(), Some(1));
    }
}
