//! Background consumer loops.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ConsumerError;

/// Handles events read from a producer's channel.
#[async_trait]
pub trait EventConsumer<T>: Send + Sync {
    fn name(&self) -> &str;

    async fn consume(&self, event: T) -> Result<(), ConsumerError>;
}

/// Run `consumer` over every event received on `rx` until all producers are
/// dropped. A failing event is logged and the loop moves on.
pub fn spawn_consumer<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    consumer: Arc<dyn EventConsumer<T>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = consumer.consume(event).await {
                warn!(consumer = consumer.name(), error = %e, "event consumer failed");
            }
        }
        info!(consumer = consumer.name(), "event consumer stopped");
    })
}

/// Writes each event as a structured log line.
pub struct LogConsumer<T> {
    name: String,
    _marker: PhantomData<fn(T)>,
}

impl<T> LogConsumer<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Serialize + Send + 'static> EventConsumer<T> for LogConsumer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, event: T) -> Result<(), ConsumerError> {
        let record = serde_json::to_string(&event)?;
        info!(consumer = %self.name, record = %record, "event");
        Ok(())
    }
}

/// Appends each event as one JSON line to a file.
pub struct JsonLinesConsumer<T> {
    name: String,
    path: PathBuf,
    _marker: PhantomData<fn(T)>,
}

impl<T> JsonLinesConsumer<T> {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl<T: Serialize + Send + 'static> EventConsumer<T> for JsonLinesConsumer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, event: T) -> Result<(), ConsumerError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
