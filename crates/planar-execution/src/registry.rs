//! Table of currently running executions.
//!
//! Each live fire instance owns one entry. Entries for different fire
//! instances never contend; mutations of one entry are serialized through its
//! metadata mutex.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::context::{ExecutionContext, JobKey, TriggerKey};
use crate::error::ExecutionError;
use crate::metadata::ExecutionMetadata;

/// Cooperative stop flag for one execution.
///
/// The host only ever raises the flag; units poll it at safe points.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Raise the flag. Returns false if it was already raised.
    pub fn request(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to flag changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One running execution.
#[derive(Debug)]
pub struct RunningEntry {
    pub context: Arc<ExecutionContext>,
    pub metadata: Mutex<ExecutionMetadata>,
    pub stop: StopSignal,
}

/// Point-in-time view of a running execution, suitable for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningSnapshot {
    pub fire_instance_id: String,
    pub job_key: JobKey,
    pub job_id: String,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
    pub progress: u8,
    pub effected_rows: Option<i64>,
    pub stop_requested: bool,
    pub log: String,
}

/// Explicitly owned registry of live executions keyed by fire instance id.
#[derive(Debug, Default)]
pub struct RunningExecutions {
    entries: DashMap<String, Arc<RunningEntry>>,
}

impl RunningExecutions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new execution.
    ///
    /// Fails if the fire instance already has a live entry.
    pub fn register(
        &self,
        context: Arc<ExecutionContext>,
    ) -> Result<Arc<RunningEntry>, ExecutionError> {
        let id = context.fire_instance_id.clone();
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(ExecutionError::AlreadyRunning(id)),
            Entry::Vacant(slot) => {
                let entry = Arc::new(RunningEntry {
                    metadata: Mutex::new(ExecutionMetadata::new(id.clone())),
                    context,
                    stop: StopSignal::new(),
                });
                slot.insert(Arc::clone(&entry));
                debug!(fire_instance_id = %id, "registered execution");
                Ok(entry)
            }
        }
    }

    pub fn get(&self, fire_instance_id: &str) -> Option<Arc<RunningEntry>> {
        self.entries
            .get(fire_instance_id)
            .map(|e| Arc::clone(e.value()))
    }

    /// Remove a finished execution.
    pub fn remove(&self, fire_instance_id: &str) -> Option<Arc<RunningEntry>> {
        self.entries.remove(fire_instance_id).map(|(_, e)| e)
    }

    /// Ask a running execution to stop.
    ///
    /// Returns false if no such execution is running.
    pub fn request_stop(&self, fire_instance_id: &str) -> bool {
        match self.get(fire_instance_id) {
            Some(entry) => {
                if entry.stop.request() {
                    info!(fire_instance_id, "stop requested");
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All live entries.
    pub fn entries(&self) -> Vec<Arc<RunningEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Snapshot every live execution.
    pub async fn snapshot(&self) -> Vec<RunningSnapshot> {
        let mut snapshots = Vec::new();
        for entry in self.entries() {
            let metadata = entry.metadata.lock().await;
            snapshots.push(RunningSnapshot {
                fire_instance_id: entry.context.fire_instance_id.clone(),
                job_key: entry.context.job.key.clone(),
                job_id: entry.context.job_id().to_string(),
                trigger_key: entry.context.trigger.key.clone(),
                fire_time: entry.context.fire_time,
                progress: metadata.progress,
                effected_rows: metadata.effected_rows,
                stop_requested: entry.stop.is_requested(),
                log: metadata.log.clone(),
            });
        }
        snapshots.sort_by(|a, b| a.fire_time.cmp(&b.fire_time));
        snapshots
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use crate::context::{
        DataMap, ExecutionContext, JobDetails, JobKey, TriggerDetails, TriggerKey,
    };

    pub fn context(fire_instance_id: &str) -> ExecutionContext {
        let now = Utc::now();
        ExecutionContext::new(
            fire_instance_id,
            JobDetails {
                key: JobKey::new("reports", "daily"),
                id: "job-1".to_string(),
                job_type: "test".to_string(),
                description: None,
                durable: true,
                author: None,
                data: DataMap::new(),
            },
            TriggerDetails {
                key: TriggerKey::new("reports", "daily-trigger"),
                id: "trigger-1".to_string(),
                calendar: None,
                data: DataMap::new(),
            },
            now,
            now,
            None,
            None,
            "test",
        )
    }
}
