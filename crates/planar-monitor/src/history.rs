//! Recent execution results per job, for failure-count thresholds.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Default number of results kept per job.
pub const DEFAULT_HISTORY_PER_JOB: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HistoryEntry {
    finished_at: DateTime<Utc>,
    success: bool,
}

/// Bounded per-job history of finished executions.
#[derive(Debug)]
pub struct ExecutionHistory {
    per_job: DashMap<String, VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_PER_JOB)
    }
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            per_job: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a finished execution.
    pub fn record(&self, job_id: &str, finished_at: DateTime<Utc>, success: bool) {
        let mut entries = self.per_job.entry(job_id.to_string()).or_default();
        entries.push_back(HistoryEntry {
            finished_at,
            success,
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Failures since the most recent success.
    pub fn consecutive_failures(&self, job_id: &str) -> usize {
        self.per_job
            .get(job_id)
            .map(|entries| entries.iter().rev().take_while(|e| !e.success).count())
            .unwrap_or(0)
    }

    /// Failures finished at or after `since`.
    pub fn failures_since(&self, job_id: &str, since: DateTime<Utc>) -> usize {
        self.per_job
            .get(job_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| !e.success && e.finished_at >= since)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop jobs whose latest result is older than `before`.
    pub fn evict_before(&self, before: DateTime<Utc>) -> usize {
        let len = self.per_job.len();
        self.per_job
            .retain(|_, entries| entries.back().is_some_and(|e| e.finished_at >= before));
        len - self.per_job.len()
    }
}
