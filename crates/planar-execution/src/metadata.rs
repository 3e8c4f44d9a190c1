//! Per-fire execution metadata.
//!
//! One [`ExecutionMetadata`] exists per live fire instance. It is created when
//! the fire starts, mutated only through channel requests, and finalized
//! exactly once when the unit completes by any path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MetadataError;
use crate::failure::FailureInfo;

/// Lifecycle state of a metadata record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataState {
    /// Registered but the unit has not started.
    #[default]
    Created,
    /// The unit is running and may mutate the record.
    Running,
    /// The outcome is fixed; further mutations are dropped.
    Finalized,
}

/// A non-fatal failure collected during an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateFailure {
    pub failure: FailureInfo,
    /// How long (in seconds) the unit tolerates this failure before it
    /// should be treated as significant. Informational for hooks and reports.
    pub tolerance_seconds: u32,
    pub recorded_at: DateTime<Utc>,
}

/// A staged change to the job's data map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum DataChange {
    Put(String),
    Remove,
}

/// Mutable record of one execution's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub fire_instance_id: String,
    pub state: MetadataState,
    pub progress: u8,
    pub effected_rows: Option<i64>,
    pub log: String,
    pub aggregate: Vec<AggregateFailure>,
    /// Whether `check_aggregate_exception` has been called.
    pub aggregate_checked: bool,
    pub fatal: Option<FailureInfo>,
    pub success: bool,
    pub running: bool,
    pub data_changes: BTreeMap<String, DataChange>,
    pub started_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl ExecutionMetadata {
    /// Create a record for a fire instance.
    pub fn new(fire_instance_id: impl Into<String>) -> Self {
        Self {
            fire_instance_id: fire_instance_id.into(),
            state: MetadataState::Created,
            progress: 0,
            effected_rows: None,
            log: String::new(),
            aggregate: Vec::new(),
            aggregate_checked: false,
            fatal: None,
            success: false,
            running: false,
            data_changes: BTreeMap::new(),
            started_at: Utc::now(),
            finalized_at: None,
        }
    }

    /// Mark the unit as started.
    pub fn start(&mut self) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.state = MetadataState::Running;
        self.running = true;
        self.started_at = Utc::now();
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.state == MetadataState::Finalized
    }

    /// Append a line of text to the execution log.
    pub fn append_log(&mut self, text: &str) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.log.push_str(text);
        self.log.push('\n');
        Ok(())
    }

    /// Store `clamp(floor(100 * current / total), 0, 100)`.
    ///
    /// A non-positive `total` leaves progress unchanged. Returns the stored
    /// progress.
    pub fn update_progress(&mut self, current: i64, total: i64) -> Result<u8, MetadataError> {
        self.ensure_open()?;
        if total > 0 {
            let percent = (i128::from(current) * 100).div_euclid(i128::from(total));
            self.progress = percent.clamp(0, 100) as u8;
        }
        Ok(self.progress)
    }

    /// Overwrite the effected-rows counter.
    pub fn set_effected_rows(&mut self, value: i64) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.effected_rows = Some(value);
        Ok(())
    }

    /// Add one to the effected-rows counter, treating "unset" as zero.
    pub fn increase_effected_rows(&mut self) -> Result<i64, MetadataError> {
        self.ensure_open()?;
        let value = self.effected_rows.unwrap_or(0).saturating_add(1);
        self.effected_rows = Some(value);
        Ok(value)
    }

    /// Stage a job data write.
    pub fn put_job_data(&mut self, key: &str, value: &str) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.data_changes
            .insert(key.to_string(), DataChange::Put(value.to_string()));
        Ok(())
    }

    /// Stage a job data removal.
    pub fn remove_job_data(&mut self, key: &str) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.data_changes.insert(key.to_string(), DataChange::Remove);
        Ok(())
    }

    /// Collect a non-fatal failure. The run continues.
    pub fn add_aggregate_exception(
        &mut self,
        failure: FailureInfo,
        tolerance_seconds: u32,
    ) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.aggregate.push(AggregateFailure {
            failure,
            tolerance_seconds,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    /// Turn collected failures into one fatal failure.
    ///
    /// Returns `Ok(Ok(()))` when nothing was collected and `Ok(Err(summary))`
    /// when the run is now failed. The summary is recorded only while no fatal
    /// failure exists, so repeated checks leave the log untouched.
    pub fn check_aggregate_exception(
        &mut self,
    ) -> Result<Result<(), FailureInfo>, MetadataError> {
        self.ensure_open()?;
        self.aggregate_checked = true;
        if self.aggregate.is_empty() {
            return Ok(Ok(()));
        }

        let summary = summarize_aggregate(&self.aggregate);
        if self.fatal.is_none() {
            self.fatal = Some(summary.clone());
        }
        Ok(Err(summary))
    }

    /// Record a fatal failure reported by the unit.
    pub fn report_fatal(&mut self, failure: FailureInfo) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.record_fatal(failure);
        Ok(())
    }

    /// Fix the outcome. Safe to call more than once.
    pub fn finalize(&mut self) -> bool {
        if self.is_finalized() {
            debug!(
                fire_instance_id = %self.fire_instance_id,
                "finalize called on finalized execution"
            );
            return self.success;
        }

        self.progress = 100;
        self.running = false;
        self.success = self.is_successful();
        self.state = MetadataState::Finalized;
        self.finalized_at = Some(Utc::now());
        self.success
    }

    /// `fatal == None && (aggregate empty OR never checked)`.
    pub fn is_successful(&self) -> bool {
        self.fatal.is_none() && (self.aggregate.is_empty() || !self.aggregate_checked)
    }

    fn record_fatal(&mut self, failure: FailureInfo) {
        match &self.fatal {
            None => self.fatal = Some(failure),
            Some(existing) => {
                debug!(
                    fire_instance_id = %self.fire_instance_id,
                    existing = %existing,
                    "fatal failure already recorded, logging the new one"
                );
                self.log.push_str(&format!("[fatal] {failure}\n"));
            }
        }
    }

    fn ensure_open(&self) -> Result<(), MetadataError> {
        if self.is_finalized() {
            Err(MetadataError::Finalized(self.fire_instance_id.clone()))
        } else {
            Ok(())
        }
    }
}

fn summarize_aggregate(collected: &[AggregateFailure]) -> FailureInfo {
    let mut message = format!("{} failure(s) collected during execution", collected.len());
    for (i, item) in collected.iter().enumerate() {
        message.push_str(&format!("\n  [{}] {}", i + 1, item.failure.message));
    }

    let mut summary = FailureInfo::with_kind(FailureInfo::KIND_AGGREGATE, message);
    if let Some(first) = collected.first() {
        summary = summary.caused_by(first.failure.clone());
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn running() -> ExecutionMetadata {
        let mut metadata = ExecutionMetadata::new("fire-1");
        metadata.start().unwrap();
        metadata
    }

    #[test]
    fn test_progress_is_floored_and_clamped() {
        let mut m = running();
        assert_eq!(m.update_progress(1, 3).unwrap(), 33);
        assert_eq!(m.update_progress(2, 3).unwrap(), 66);
        assert_eq!(m.update_progress(250, 100).unwrap(), 100);
        assert_eq!(m.update_progress(-5, 100).unwrap(), 0);
    }

    #[test]
    fn test_progress_with_zero_total_is_ignored() {
        let mut m = running();
        m.update_progress(40, 100).unwrap();
        assert_eq!(m.update_progress(3, 0).unwrap(), 40);
    }

    #[test]
    fn test_increase_from_unset_starts_at_one() {
        let mut m = running();
        assert_eq!(m.effected_rows, None);
        assert_eq!(m.increase_effected_rows().unwrap(), 1);
        m.set_effected_rows(10).unwrap();
        assert_eq!(m.increase_effected_rows().unwrap(), 11);
    }

    #[test]
    fn test_log_is_append_only() {
        let mut m = running();
        m.append_log("first").unwrap();
        m.append_log("second").unwrap();
        assert_eq!(m.log, "first\nsecond\n");
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut m = running();
        m.update_progress(10, 100).unwrap();
        let first = m.finalize();
        let snapshot = m.clone();
        let second = m.finalize();

        assert!(first);
        assert_eq!(first, second);
        assert_eq!(m.progress, 100);
        assert_eq!(m.finalized_at, snapshot.finalized_at);
    }

    #[test]
    fn test_progress_then_fatal_finalizes_failed() {
        let mut m = running();
        m.update_progress(50, 100).unwrap();
        m.report_fatal(FailureInfo::new("boom")).unwrap();
        let success = m.finalize();

        assert!(!success);
        assert_eq!(m.progress, 100);
        assert_eq!(m.fatal.as_ref().map(|f| f.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_mutations_after_finalize_are_rejected() {
        let mut m = running();
        m.finalize();
        assert_eq!(
            m.append_log("late"),
            Err(MetadataError::Finalized("fire-1".to_string()))
        );
        assert!(m.set_effected_rows(5).is_err());
        assert_eq!(m.effected_rows, None);
        assert!(m.log.is_empty());
    }

    #[test]
    fn test_check_aggregate_empty_does_not_fail() {
        let mut m = running();
        assert_eq!(m.check_aggregate_exception().unwrap(), Ok(()));
        assert!(m.finalize());
    }

    #[test]
    fn test_check_aggregate_references_all_failures() {
        let mut m = running();
        for i in 0..3 {
            m.add_aggregate_exception(FailureInfo::new(format!("item {i} failed")), 60)
                .unwrap();
        }

        let summary = m.check_aggregate_exception().unwrap().unwrap_err();
        assert_eq!(summary.kind, FailureInfo::KIND_AGGREGATE);
        assert!(summary.message.starts_with("3 failure(s)"));
        for i in 0..3 {
            assert!(summary.message.contains(&format!("item {i} failed")));
        }
        assert!(!m.finalize());
    }

    #[test]
    fn test_repeated_check_logs_nothing() {
        let mut m = running();
        m.add_aggregate_exception(FailureInfo::new("row 7 rejected"), 30)
            .unwrap();

        let first = m.check_aggregate_exception().unwrap().unwrap_err();
        let second = m.check_aggregate_exception().unwrap().unwrap_err();
        assert_eq!(first.message, second.message);
        assert_eq!(m.fatal.as_ref().unwrap().message, first.message);
        assert!(!m.log.contains("[fatal]"), "{}", m.log);
    }

    #[test]
    fn test_check_after_reported_fatal_keeps_first() {
        let mut m = running();
        m.report_fatal(FailureInfo::new("connection lost")).unwrap();
        m.add_aggregate_exception(FailureInfo::new("row 7 rejected"), 30)
            .unwrap();

        assert!(m.check_aggregate_exception().unwrap().is_err());
        assert!(m.check_aggregate_exception().unwrap().is_err());
        assert_eq!(m.fatal.as_ref().unwrap().message, "connection lost");
        assert!(!m.log.contains("[fatal]"), "{}", m.log);
    }

    #[test]
    fn test_unchecked_aggregate_does_not_fail() {
        let mut m = running();
        m.add_aggregate_exception(FailureInfo::new("soft"), 0).unwrap();
        assert!(m.finalize());
        assert_eq!(m.aggregate.len(), 1);
    }

    #[test]
    fn test_first_fatal_wins() {
        let mut m = running();
        m.report_fatal(FailureInfo::new("first")).unwrap();
        m.report_fatal(FailureInfo::new("second")).unwrap();
        assert_eq!(m.fatal.as_ref().unwrap().message, "first");
        assert!(m.log.contains("second"));
    }

    #[test]
    fn test_data_changes_last_write_wins() {
        let mut m = running();
        m.put_job_data("k", "1").unwrap();
        m.remove_job_data("k").unwrap();
        m.put_job_data("k", "2").unwrap();
        assert_eq!(m.data_changes.get("k"), Some(&DataChange::Put("2".to_string())));
    }

    #[derive(Debug, Clone)]
    enum RowsCall {
        Set(i64),
        Increase,
    }

    fn rows_call() -> impl Strategy<Value = RowsCall> {
        prop_oneof![
            (-1000i64..1000).prop_map(RowsCall::Set),
            Just(RowsCall::Increase),
        ]
    }

    proptest! {
        #[test]
        fn effected_rows_match_sequential_application(
            calls in prop::collection::vec(rows_call(), 0..50)
        ) {
            let mut m = running();
            let mut expected: Option<i64> = None;

            for call in &calls {
                match call {
                    RowsCall::Set(n) => {
                        m.set_effected_rows(*n).unwrap();
                        expected = Some(*n);
                    }
                    RowsCall::Increase => {
                        m.increase_effected_rows().unwrap();
                        expected = Some(expected.unwrap_or(0) + 1);
                    }
                }
            }

            prop_assert_eq!(m.effected_rows, expected);
        }

        #[test]
        fn progress_always_within_bounds(current in any::<i64>(), total in any::<i64>()) {
            let mut m = running();
            let progress = m.update_progress(current, total).unwrap();
            prop_assert!(progress <= 100);
        }
    }
}
