//! End-to-end retry lineage through the scheduler.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use planar_execution::{
    ExecutionUnit, Executor, ExecutorConfig, FailureInfo, JobChannel, JobKey, RunningExecutions,
    TriggerKey, UnitCatalog, UnitError, UnitKind, keys,
};
use planar_scheduler::{
    JobDefinition, RETRY_TRIGGER_PREFIX, RetryPolicy, Scheduler, SchedulerConfig, SchedulerEvent,
    SchedulerListener, Trigger,
};

struct AlwaysFails;

#[async_trait]
impl ExecutionUnit for AlwaysFails {
    fn kind(&self) -> &str {
        "always-fails"
    }

    async fn execute(&self, _channel: JobChannel) -> Result<(), UnitError> {
        Err(FailureInfo::new("database unreachable").into())
    }
}

#[derive(Default)]
struct Recorder {
    retries: Mutex<Vec<(TriggerKey, u32)>>,
    exhausted: Mutex<Vec<u32>>,
}

impl SchedulerListener for Recorder {
    fn on_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::RetryScheduled {
                trigger_key,
                attempt,
                ..
            } => self
                .retries
                .lock()
                .unwrap()
                .push((trigger_key.clone(), *attempt)),
            SchedulerEvent::RetriesExhausted { attempts, .. } => {
                self.exhausted.lock().unwrap().push(*attempts)
            }
            _ => {}
        }
    }
}

async fn setup(max_retries: u32) -> (Arc<Scheduler>, Arc<Recorder>) {
    let catalog = Arc::new(UnitCatalog::default());
    catalog.register("always-fails", Arc::new(AlwaysFails));
    let executor = Arc::new(Executor::new(
        RunningExecutions::new(),
        ExecutorConfig::default(),
    ));
    let config = SchedulerConfig {
        retry: RetryPolicy::new(max_retries),
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(Scheduler::new(executor, catalog, config));
    let recorder = Arc::new(Recorder::default());
    scheduler.add_listener(recorder.clone()).await;

    scheduler
        .add_job(JobDefinition::new(
            JobKey::new("etl", "import"),
            UnitKind::Registered {
                name: "always-fails".to_string(),
            },
        ))
        .await
        .unwrap();

    (scheduler, recorder)
}

async fn pending_retry(scheduler: &Scheduler) -> Option<TriggerKey> {
    scheduler
        .list_triggers()
        .await
        .into_iter()
        .map(|t| t.key)
        .find(|k| k.name.starts_with(RETRY_TRIGGER_PREFIX))
}

#[tokio::test]
async fn failing_lineage_retries_exactly_max_times() {
    let (scheduler, recorder) = setup(3).await;

    let original = Trigger::once(
        TriggerKey::new("etl", "nightly"),
        JobKey::new("etl", "import"),
        Utc::now(),
    )
    .with_data(keys::RETRY_SPAN, "5");
    let original_id = original.id.clone();
    scheduler.schedule_trigger(original).await.unwrap();

    let before = Utc::now();
    scheduler
        .fire_trigger(&TriggerKey::new("etl", "nightly"))
        .await
        .unwrap()
        .unwrap();

    // Retries start one span after the failure.
    let first = pending_retry(&scheduler).await.unwrap();
    let first_trigger = scheduler.get_trigger(&first).await.unwrap();
    assert!(first_trigger.next_fire >= before + chrono::Duration::seconds(5));

    let mut fired = 0;
    while let Some(key) = pending_retry(&scheduler).await {
        scheduler.fire_trigger(&key).await.unwrap().unwrap();
        fired += 1;
        assert!(fired <= 3, "lineage kept scheduling retries");
    }

    let retries = recorder.retries.lock().unwrap().clone();
    let names: Vec<String> = retries.iter().map(|(k, _)| k.name.clone()).collect();
    assert_eq!(
        names,
        vec![
            format!("Retry.Count.1.{original_id}"),
            format!("Retry.Count.2.{original_id}"),
            format!("Retry.Count.3.{original_id}"),
        ]
    );
    assert_eq!(
        retries.iter().map(|(_, a)| *a).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(*recorder.exhausted.lock().unwrap(), vec![3]);
    assert!(scheduler.list_triggers().await.is_empty());
}

#[tokio::test]
async fn trigger_without_span_is_not_retried() {
    let (scheduler, recorder) = setup(3).await;

    let key = scheduler
        .trigger_job_now(&JobKey::new("etl", "import"), Default::default())
        .await
        .unwrap();
    let outcome = scheduler.fire_trigger(&key).await.unwrap().unwrap();

    assert!(!outcome.is_success());
    assert!(pending_retry(&scheduler).await.is_none());
    assert!(recorder.retries.lock().unwrap().is_empty());
    assert!(recorder.exhausted.lock().unwrap().is_empty());
}
