//! Fan-out of dispatch records to hooks.
//!
//! Every hook call runs on its own task under a timeout. A failing, hanging
//! or panicking hook is logged and never affects its siblings.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use planar_events::{EventProducer, NotificationRecord};

use crate::error::HookError;
use crate::hook::{Hook, HookRegistry};
use crate::record::{DispatchRecord, HookPayload, SystemDispatchRecord};

/// Which hook entry point a call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Handle,
    HandleSystem,
    Test,
}

/// One call to make.
struct HookCall {
    hook: String,
    event: String,
    monitor: String,
    fire_instance_id: Option<String>,
    payload: Result<HookPayload, serde_json::Error>,
    method: Method,
}

/// Counts from one dispatch batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Sends dispatch records to hooks.
pub struct HookDispatcher {
    registry: Arc<HookRegistry>,
    timeout: Duration,
    notifications: Option<EventProducer<NotificationRecord>>,
}

impl HookDispatcher {
    pub fn new(registry: Arc<HookRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            notifications: None,
        }
    }

    /// Publish a [`NotificationRecord`] for every hook call.
    pub fn with_notifications(mut self, producer: EventProducer<NotificationRecord>) -> Self {
        self.notifications = Some(producer);
        self
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Deliver execution records. Waits for every call to finish or time out.
    pub async fn dispatch(&self, records: Vec<DispatchRecord>) -> DispatchReport {
        let calls = records
            .iter()
            .map(|record| HookCall {
                hook: record.hook.clone(),
                event: record.event_title.clone(),
                monitor: record.monitor_title.clone(),
                fire_instance_id: Some(record.fire_instance_id.clone()),
                payload: HookPayload::from_record(record),
                method: Method::Handle,
            })
            .collect();
        self.run(calls).await
    }

    /// Deliver system records.
    pub async fn dispatch_system(&self, records: Vec<SystemDispatchRecord>) -> DispatchReport {
        let calls = records
            .iter()
            .map(|record| HookCall {
                hook: record.hook.clone(),
                event: record.event_title.clone(),
                monitor: record.monitor_title.clone(),
                fire_instance_id: None,
                payload: HookPayload::from_system(record),
                method: Method::HandleSystem,
            })
            .collect();
        self.run(calls).await
    }

    /// Invoke one hook's `test` entry point and report its result.
    pub async fn test(&self, hook: &str, payload: HookPayload) -> Result<(), HookError> {
        let target = self
            .registry
            .get(hook)
            .await
            .ok_or_else(|| HookError::NotFound(hook.to_string()))?;
        call_with_timeout(target, Method::Test, payload, self.timeout).await
    }

    async fn run(&self, calls: Vec<HookCall>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut tasks = JoinSet::new();

        for call in calls {
            let Some(hook) = self.registry.get(&call.hook).await else {
                error!(hook = %call.hook, event = %call.event, monitor = %call.monitor, "unknown hook, skipping dispatch");
                report.failed += 1;
                self.notify(&call, Err("hook not found".to_string()));
                continue;
            };
            let payload = match &call.payload {
                Ok(payload) => payload.clone(),
                Err(e) => {
                    error!(hook = %call.hook, error = %e, "failed to encode hook payload");
                    report.failed += 1;
                    self.notify(&call, Err(e.to_string()));
                    continue;
                }
            };

            let timeout = self.timeout;
            let method = call.method;
            // Inner spawn so a panic surfaces as a JoinError we can attribute.
            tasks.spawn(async move {
                let result = match tokio::spawn(call_with_timeout(hook, method, payload, timeout)).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(HookError::Panicked(call.hook.clone())),
                    Err(e) => Err(HookError::Failed {
                        hook: call.hook.clone(),
                        message: e.to_string(),
                    }),
                };
                (call, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((call, Ok(()))) => {
                    debug!(hook = %call.hook, event = %call.event, "hook delivered");
                    report.delivered += 1;
                    self.notify(&call, Ok(()));
                }
                Ok((call, Err(e))) => {
                    warn!(hook = %call.hook, event = %call.event, monitor = %call.monitor, error = %e, "hook failed");
                    report.failed += 1;
                    self.notify(&call, Err(e.to_string()));
                }
                Err(e) => {
                    error!(error = %e, "hook task failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn notify(&self, call: &HookCall, result: Result<(), String>) {
        let Some(producer) = &self.notifications else {
            return;
        };
        let record = match result {
            Ok(()) => NotificationRecord::delivered(&call.hook, &call.event),
            Err(e) => NotificationRecord::failed(&call.hook, &call.event, e),
        }
        .for_monitor(&call.monitor, call.fire_instance_id.clone());
        producer.publish(record);
    }
}

async fn call_with_timeout(
    hook: Arc<dyn Hook>,
    method: Method,
    payload: HookPayload,
    timeout: Duration,
) -> Result<(), HookError> {
    let call = async {
        match method {
            Method::Handle => hook.handle(&payload).await,
            Method::HandleSystem => hook.handle_system(&payload).await,
            Method::Test => hook.test(&payload).await,
        }
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| HookError::Timeout {
            hook: hook.name().to_string(),
            after: timeout,
        })?
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::event::MonitorEvent;
    use crate::hook::test_support::{Behavior, RecordingHook, registry};
    use crate::rules::MonitorGroup;
    use crate::test_context;

    fn record(hook: &str) -> DispatchRecord {
        test_context::record(MonitorEvent::ExecutionFail, hook, MonitorGroup::default())
    }

    #[tokio::test]
    async fn test_failures_never_affect_siblings() {
        let mail = RecordingHook::new("mail", Behavior::Ok);
        let registry = registry(vec![
            mail.clone(),
            RecordingHook::new("broken", Behavior::Fail),
            RecordingHook::new("boom", Behavior::Panic),
            RecordingHook::new("slow", Behavior::Hang),
        ])
        .await;
        let (producer, mut notifications) = EventProducer::channel("notifications", 16);
        let dispatcher =
            HookDispatcher::new(registry, Duration::from_millis(100)).with_notifications(producer);

        let report = dispatcher
            .dispatch(vec![
                record("missing"),
                record("mail"),
                record("broken"),
                record("boom"),
                record("slow"),
            ])
            .await;

        assert_eq!(report, DispatchReport { delivered: 1, failed: 4 });
        assert_eq!(mail.calls(), vec!["handle"]);

        let mut delivered = Vec::new();
        while let Ok(n) = notifications.try_recv() {
            delivered.push((n.hook, n.delivered));
        }
        delivered.sort();
        assert_eq!(
            delivered,
            vec![
                ("boom".to_string(), false),
                ("broken".to_string(), false),
                ("mail".to_string(), true),
                ("missing".to_string(), false),
                ("slow".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_system_records_use_handle_system() {
        let pager = RecordingHook::new("pager", Behavior::Ok);
        let dispatcher = HookDispatcher::new(registry(vec![pager.clone()]).await, Duration::from_secs(1));

        let report = dispatcher
            .dispatch_system(vec![SystemDispatchRecord {
                event_id: MonitorEvent::SchedulerStarted.id(),
                event_title: MonitorEvent::SchedulerStarted.title().to_string(),
                monitor_id: 1,
                monitor_title: "startup".to_string(),
                hook: "pager".to_string(),
                environment: "test".to_string(),
                message: "scheduler started".to_string(),
                job_key: None,
                trigger_key: None,
                data: BTreeMap::new(),
                users: Vec::new(),
                group: MonitorGroup::default(),
                global_config: BTreeMap::new(),
            }])
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(pager.calls(), vec!["handle_system"]);
    }

    #[tokio::test]
    async fn test_entry_point_reports_result() {
        let dispatcher = HookDispatcher::new(
            registry(vec![
                RecordingHook::new("mail", Behavior::Ok),
                RecordingHook::new("slow", Behavior::Hang),
            ])
            .await,
            Duration::from_millis(50),
        );
        let payload =
            test_context::payload(MonitorEvent::ExecutionEnd, "mail", MonitorGroup::default())
                .unwrap();

        dispatcher.test("mail", payload.clone()).await.unwrap();
        assert!(matches!(
            dispatcher.test("slow", payload.clone()).await,
            Err(HookError::Timeout { .. })
        ));
        assert!(matches!(
            dispatcher.test("missing", payload).await,
            Err(HookError::NotFound(name)) if name == "missing"
        ));
    }
}
