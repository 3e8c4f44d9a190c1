//! Host side of the execution channel.
//!
//! The host resolves the target execution by fire instance id and applies the
//! request to its metadata under the entry's lock, so every request is fully
//! applied before the reply is produced.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::MetadataError;
use crate::executor::ExecutionObserver;
use crate::protocol::{self, CallFrame, PROTOCOL_VERSION, Reply, ReplyFrame, Request};
use crate::registry::RunningExecutions;

/// Applies channel requests to running executions.
#[derive(Clone)]
pub struct ChannelHost {
    running: Arc<RunningExecutions>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl ChannelHost {
    pub fn new(running: Arc<RunningExecutions>) -> Self {
        Self {
            running,
            observer: None,
        }
    }

    /// Notify `observer` of progress changes.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn running(&self) -> &Arc<RunningExecutions> {
        &self.running
    }

    /// Handle one encoded [`CallFrame`] and return the encoded [`ReplyFrame`].
    ///
    /// Undecodable frames are answered with an error reply rather than
    /// failing the host.
    pub async fn handle_encoded(&self, line: &str) -> String {
        let reply = match protocol::decode::<CallFrame>(line) {
            Ok(call) => ReplyFrame {
                seq: call.seq,
                reply: self.handle(&call.fire_instance_id, call.request).await,
            },
            Err(e) => {
                warn!(error = %e, "rejected undecodable channel frame");
                ReplyFrame {
                    seq: 0,
                    reply: Reply::Error {
                        message: e.to_string(),
                    },
                }
            }
        };

        protocol::encode(&reply).unwrap_or_else(|e| {
            format!(
                r#"{{"version":{PROTOCOL_VERSION},"frame":{{"seq":{},"reply":{{"status":"error","message":"{}"}}}}}}"#,
                reply.seq,
                e.to_string().replace('"', "'")
            )
        })
    }

    /// Apply a request to the execution identified by `fire_instance_id`.
    pub async fn handle(&self, fire_instance_id: &str, request: Request) -> Reply {
        let Some(entry) = self.running.get(fire_instance_id) else {
            warn!(
                fire_instance_id,
                method = request.method(),
                "channel request for unknown fire instance"
            );
            return Reply::Error {
                message: format!("fire instance not found: {fire_instance_id}"),
            };
        };

        let method = request.method();
        let mut progress_changed = None;

        let result = {
            let mut metadata = entry.metadata.lock().await;
            match request {
                Request::AppendLog { text } => metadata.append_log(&text).map(|_| Reply::Ack),
                Request::UpdateProgress { current, total } => {
                    let before = metadata.progress;
                    metadata.update_progress(current, total).map(|value| {
                        if value != before {
                            progress_changed = Some(value);
                        }
                        Reply::Progress { value }
                    })
                }
                Request::SetEffectedRows { value } => {
                    metadata.set_effected_rows(value).map(|_| Reply::Ack)
                }
                Request::IncreaseEffectedRows => metadata
                    .increase_effected_rows()
                    .map(|value| Reply::Rows { value }),
                Request::PutJobData { key, value } => {
                    metadata.put_job_data(&key, &value).map(|_| Reply::Ack)
                }
                Request::RemoveJobData { key } => metadata.remove_job_data(&key).map(|_| Reply::Ack),
                Request::AddAggregateException {
                    failure,
                    tolerance_seconds,
                } => metadata
                    .add_aggregate_exception(failure, tolerance_seconds)
                    .map(|_| Reply::Ack),
                Request::CheckAggregateException => {
                    metadata.check_aggregate_exception().map(|checked| match checked {
                        Ok(()) => Reply::Ack,
                        Err(failure) => Reply::Failed { failure },
                    })
                }
                Request::ReportFatal { failure } => metadata.report_fatal(failure).map(|_| Reply::Ack),
                Request::GetLog => Ok(Reply::Log {
                    text: metadata.log.clone(),
                }),
                Request::IsStopRequested => Ok(Reply::StopRequested {
                    value: entry.stop.is_requested(),
                }),
            }
        };

        match result {
            Ok(reply) => {
                if let (Some(progress), Some(observer)) = (progress_changed, &self.observer) {
                    observer.progress_changed(&entry.context, progress);
                }
                reply
            }
            Err(MetadataError::Finalized(id)) => {
                debug!(
                    fire_instance_id = %id,
                    method,
                    "dropped channel request after finalization"
                );
                Reply::Dropped {
                    reason: format!("execution {id} is finalized"),
                }
            }
        }
    }
}
