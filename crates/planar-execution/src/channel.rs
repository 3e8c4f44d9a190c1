//! Unit side of the execution channel.
//!
//! A [`JobChannel`] is what an execution unit sees of its host: the startup
//! snapshot plus a set of calls that are forwarded through a [`Transport`].
//! Every transport exchanges encoded protocol frames, so the unit never holds
//! host types even when it runs in the same process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{ChannelError, ProtocolError};
use crate::failure::FailureInfo;
use crate::host::ChannelHost;
use crate::protocol::{self, CallFrame, Reply, ReplyFrame, Request, StartupSnapshot};
use crate::unit::UnitError;

/// Carries requests from a unit to its host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait for the host's reply.
    async fn call(&self, request: Request) -> Result<Reply, ChannelError>;
}

/// In-process transport.
///
/// Requests are still encoded and decoded so in-process and out-of-process
/// units observe identical behavior.
pub struct LocalTransport {
    host: ChannelHost,
    fire_instance_id: String,
    seq: AtomicU64,
}

impl LocalTransport {
    pub fn new(host: ChannelHost, fire_instance_id: impl Into<String>) -> Self {
        Self {
            host,
            fire_instance_id: fire_instance_id.into(),
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: Request) -> Result<Reply, ChannelError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let line = protocol::encode(&CallFrame {
            fire_instance_id: self.fire_instance_id.clone(),
            seq,
            request,
        })?;

        let response = self.host.handle_encoded(&line).await;
        let reply: ReplyFrame = protocol::decode(&response)?;
        if reply.seq != seq {
            return Err(ProtocolError::Unexpected(format!(
                "reply for seq {} while waiting for {}",
                reply.seq, seq
            ))
            .into());
        }
        Ok(reply.reply)
    }
}

/// The channel handed to an execution unit.
#[derive(Clone)]
pub struct JobChannel {
    transport: Arc<dyn Transport>,
    snapshot: Arc<StartupSnapshot>,
    stop: Option<watch::Receiver<bool>>,
}

impl JobChannel {
    pub fn new(transport: Arc<dyn Transport>, snapshot: StartupSnapshot) -> Self {
        Self {
            transport,
            snapshot: Arc::new(snapshot),
            stop: None,
        }
    }

    /// Attach the host-local stop flag. Only available in-process.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.snapshot.context
    }

    pub fn snapshot(&self) -> &StartupSnapshot {
        &self.snapshot
    }

    /// Read-only global configuration resolved at start.
    pub fn global_config(&self) -> &BTreeMap<String, String> {
        &self.snapshot.global_config
    }

    /// Look up a merged data value, falling back to global configuration.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.snapshot
            .context
            .merged_data
            .get(key)
            .or_else(|| self.snapshot.global_config.get(key))
            .map(String::as_str)
    }

    /// Host-local stop flag receiver, if this channel runs in-process.
    pub fn stop_signal(&self) -> Option<watch::Receiver<bool>> {
        self.stop.clone()
    }

    /// Forward a raw request unchanged. Used to relay calls from child processes.
    pub async fn forward(&self, request: Request) -> Result<Reply, ChannelError> {
        self.transport.call(request).await
    }

    pub async fn append_log(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        let reply = self
            .transport
            .call(Request::AppendLog { text: text.into() })
            .await?;
        expect_ack(reply)
    }

    /// Report progress as `current` out of `total`. Returns the stored percent.
    pub async fn update_progress(&self, current: i64, total: i64) -> Result<u8, ChannelError> {
        match self
            .transport
            .call(Request::UpdateProgress { current, total })
            .await?
        {
            Reply::Progress { value } => Ok(value),
            other => expect_ack(other).map(|_| 0),
        }
    }

    /// Report progress as a percentage.
    pub async fn update_progress_percent(&self, percent: u8) -> Result<u8, ChannelError> {
        self.update_progress(i64::from(percent), 100).await
    }

    pub async fn set_effected_rows(&self, value: i64) -> Result<(), ChannelError> {
        let reply = self
            .transport
            .call(Request::SetEffectedRows { value })
            .await?;
        expect_ack(reply)
    }

    /// Add one to the effected rows counter. Returns the new value.
    pub async fn increase_effected_rows(&self) -> Result<i64, ChannelError> {
        match self.transport.call(Request::IncreaseEffectedRows).await? {
            Reply::Rows { value } => Ok(value),
            other => expect_ack(other).map(|_| 0),
        }
    }

    pub async fn put_job_data(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ChannelError> {
        let reply = self
            .transport
            .call(Request::PutJobData {
                key: key.into(),
                value: value.into(),
            })
            .await?;
        expect_ack(reply)
    }

    pub async fn remove_job_data(&self, key: impl Into<String>) -> Result<(), ChannelError> {
        let reply = self
            .transport
            .call(Request::RemoveJobData { key: key.into() })
            .await?;
        expect_ack(reply)
    }

    /// Record a non-fatal failure and keep going.
    pub async fn add_aggregate_exception(
        &self,
        failure: FailureInfo,
        tolerance_seconds: u32,
    ) -> Result<(), ChannelError> {
        let reply = self
            .transport
            .call(Request::AddAggregateException {
                failure,
                tolerance_seconds,
            })
            .await?;
        expect_ack(reply)
    }

    /// Fail the run if any aggregate failures were collected.
    pub async fn check_aggregate_exception(&self) -> Result<(), UnitError> {
        match self.transport.call(Request::CheckAggregateException).await? {
            Reply::Failed { failure } => Err(UnitError::Failed(failure)),
            other => Ok(expect_ack(other)?),
        }
    }

    /// Record a fatal failure without returning from the unit.
    pub async fn report_fatal(&self, failure: FailureInfo) -> Result<(), ChannelError> {
        let reply = self
            .transport
            .call(Request::ReportFatal { failure })
            .await?;
        expect_ack(reply)
    }

    /// Current log text as held by the host.
    pub async fn current_log(&self) -> Result<String, ChannelError> {
        match self.transport.call(Request::GetLog).await? {
            Reply::Log { text } => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    pub async fn is_stop_requested(&self) -> Result<bool, ChannelError> {
        if let Some(stop) = &self.stop {
            return Ok(*stop.borrow());
        }
        match self.transport.call(Request::IsStopRequested).await? {
            Reply::StopRequested { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Return a "stopped" failure if the host asked this execution to stop.
    ///
    /// Units call this at safe points.
    pub async fn fail_on_stop_request(&self) -> Result<(), UnitError> {
        if self.is_stop_requested().await? {
            return Err(UnitError::Failed(FailureInfo::with_kind(
                FailureInfo::KIND_STOPPED,
                "execution stopped by request",
            )));
        }
        Ok(())
    }
}

fn expect_ack(reply: Reply) -> Result<(), ChannelError> {
    match reply {
        Reply::Ack => Ok(()),
        Reply::Dropped { reason } => {
            debug!(reason = %reason, "host dropped channel request");
            Ok(())
        }
        Reply::Error { message } => Err(ChannelError::Rejected(message)),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> ChannelError {
    match reply {
        Reply::Error { message } => ChannelError::Rejected(message),
        other => ProtocolError::Unexpected(format!("{other:?}")).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RunningExecutions;
    use crate::registry::test_support::context;

    async fn channel_for(id: &str) -> (JobChannel, Arc<RunningExecutions>) {
        let running = RunningExecutions::new();
        let ctx = Arc::new(context(id));
        let entry = running.register(Arc::clone(&ctx)).unwrap();
        entry.metadata.lock().await.start().unwrap();

        let host = ChannelHost::new(Arc::clone(&running));
        let transport = Arc::new(LocalTransport::new(host, id));
        let snapshot = StartupSnapshot {
            context: (*ctx).clone(),
            log: String::new(),
            stop_requested: false,
            global_config: BTreeMap::from([("smtp_host".to_string(), "mail".to_string())]),
        };
        (JobChannel::new(transport, snapshot), running)
    }

    #[tokio::test]
    async fn test_channel_round_trip_mutations() {
        let (channel, running) = channel_for("fire-1").await;

        channel.append_log("step one").await.unwrap();
        assert_eq!(channel.update_progress(1, 4).await.unwrap(), 25);
        channel.set_effected_rows(10).await.unwrap();
        assert_eq!(channel.increase_effected_rows().await.unwrap(), 11);
        channel.put_job_data("cursor", "42").await.unwrap();

        assert_eq!(channel.current_log().await.unwrap(), "step one\n");

        let entry = running.get("fire-1").unwrap();
        let metadata = entry.metadata.lock().await;
        assert_eq!(metadata.progress, 25);
        assert_eq!(metadata.effected_rows, Some(11));
        assert!(metadata.data_changes.contains_key("cursor"));
    }

    #[tokio::test]
    async fn test_fail_on_stop_request_polls_host() {
        let (channel, running) = channel_for("fire-1").await;
        assert!(channel.fail_on_stop_request().await.is_ok());

        running.request_stop("fire-1");
        let err = channel.fail_on_stop_request().await.unwrap_err();
        assert!(matches!(err, UnitError::Failed(f) if f.kind == FailureInfo::KIND_STOPPED));
    }

    #[tokio::test]
    async fn test_check_aggregate_exception_through_channel() {
        let (channel, _running) = channel_for("fire-1").await;
        assert!(channel.check_aggregate_exception().await.is_ok());

        channel
            .add_aggregate_exception(FailureInfo::new("row 3 invalid"), 30)
            .await
            .unwrap();
        let err = channel.check_aggregate_exception().await.unwrap_err();
        assert!(matches!(err, UnitError::Failed(f) if f.message.contains("row 3 invalid")));
    }

    #[tokio::test]
    async fn test_unknown_fire_instance_is_rejected() {
        let running = RunningExecutions::new();
        let host = ChannelHost::new(running);
        let transport = LocalTransport::new(host, "ghost");
        let reply = transport.call(Request::GetLog).await.unwrap();
        assert!(matches!(reply, Reply::Error { .. }));
    }

    #[tokio::test]
    async fn test_setting_prefers_merged_data() {
        let (channel, _running) = channel_for("fire-1").await;
        assert_eq!(channel.setting("smtp_host"), Some("mail"));
        assert_eq!(channel.setting("missing"), None);
    }
}
