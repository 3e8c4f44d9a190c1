//! Child-process transport.
//!
//! [`ProcessUnit`] runs an external program as an execution unit. The host
//! writes a `start` frame to the child's stdin, then relays every `call` frame
//! the child prints on stdout through the unit's [`JobChannel`] and writes the
//! reply back. Stdout lines that are not protocol frames are appended to the
//! execution log, so plain scripts work without speaking the protocol.
//!
//! [`StdioTransport`] is the other end, for child programs written in Rust.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    Lines, Stdin, Stdout,
};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::channel::{JobChannel, Transport};
use crate::error::{ChannelError, ProtocolError};
use crate::failure::FailureInfo;
use crate::protocol::{self, HostFrame, Reply, Request, UnitFrame};
use crate::unit::{ExecutionUnit, UnitError};

/// Lines starting with this are treated as protocol frames.
const FRAME_PREFIX: &str = "{\"version\"";

/// Bytes of stderr kept for failure messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// An execution unit backed by an external program.
#[derive(Debug, Clone)]
pub struct ProcessUnit {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    stop_grace: Duration,
}

impl ProcessUnit {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            stop_grace: Duration::from_secs(10),
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// How long a child may keep running after a stop request before it is killed.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.spawn()
    }

    fn kill(&self, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            warn!(program = %self.program, error = %e, "failed to kill process unit");
        }
    }
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    fn kind(&self) -> &str {
        "process"
    }

    async fn execute(&self, channel: JobChannel) -> Result<(), UnitError> {
        let fire_instance_id = channel.context().fire_instance_id.clone();
        let mut child = self.spawn().map_err(|e| {
            FailureInfo::with_kind("spawn", format!("failed to spawn {}: {e}", self.program))
        })?;
        info!(
            program = %self.program,
            pid = ?child.id(),
            fire_instance_id = %fire_instance_id,
            "spawned process unit"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Closed("child stdout unavailable".to_string()))?;
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));
        let mut stdin = child.stdin.take();

        if let Some(pipe) = stdin.as_mut() {
            let start = protocol::encode(&HostFrame::Start {
                snapshot: channel.snapshot().clone(),
            })
            .map_err(ChannelError::from)?;
            // Plain programs may exit without ever reading stdin.
            if let Err(e) = write_line(pipe, &start).await {
                debug!(program = %self.program, error = %e, "process unit did not accept start frame");
                stdin = None;
            }
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut stop = channel.stop_signal();
        let mut stdout_open = true;
        let mut kill_at: Option<Instant> = None;
        let mut killed = false;
        let mut completed: Option<Option<FailureInfo>> = None;
        let mut transport_error: Option<ChannelError> = None;

        let status = loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Err(e) = relay_line(&channel, &mut stdin, &line, &mut completed).await {
                            transport_error = Some(e);
                            stdout_open = false;
                            self.kill(&mut child);
                        }
                    }
                    Ok(None) => {
                        stdout_open = false;
                        stdin = None;
                    }
                    Err(e) => {
                        transport_error = Some(e.into());
                        stdout_open = false;
                        self.kill(&mut child);
                    }
                },
                status = child.wait(), if !stdout_open => break status,
                _ = wait_for_stop(&mut stop), if kill_at.is_none() => {
                    debug!(fire_instance_id = %fire_instance_id, grace = ?self.stop_grace, "stop requested for process unit");
                    kill_at = Some(Instant::now() + self.stop_grace);
                }
                _ = sleep_until_deadline(kill_at), if kill_at.is_some() && !killed => {
                    warn!(
                        program = %self.program,
                        fire_instance_id = %fire_instance_id,
                        "killing process unit after stop grace period"
                    );
                    self.kill(&mut child);
                    killed = true;
                    // Grandchildren may hold stdout open.
                    stdout_open = false;
                }
            }
        };

        let stderr_tail = match stderr_task {
            Some(task) => match timeout(Duration::from_secs(1), task).await {
                Ok(Ok(tail)) => tail,
                _ => String::new(),
            },
            None => String::new(),
        };

        if let Some(e) = transport_error {
            error!(
                program = %self.program,
                fire_instance_id = %fire_instance_id,
                error = %e,
                "process unit transport failed"
            );
            return Err(UnitError::Transport(e));
        }

        let status = status.map_err(ChannelError::from)?;
        if killed {
            return Err(FailureInfo::with_kind(
                FailureInfo::KIND_STOPPED,
                format!(
                    "process killed {}s after stop request",
                    self.stop_grace.as_secs_f64()
                ),
            )
            .into());
        }

        match completed {
            Some(Some(failure)) => Err(failure.into()),
            Some(None) => Ok(()),
            None if status.success() => Ok(()),
            None => {
                let mut failure = FailureInfo::with_kind(
                    "exit",
                    format!("{} exited with {status}", self.program),
                );
                let tail = stderr_tail.trim();
                if !tail.is_empty() {
                    failure = failure.caused_by(FailureInfo::with_kind("stderr", tail));
                }
                Err(failure.into())
            }
        }
    }
}

/// Handle one stdout line from the child.
async fn relay_line(
    channel: &JobChannel,
    stdin: &mut Option<ChildStdin>,
    line: &str,
    completed: &mut Option<Option<FailureInfo>>,
) -> Result<(), ChannelError> {
    if !line.trim_start().starts_with(FRAME_PREFIX) {
        return channel.append_log(line).await;
    }

    match protocol::decode::<UnitFrame>(line)? {
        UnitFrame::Call { seq, request } => {
            let reply = channel.forward(request).await?;
            let frame = protocol::encode(&HostFrame::Reply { seq, reply })?;
            let pipe = stdin
                .as_mut()
                .ok_or_else(|| ChannelError::Closed("child stdin is closed".to_string()))?;
            write_line(pipe, &frame).await?;
        }
        UnitFrame::Completed { failure } => {
            *completed = Some(failure);
        }
    }
    Ok(())
}

async fn wait_for_stop(stop: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = stop {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "failed to read process stderr");
    }
    let text = String::from_utf8_lossy(&buf);
    let mut start = text.len().saturating_sub(STDERR_TAIL_BYTES);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

struct StdioIo<R, W> {
    lines: Lines<R>,
    writer: W,
}

/// Child-side transport over a line-oriented reader and writer.
///
/// A Rust child program calls [`StdioTransport::stdio`], then
/// [`connect`](StdioTransport::connect) to read its start frame and obtain a
/// [`JobChannel`].
pub struct StdioTransport<R = BufReader<Stdin>, W = Stdout> {
    io: Mutex<StdioIo<R, W>>,
    seq: AtomicU64,
}

impl StdioTransport<BufReader<Stdin>, Stdout> {
    /// Transport over this process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new(StdioIo {
                lines: reader.lines(),
                writer,
            }),
            seq: AtomicU64::new(0),
        }
    }

    /// Read the host's start frame and build the unit's channel.
    pub async fn connect(self) -> Result<(Arc<Self>, JobChannel), ChannelError> {
        let snapshot = {
            let mut io = self.io.lock().await;
            let line = io
                .lines
                .next_line()
                .await?
                .ok_or_else(|| ChannelError::Closed("host closed stdin before start".to_string()))?;
            match protocol::decode::<HostFrame>(&line)? {
                HostFrame::Start { snapshot } => snapshot,
                other => {
                    return Err(ProtocolError::Unexpected(format!("{other:?}")).into());
                }
            }
        };

        let transport = Arc::new(self);
        let channel = JobChannel::new(transport.clone(), snapshot);
        Ok((transport, channel))
    }

    /// Tell the host how the unit finished.
    pub async fn complete(&self, failure: Option<FailureInfo>) -> Result<(), ChannelError> {
        let line = protocol::encode(&UnitFrame::Completed { failure })?;
        let mut io = self.io.lock().await;
        write_line(&mut io.writer, &line).await?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn call(&self, request: Request) -> Result<Reply, ChannelError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let line = protocol::encode(&UnitFrame::Call { seq, request })?;

        let mut io = self.io.lock().await;
        write_line(&mut io.writer, &line).await?;

        let response = io
            .lines
            .next_line()
            .await?
            .ok_or_else(|| ChannelError::Closed("host closed stdin".to_string()))?;
        match protocol::decode::<HostFrame>(&response)? {
            HostFrame::Reply { seq: got, reply } if got == seq => Ok(reply),
            other => Err(ProtocolError::Unexpected(format!("{other:?} while waiting for seq {seq}")).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ChannelHost;
    use crate::channel::LocalTransport;
    use crate::protocol::StartupSnapshot;
    use crate::registry::RunningExecutions;
    use crate::registry::test_support::context;

    async fn channel_for(id: &str) -> (JobChannel, Arc<RunningExecutions>) {
        let running = RunningExecutions::new();
        let ctx = Arc::new(context(id));
        let entry = running.register(Arc::clone(&ctx)).unwrap();
        entry.metadata.lock().await.start().unwrap();

        let host = ChannelHost::new(Arc::clone(&running));
        let snapshot = StartupSnapshot {
            context: (*ctx).clone(),
            log: String::new(),
            stop_requested: false,
            global_config: BTreeMap::new(),
        };
        let channel = JobChannel::new(Arc::new(LocalTransport::new(host, id)), snapshot)
            .with_stop_signal(entry.stop.subscribe());
        (channel, running)
    }

    fn sh(script: &str) -> ProcessUnit {
        ProcessUnit::new("sh").args(vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_relays_calls_and_plain_output() {
        let (channel, running) = channel_for("fire-1").await;
        let unit = sh(r#"read start
echo '{"version":1,"frame":{"type":"call","seq":1,"request":{"method":"append_log","payload":{"text":"from child"}}}}'
read reply
echo plain output"#);

        unit.execute(channel).await.unwrap();

        let entry = running.get("fire-1").unwrap();
        assert_eq!(entry.metadata.lock().await.log, "from child\nplain output\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_code_is_failure_with_stderr() {
        let (channel, _running) = channel_for("fire-1").await;
        let err = sh("echo boom >&2; exit 3").execute(channel).await.unwrap_err();

        match err {
            UnitError::Failed(failure) => {
                assert_eq!(failure.kind, "exit");
                assert_eq!(failure.innermost_message(), "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completed_frame_overrides_exit_status() {
        let (channel, _running) = channel_for("fire-1").await;
        let unit = sh(
            r#"echo '{"version":1,"frame":{"type":"completed","failure":{"kind":"error","message":"bad input"}}}'"#,
        );

        let err = unit.execute(channel).await.unwrap_err();
        assert!(matches!(err, UnitError::Failed(f) if f.message == "bad input"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bad_frame_version_is_transport_failure() {
        let (channel, _running) = channel_for("fire-1").await;
        let unit = sh(r#"echo '{"version":9,"frame":{"type":"completed"}}'"#);

        let err = unit.execute(channel).await.unwrap_err();
        assert!(matches!(err, UnitError::Transport(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_request_kills_after_grace() {
        let (channel, running) = channel_for("fire-1").await;
        let unit = sh("read start; exec sleep 30").stop_grace(Duration::from_millis(100));

        let task = tokio::spawn(async move { unit.execute(channel).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        running.request_stop("fire-1");

        let result = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(UnitError::Failed(f)) if f.kind == FailureInfo::KIND_STOPPED));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let (channel, _running) = channel_for("fire-1").await;
        let err = ProcessUnit::new("/nonexistent/planar-unit")
            .execute(channel)
            .await
            .unwrap_err();
        assert!(matches!(err, UnitError::Failed(f) if f.kind == "spawn"));
    }

    #[tokio::test]
    async fn test_stdio_transport_exchanges_frames() {
        let (unit_io, host_io) = tokio::io::duplex(64 * 1024);
        let (unit_read, unit_write) = tokio::io::split(unit_io);
        let (host_read, mut host_write) = tokio::io::split(host_io);

        let snapshot = StartupSnapshot {
            context: context("fire-9"),
            log: String::new(),
            stop_requested: false,
            global_config: BTreeMap::new(),
        };

        let host = tokio::spawn(async move {
            let mut lines = BufReader::new(host_read).lines();
            let start = protocol::encode(&HostFrame::Start { snapshot }).unwrap();
            write_line(&mut host_write, &start).await.unwrap();

            let call = lines.next_line().await.unwrap().unwrap();
            let seq = match protocol::decode::<UnitFrame>(&call).unwrap() {
                UnitFrame::Call {
                    seq,
                    request: Request::AppendLog { text },
                } => {
                    assert_eq!(text, "hello host");
                    seq
                }
                other => panic!("unexpected frame: {other:?}"),
            };
            let reply = protocol::encode(&HostFrame::Reply {
                seq,
                reply: Reply::Ack,
            })
            .unwrap();
            write_line(&mut host_write, &reply).await.unwrap();

            let done = lines.next_line().await.unwrap().unwrap();
            protocol::decode::<UnitFrame>(&done).unwrap()
        });

        let transport = StdioTransport::new(BufReader::new(unit_read), unit_write);
        let (transport, channel) = transport.connect().await.unwrap();
        assert_eq!(channel.context().fire_instance_id, "fire-9");

        channel.append_log("hello host").await.unwrap();
        transport.complete(None).await.unwrap();

        assert_eq!(host.await.unwrap(), UnitFrame::Completed { failure: None });
    }
}
