//! Hooks backed by external programs.
//!
//! The program receives one JSON line on stdin:
//! `{"version":1,"method":"handle","payload":{"details":..,"users":..,"group":..}}`
//! and signals success with exit status 0.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use planar_execution::PROTOCOL_VERSION;

use crate::error::HookError;
use crate::hook::{Hook, HookLoader};
use crate::record::HookPayload;

/// Bytes of stderr kept in failure messages.
const STDERR_TAIL_BYTES: usize = 1024;

#[derive(Serialize)]
struct HookFrame<'a> {
    version: u16,
    method: &'a str,
    payload: &'a HookPayload,
}

/// A hook that runs a program per call.
#[derive(Debug, Clone)]
pub struct ProcessHook {
    name: String,
    program: PathBuf,
}

impl ProcessHook {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn invoke(&self, method: &str, payload: &HookPayload) -> Result<(), HookError> {
        let mut line = serde_json::to_vec(&HookFrame {
            version: PROTOCOL_VERSION,
            method,
            payload,
        })?;
        line.push(b'\n');

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(hook = %self.name, method, pid = ?child.id(), "spawned hook process");

        // Feed stdin while the output pipes drain, so a hook that writes
        // before reading cannot fill both pipe buffers.
        let writer = child.stdin.take().map(|mut stdin| {
            let hook = self.name.clone();
            tokio::spawn(async move {
                // A hook may ignore its input and exit early.
                if let Err(e) = stdin.write_all(&line).await {
                    debug!(hook = %hook, error = %e, "hook did not read its payload");
                }
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(hook = %self.name, error = %e, "hook stdin writer failed");
            }
        }
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = if stderr.len() > STDERR_TAIL_BYTES {
            let start = stderr.len() - STDERR_TAIL_BYTES;
            let start = (start..stderr.len())
                .find(|i| stderr.is_char_boundary(*i))
                .unwrap_or(stderr.len());
            stderr[start..].to_string()
        } else {
            stderr.to_string()
        };
        Err(HookError::Failed {
            hook: self.name.clone(),
            message: format!("exited with {}: {}", output.status, tail.trim()),
        })
    }
}

#[async_trait]
impl Hook for ProcessHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, payload: &HookPayload) -> Result<(), HookError> {
        self.invoke("handle", payload).await
    }

    async fn handle_system(&self, payload: &HookPayload) -> Result<(), HookError> {
        self.invoke("handle_system", payload).await
    }

    async fn test(&self, payload: &HookPayload) -> Result<(), HookError> {
        self.invoke("test", payload).await
    }
}

/// Loads every executable file in a directory as a [`ProcessHook`] named
/// after the file stem.
#[derive(Debug, Clone)]
pub struct DirectoryHookLoader {
    dir: PathBuf,
}

impl DirectoryHookLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.is_file()
}

#[async_trait]
impl HookLoader for DirectoryHookLoader {
    fn source(&self) -> String {
        self.dir.display().to_string()
    }

    async fn load(&self) -> Result<Vec<Arc<dyn Hook>>, HookError> {
        if !tokio::fs::try_exists(&self.dir).await? {
            warn!(dir = %self.dir.display(), "hooks directory does not exist");
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut hooks: Vec<Arc<dyn Hook>> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !is_executable(&metadata) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            info!(hook = name, program = %path.display(), "loaded process hook");
            hooks.push(Arc::new(ProcessHook::new(name, path.clone())));
        }
        Ok(hooks)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use super::*;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn payload() -> HookPayload {
        HookPayload {
            details: r#"{"event_id":3}"#.to_string(),
            users: "[]".to_string(),
            group: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_process_hook_receives_frame_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("received.json");
        let script = write_script(dir.path(), "capture", &format!("cat > {}", out.display()));

        ProcessHook::new("capture", script)
            .handle(&payload())
            .await
            .unwrap();

        let received: serde_json::Value =
            serde_json::from_str(std::fs::read_to_string(&out).unwrap().trim()).unwrap();
        assert_eq!(received["version"], 1);
        assert_eq!(received["method"], "handle");
        assert_eq!(received["payload"]["details"], r#"{"event_id":3}"#);
    }

    #[tokio::test]
    async fn test_large_payload_with_chatty_hook_completes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("received.json");
        // Fill stdout past the pipe buffer before touching stdin.
        let script = write_script(
            dir.path(),
            "chatty",
            &format!("head -c 300000 /dev/zero\ncat > {}", out.display()),
        );
        let details = "x".repeat(256 * 1024);
        let payload = HookPayload {
            details: details.clone(),
            users: "[]".to_string(),
            group: "{}".to_string(),
        };

        let hook = ProcessHook::new("chatty", script);
        tokio::time::timeout(Duration::from_secs(10), hook.handle(&payload))
            .await
            .expect("hook call deadlocked")
            .unwrap();

        let received: serde_json::Value =
            serde_json::from_str(std::fs::read_to_string(&out).unwrap().trim()).unwrap();
        assert_eq!(received["payload"]["details"].as_str().map(str::len), Some(details.len()));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "broken", "echo 'no route to host' >&2; exit 3");

        let err = ProcessHook::new("broken", script)
            .handle_system(&payload())
            .await
            .unwrap_err();
        match err {
            HookError::Failed { hook, message } => {
                assert_eq!(hook, "broken");
                assert!(message.contains("no route to host"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_directory_loader_picks_executables() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "mail.sh", "exit 0");
        std::fs::write(dir.path().join("README"), "not a hook").unwrap();

        let hooks = DirectoryHookLoader::new(dir.path()).load().await.unwrap();
        let names: Vec<&str> = hooks.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["mail"]);
    }

    #[tokio::test]
    async fn test_missing_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = DirectoryHookLoader::new(dir.path().join("absent"))
            .load()
            .await
            .unwrap();
        assert!(hooks.is_empty());
    }
}
