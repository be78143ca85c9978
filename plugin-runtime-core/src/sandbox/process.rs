//! Host side of `process` isolation
//!
//! A [`WorkerProcess`] is one running `sandbox-worker` child. The child gets
//! a cleared environment and its own working directory, and is reachable
//! only through frames on its stdin/stdout. Once a reply misses its deadline
//! the child is killed; the sandbox respawns a fresh one on the next call.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::ExecutionFailure;
use crate::sandbox::ipc::{read_frame, write_frame, ExecuteReply, Frame, FrameKind, LogRecord};
use crate::sandbox::wasm::{GuestLog, GuestOutcome, GuestRequest};

/// Binary name looked up next to the current executable, then on `PATH`
pub const WORKER_BINARY: &str = "sandbox-worker";

/// Time allowed for a graceful shutdown before the child is killed
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Worker log format; `json` switches the worker to JSON diagnostics
pub const LOG_FORMAT_ENV: &str = "SANDBOX_WORKER_LOG";

/// The only host variables a worker inherits
const FORWARDED_ENV: [&str; 2] = ["RUST_LOG", LOG_FORMAT_ENV];

fn forwarded_env(lookup: impl Fn(&str) -> Option<String>) -> Vec<(&'static str, String)> {
    FORWARDED_ENV
        .into_iter()
        .filter_map(|name| lookup(name).map(|value| (name, value)))
        .collect()
}

/// Resolve the worker executable
pub fn worker_binary_path(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    let file_name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        // Test binaries live one level below the target directory in deps/
        for dir in exe.ancestors().skip(1).take(2) {
            let candidate = dir.join(&file_name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from(file_name)
}

/// A running worker child
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    pid: Option<u32>,
}

impl WorkerProcess {
    /// Spawn a worker and wait for its `Ready` frame.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; the child is killed.
    pub async fn spawn(binary: &Path, work_dir: &Path, ready_timeout: Duration) -> Result<Self, String> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| format!("cannot create worker directory {}: {e}", work_dir.display()))?;

        let mut cmd = Command::new(binary);
        cmd.env_clear()
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // worker logs go to our stderr
            .kill_on_drop(true);
        cmd.envs(forwarded_env(|name| std::env::var(name).ok()));

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", binary.display()))?;
        let stdin = child.stdin.take().ok_or("worker stdin unavailable")?;
        let stdout = child.stdout.take().ok_or("worker stdout unavailable")?;
        let pid = child.id();

        let mut worker = Self {
            child,
            stdin,
            stdout,
            pid,
        };

        let ready = tokio::time::timeout(ready_timeout, read_frame(&mut worker.stdout)).await;
        match ready {
            Ok(Ok(Some(frame))) if frame.kind == FrameKind::Ready => {
                info!(pid = ?worker.pid, binary = %binary.display(), "sandbox worker started");
                Ok(worker)
            }
            Ok(Ok(Some(frame))) => {
                worker.kill().await;
                Err(format!("expected Ready frame, got {:?}", frame.kind))
            }
            Ok(Ok(None)) => {
                worker.kill().await;
                Err("worker exited before signalling readiness".to_string())
            }
            Ok(Err(e)) => {
                worker.kill().await;
                Err(format!("reading Ready frame failed: {e}"))
            }
            Err(_) => {
                worker.kill().await;
                Err(format!("worker not ready within {} ms", ready_timeout.as_millis()))
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send one request and wait for its reply within `deadline`.
    ///
    /// Guest log records arriving before the reply are re-emitted under
    /// `plugin_id`.
    ///
    /// # Errors
    ///
    /// The guest's own failure, or `Timeout` / `Worker` when the child
    /// misses the deadline or breaks the protocol. After those two the
    /// worker must be discarded.
    pub async fn execute(
        &mut self,
        plugin_id: &str,
        request: &GuestRequest,
        deadline: Duration,
    ) -> Result<GuestOutcome, ExecutionFailure> {
        let frame = Frame::json(FrameKind::Execute, request)
            .map_err(|e| ExecutionFailure::Worker(format!("encoding request: {e}")))?;
        write_frame(&mut self.stdin, &frame)
            .await
            .map_err(|e| ExecutionFailure::Worker(format!("sending request: {e}")))?;

        let outcome = tokio::time::timeout(deadline, await_reply(&mut self.stdout, plugin_id)).await;
        match outcome {
            Ok(reply) => reply,
            Err(_) => {
                warn!(pid = ?self.pid, plugin_id, "worker missed its deadline, killing it");
                self.kill().await;
                Err(ExecutionFailure::Timeout(
                    u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Ask the worker to exit, killing it if it does not comply in time
    pub async fn shutdown(mut self) {
        let _ = write_frame(&mut self.stdin, &Frame::empty(FrameKind::Shutdown)).await;
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = ?self.pid, %status, "sandbox worker exited"),
            _ => self.kill().await,
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(pid = ?self.pid, error = %e, "worker already gone");
        }
    }
}

async fn await_reply(stdout: &mut ChildStdout, plugin_id: &str) -> ExecuteReply {
    loop {
        let frame = read_frame(stdout)
            .await
            .map_err(|e| ExecutionFailure::Worker(format!("reading reply: {e}")))?
            .ok_or_else(|| ExecutionFailure::Worker("worker exited".to_string()))?;
        match frame.kind {
            FrameKind::Log => {
                if let Ok(record) = frame.parse_json::<LogRecord>() {
                    GuestLog {
                        level: record.level,
                        message: record.message,
                    }
                    .emit(plugin_id);
                }
            }
            FrameKind::Result => {
                return frame
                    .parse_json()
                    .map_err(|e| ExecutionFailure::Worker(format!("decoding reply: {e}")))?;
            }
            other => debug!(?other, "ignoring unexpected frame from worker"),
        }
    }
}
