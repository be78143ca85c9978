//! Plugin sandbox implementation
//!
//! Every loaded plugin can own one [`Sandbox`]. It runs untrusted code under
//! the plugin's declared [`SandboxPolicy`]:
//!
//! - `none`: in-process WebAssembly with the full import surface
//! - `vm`: in-process WebAssembly with only the imports the policy grants
//! - `process`: the same executor inside a `sandbox-worker` child process
//!
//! Native plugin hooks cannot leave the host process; they run through
//! [`Sandbox::run_hook`], which applies the time limit and counters.

pub mod ipc;
pub mod policy;
pub mod process;
pub mod wasm;
pub mod worker;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{panic_message, ExecutionFailure, PluginResult, PluginRuntimeError};

pub use policy::{IsolationLevel, SandboxPolicy};
pub use process::{worker_binary_path, WorkerProcess};
pub use wasm::{GuestLog, GuestLogLevel, GuestOutcome, GuestRequest, SandboxCode, WasmEngine};

/// Extra time the host gives a worker beyond the policy's time limit
const WORKER_GRACE: Duration = Duration::from_millis(500);

/// Host-side settings shared by the sandboxes a loader creates
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Explicit `sandbox-worker` path
    pub worker_binary: Option<PathBuf>,
    /// Parent of each worker's private working directory
    pub work_dir: PathBuf,
    /// How long a new worker may take to report `Ready`
    pub ready_timeout: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            worker_binary: None,
            work_dir: std::env::temp_dir().join("plugin-runtime"),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Sandbox status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Created,
    Ready,
    Destroyed,
}

/// Operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounters {
    pub total: u64,
    pub failed: u64,
    pub by_type: BTreeMap<String, u64>,
}

/// Point-in-time sandbox usage
#[derive(Debug, Clone, Serialize)]
pub struct SandboxStats {
    pub sandbox_id: Uuid,
    pub plugin_id: String,
    pub isolation_level: IsolationLevel,
    pub status: SandboxStatus,
    /// Worker resident memory for `process`, peak guest memory otherwise
    pub memory_bytes: u64,
    /// Worker CPU for `process`, share of uptime spent executing otherwise
    pub cpu_percent: f32,
    pub cpu_limit: f32,
    pub uptime_ms: u64,
    pub worker_pid: Option<u32>,
    /// Workers spawned over the sandbox's life, respawns included
    pub worker_spawns: u32,
    pub operations: OperationCounters,
}

#[derive(Debug, Default)]
struct Usage {
    peak_memory: u64,
    busy: Duration,
}

/// Plugin sandbox for secure execution
pub struct Sandbox {
    id: Uuid,
    plugin_id: String,
    policy: SandboxPolicy,
    settings: SandboxSettings,
    created_at: Instant,
    status: Mutex<SandboxStatus>,
    counters: Mutex<OperationCounters>,
    usage: Mutex<Usage>,
    engine: Mutex<Option<WasmEngine>>,
    worker: tokio::sync::Mutex<Option<WorkerProcess>>,
    worker_pid: Mutex<Option<u32>>,
    worker_spawns: AtomicU32,
    /// Held for the whole of [`Sandbox::initialize`]
    init: tokio::sync::Mutex<()>,
    system: Mutex<System>,
}

impl Sandbox {
    /// Create a sandbox; nothing is allocated until [`Sandbox::initialize`]
    pub fn new(plugin_id: impl Into<String>, policy: SandboxPolicy, settings: SandboxSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            policy,
            settings,
            created_at: Instant::now(),
            status: Mutex::new(SandboxStatus::Created),
            counters: Mutex::new(OperationCounters::default()),
            usage: Mutex::new(Usage::default()),
            engine: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
            worker_pid: Mutex::new(None),
            worker_spawns: AtomicU32::new(0),
            init: tokio::sync::Mutex::new(()),
            system: Mutex::new(System::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.policy.isolation_level
    }

    pub fn status(&self) -> SandboxStatus {
        *self.status.lock()
    }

    fn work_dir(&self) -> PathBuf {
        self.settings.work_dir.join(self.id.to_string())
    }

    fn init_failure(&self, message: impl Into<String>) -> PluginRuntimeError {
        PluginRuntimeError::SandboxInitFailure {
            plugin_id: self.plugin_id.clone(),
            message: message.into(),
        }
    }

    /// Prepare the isolation backend.
    ///
    /// # Errors
    ///
    /// `SandboxInitFailure` when the worker cannot be started or the engine
    /// cannot be built, or when the sandbox was already destroyed.
    pub async fn initialize(&self) -> PluginResult<()> {
        let _init = self.init.lock().await;
        match self.status() {
            SandboxStatus::Created => {}
            SandboxStatus::Ready => return Ok(()),
            SandboxStatus::Destroyed => return Err(self.init_failure("sandbox was destroyed")),
        }

        match self.policy.isolation_level {
            // Engine is built on first use.
            IsolationLevel::None => {}
            IsolationLevel::Vm => {
                let engine = WasmEngine::new().map_err(|e| self.init_failure(format!("{e:#}")))?;
                *self.engine.lock() = Some(engine);
            }
            IsolationLevel::Process => {
                let worker = self.spawn_worker().await.map_err(|e| self.init_failure(e))?;
                *self.worker.lock().await = Some(worker);
            }
        }

        *self.status.lock() = SandboxStatus::Ready;
        info!(
            plugin_id = %self.plugin_id,
            sandbox_id = %self.id,
            isolation = %self.policy.isolation_level,
            "sandbox initialized"
        );
        Ok(())
    }

    async fn spawn_worker(&self) -> Result<WorkerProcess, String> {
        let binary = worker_binary_path(self.settings.worker_binary.as_deref());
        let worker = WorkerProcess::spawn(&binary, &self.work_dir(), self.settings.ready_timeout).await?;
        self.worker_spawns.fetch_add(1, Ordering::Relaxed);
        *self.worker_pid.lock() = worker.pid();
        Ok(worker)
    }

    /// Policy the executor sees; `none` widens the import surface
    fn effective_policy(&self) -> SandboxPolicy {
        match self.policy.isolation_level {
            IsolationLevel::None => SandboxPolicy {
                permissions: self.policy.permissions.clone(),
                cpu_limit: self.policy.cpu_limit,
                ..SandboxPolicy::unrestricted(self.policy.time_limit)
            },
            IsolationLevel::Vm | IsolationLevel::Process => self.policy.clone(),
        }
    }

    fn vm_engine(&self) -> Result<WasmEngine, ExecutionFailure> {
        let mut slot = self.engine.lock();
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let engine = WasmEngine::new().map_err(|e| ExecutionFailure::Module(format!("engine unavailable: {e:#}")))?;
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// Run `code` with `context` under this sandbox's policy.
    ///
    /// # Errors
    ///
    /// `SandboxExecutionFailure`; a run exceeding the time limit always
    /// reports [`ExecutionFailure::Timeout`].
    pub async fn execute(&self, code: &SandboxCode, context: Value) -> PluginResult<GuestOutcome> {
        let started = Instant::now();
        let result = self.dispatch(code, context).await;
        self.record("execute", result.is_ok(), started.elapsed());

        match result {
            Ok(outcome) => {
                {
                    let mut usage = self.usage.lock();
                    usage.peak_memory = usage.peak_memory.max(outcome.memory_bytes);
                }
                if self.policy.isolation_level != IsolationLevel::Process {
                    for log in &outcome.logs {
                        log.emit(&self.plugin_id);
                    }
                }
                debug!(plugin_id = %self.plugin_id, elapsed_ms = outcome.elapsed_ms, "sandboxed execution finished");
                Ok(outcome)
            }
            Err(reason) => {
                warn!(plugin_id = %self.plugin_id, %reason, "sandboxed execution failed");
                Err(PluginRuntimeError::execution(&self.plugin_id, reason))
            }
        }
    }

    async fn dispatch(&self, code: &SandboxCode, context: Value) -> Result<GuestOutcome, ExecutionFailure> {
        if self.status() != SandboxStatus::Ready {
            return Err(ExecutionFailure::NotReady);
        }
        let request = GuestRequest {
            code: code.clone(),
            context,
            policy: self.effective_policy(),
        };

        match self.policy.isolation_level {
            IsolationLevel::None | IsolationLevel::Vm => self.vm_engine()?.run(request).await,
            IsolationLevel::Process => {
                let mut slot = self.worker.lock().await;
                if slot.is_none() {
                    let worker = self.spawn_worker().await.map_err(ExecutionFailure::Worker)?;
                    *slot = Some(worker);
                }
                let Some(worker) = slot.as_mut() else {
                    return Err(ExecutionFailure::NotReady);
                };

                let deadline = self.policy.time_limit.saturating_add(WORKER_GRACE);
                let result = worker.execute(&self.plugin_id, &request, deadline).await;
                if let Err(failure) = &result {
                    if failure.poisons_worker() {
                        // Respawned on the next call.
                        slot.take();
                        *self.worker_pid.lock() = None;
                    }
                }
                result
            }
        }
    }

    /// Run a native plugin hook under the time limit and counters.
    ///
    /// The limit is enforced at the hook's await points. A hook that blocks
    /// the thread without yielding is not interrupted; such hooks should
    /// move the blocking work onto `tokio::task::spawn_blocking`.
    ///
    /// # Errors
    ///
    /// The hook's own error, `HookFailed` if it panics, or a
    /// `SandboxExecutionFailure` timeout.
    pub async fn run_hook<T, F>(&self, hook: &str, future: F) -> PluginResult<T>
    where
        F: Future<Output = PluginResult<T>>,
    {
        if self.status() == SandboxStatus::Destroyed {
            return Err(PluginRuntimeError::execution(&self.plugin_id, ExecutionFailure::NotReady));
        }

        let started = Instant::now();
        let guarded = AssertUnwindSafe(future).catch_unwind();
        let result = match tokio::time::timeout(self.policy.time_limit, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(PluginRuntimeError::hook_failed(
                &self.plugin_id,
                hook,
                panic_message(&*panic),
            )),
            Err(_) => Err(PluginRuntimeError::execution(
                &self.plugin_id,
                ExecutionFailure::Timeout(u64::try_from(self.policy.time_limit.as_millis()).unwrap_or(u64::MAX)),
            )),
        };
        self.record(hook, result.is_ok(), started.elapsed());
        result
    }

    pub fn check_permission(&self, name: &str) -> bool {
        self.record("permission_check", true, Duration::ZERO);
        self.policy.check_permission(name)
    }

    /// [`Sandbox::check_permission`] as a `Result`.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when the policy does not grant `name`.
    pub fn require_permission(&self, name: &str) -> PluginResult<()> {
        if self.check_permission(name) {
            return Ok(());
        }
        Err(PluginRuntimeError::PermissionDenied {
            plugin_id: self.plugin_id.clone(),
            message: format!("permission '{name}' not granted"),
        })
    }

    pub fn validate_network_access(&self, host: &str, port: u16) -> bool {
        self.record("network_check", true, Duration::ZERO);
        let allowed = self.policy.validate_network_access(host, port);
        if !allowed {
            debug!(plugin_id = %self.plugin_id, host, port, "network access denied");
        }
        allowed
    }

    pub fn validate_file_system_access(&self, path: &str, write: bool) -> bool {
        self.record("fs_check", true, Duration::ZERO);
        let allowed = self.policy.validate_file_system_access(path, write);
        if !allowed {
            debug!(plugin_id = %self.plugin_id, path, write, "filesystem access denied");
        }
        allowed
    }

    fn record(&self, operation: &str, ok: bool, elapsed: Duration) {
        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            if !ok {
                counters.failed += 1;
            }
            *counters.by_type.entry(operation.to_string()).or_insert(0) += 1;
        }
        self.usage.lock().busy += elapsed;
    }

    /// Release the backend and reset counters. Idempotent.
    pub async fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.status.lock(), SandboxStatus::Destroyed);
        if previous == SandboxStatus::Destroyed {
            return;
        }

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        *self.worker_pid.lock() = None;
        self.engine.lock().take();
        *self.counters.lock() = OperationCounters::default();
        *self.usage.lock() = Usage::default();

        if self.policy.isolation_level == IsolationLevel::Process {
            if let Err(e) = tokio::fs::remove_dir_all(self.work_dir()).await {
                debug!(plugin_id = %self.plugin_id, error = %e, "worker directory not removed");
            }
        }
        info!(plugin_id = %self.plugin_id, sandbox_id = %self.id, "sandbox destroyed");
    }

    /// Total operations recorded since creation or the last destroy
    pub fn operation_count(&self) -> u64 {
        self.counters.lock().total
    }

    pub fn stats(&self) -> SandboxStats {
        let uptime = self.created_at.elapsed();
        let operations = self.counters.lock().clone();
        let worker_pid = *self.worker_pid.lock();

        let process_usage = worker_pid.and_then(|pid| {
            let pid = Pid::from_u32(pid);
            let mut system = self.system.lock();
            if !system.refresh_process(pid) {
                return None;
            }
            system.process(pid).map(|p| (p.memory(), p.cpu_usage()))
        });

        let (memory_bytes, cpu_percent) = process_usage.unwrap_or_else(|| {
            let usage = self.usage.lock();
            let share = if uptime.is_zero() {
                0.0
            } else {
                (usage.busy.as_secs_f64() / uptime.as_secs_f64() * 100.0).min(100.0)
            };
            #[allow(clippy::cast_possible_truncation)]
            let share = share as f32;
            (usage.peak_memory, share)
        });

        SandboxStats {
            sandbox_id: self.id,
            plugin_id: self.plugin_id.clone(),
            isolation_level: self.policy.isolation_level,
            status: self.status(),
            memory_bytes,
            cpu_percent,
            cpu_limit: self.policy.cpu_limit,
            uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            worker_pid,
            worker_spawns: self.worker_spawns.load(Ordering::Relaxed),
            operations,
        }
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("isolation_level", &self.policy.isolation_level)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox(level: IsolationLevel, time_limit: Duration) -> Sandbox {
        let policy = SandboxPolicy {
            isolation_level: level,
            permissions: ["kv.read".to_string()].into_iter().collect(),
            time_limit,
            ..SandboxPolicy::default()
        };
        Sandbox::new("demo", policy, SandboxSettings::default())
    }

    const PERMISSION_QUERY: &str = r#"
        (module
          (import "env" "has_permission" (func $perm (param i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "kv.write")
          (func (export "run") (result i32)
            (call $perm (i32.const 0) (i32.const 8))))
    "#;

    #[tokio::test]
    async fn execute_requires_initialize() {
        let sandbox = sandbox(IsolationLevel::Vm, Duration::from_secs(1));
        let error = sandbox
            .execute(&SandboxCode::wat(PERMISSION_QUERY), Value::Null)
            .await
            .expect_err("not initialized");
        assert!(matches!(
            error,
            PluginRuntimeError::SandboxExecutionFailure {
                reason: ExecutionFailure::NotReady,
                ..
            }
        ));
        assert_eq!(sandbox.stats().operations.failed, 1);
    }

    #[tokio::test]
    async fn vm_denies_undeclared_permission() {
        let sandbox = sandbox(IsolationLevel::Vm, Duration::from_secs(1));
        sandbox.initialize().await.expect("initialized");
        let outcome = sandbox
            .execute(&SandboxCode::wat(PERMISSION_QUERY), Value::Null)
            .await
            .expect("runs");
        assert_eq!(outcome.value, json!(0));
        assert!(sandbox.check_permission("kv.read"));
        assert!(!sandbox.check_permission("kv.write"));
        assert!(matches!(
            sandbox.require_permission("kv.write"),
            Err(PluginRuntimeError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn execute_timeout_is_reported_and_counted() {
        let sandbox = sandbox(IsolationLevel::Vm, Duration::from_millis(100));
        sandbox.initialize().await.expect("initialized");
        let error = sandbox
            .execute(&SandboxCode::wat(r#"(module (func (export "run") (loop (br 0))))"#), Value::Null)
            .await
            .expect_err("must time out");
        assert!(error.is_timeout(), "got {error}");

        let stats = sandbox.stats();
        assert_eq!(stats.operations.by_type.get("execute"), Some(&1));
        assert_eq!(stats.operations.failed, 1);
    }

    #[tokio::test]
    async fn none_level_exposes_full_surface() {
        let sandbox = sandbox(IsolationLevel::None, Duration::from_secs(1));
        sandbox.initialize().await.expect("initialized");
        let wat = r#"
            (module
              (import "env" "net_check" (func $net (param i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "example.org")
              (func (export "run") (result i32)
                (call $net (i32.const 0) (i32.const 11) (i32.const 443))))
        "#;
        let outcome = sandbox.execute(&SandboxCode::wat(wat), Value::Null).await.expect("runs");
        assert_eq!(outcome.value, json!(1));
    }

    #[tokio::test]
    async fn hook_timeout_and_panic_are_contained() {
        let sandbox = sandbox(IsolationLevel::None, Duration::from_millis(50));

        let slow = sandbox
            .run_hook("start", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(slow.expect_err("times out").is_timeout());

        let explode = true;
        let panicking: PluginResult<()> = sandbox
            .run_hook("stop", async move {
                if explode {
                    panic!("boom");
                }
                Ok(())
            })
            .await;
        match panicking {
            Err(PluginRuntimeError::HookFailed { hook, message, .. }) => {
                assert_eq!(hook, "stop");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let stats = sandbox.stats();
        assert_eq!(stats.operations.total, 2);
        assert_eq!(stats.operations.failed, 2);
    }

    #[tokio::test]
    async fn destroy_resets_and_blocks_execution() {
        let sandbox = sandbox(IsolationLevel::Vm, Duration::from_secs(1));
        sandbox.initialize().await.expect("initialized");
        sandbox
            .execute(&SandboxCode::wat(PERMISSION_QUERY), Value::Null)
            .await
            .expect("runs");
        assert_eq!(sandbox.operation_count(), 1);

        sandbox.destroy().await;
        sandbox.destroy().await;
        assert_eq!(sandbox.status(), SandboxStatus::Destroyed);
        assert_eq!(sandbox.operation_count(), 0);
        assert!(sandbox.initialize().await.is_err());
    }
}
