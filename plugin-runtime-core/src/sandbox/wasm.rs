//! WebAssembly execution
//!
//! Guest modules run on a blocking thread against a fresh `Store` per call.
//! The only way out of the guest is the set of `env` imports defined here;
//! imports that the policy does not grant are simply not linked, so a module
//! asking for them fails to instantiate.
//!
//! Wall-clock limits use epoch interruption: every [`WasmEngine`] owns a
//! ticker task that bumps the engine epoch, and each store traps once its
//! deadline (in ticks) passes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, Val,
};

use crate::error::ExecutionFailure;
use crate::sandbox::policy::SandboxPolicy;

/// Epoch ticker period
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Extra time the host waits for the blocking thread after the deadline
const HOST_GRACE: Duration = Duration::from_millis(250);

/// Guest log lines kept per call
const MAX_GUEST_LOGS: usize = 256;

/// Code handed to a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxCode {
    /// WebAssembly binary or text format
    pub module: Vec<u8>,
    /// Exported function to call
    #[serde(default = "default_entry")]
    pub entry: String,
}

fn default_entry() -> String {
    "run".to_string()
}

impl SandboxCode {
    pub fn new(module: impl Into<Vec<u8>>) -> Self {
        Self {
            module: module.into(),
            entry: default_entry(),
        }
    }

    /// Code from WebAssembly text format
    pub fn wat(source: &str) -> Self {
        Self::new(source.as_bytes().to_vec())
    }

    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }
}

/// One guest execution request; also the `Execute` frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestRequest {
    pub code: SandboxCode,
    pub context: Value,
    pub policy: SandboxPolicy,
}

/// Severity passed to the `log` import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl GuestLogLevel {
    fn from_raw(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// A line logged by guest code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestLog {
    pub level: GuestLogLevel,
    pub message: String,
}

impl GuestLog {
    /// Re-emit through `tracing`, attributed to the plugin
    pub fn emit(&self, plugin_id: &str) {
        let message = self.message.as_str();
        match self.level {
            GuestLogLevel::Trace => tracing::trace!(target: "plugin", plugin_id, "{message}"),
            GuestLogLevel::Debug => tracing::debug!(target: "plugin", plugin_id, "{message}"),
            GuestLogLevel::Info => tracing::info!(target: "plugin", plugin_id, "{message}"),
            GuestLogLevel::Warn => tracing::warn!(target: "plugin", plugin_id, "{message}"),
            GuestLogLevel::Error => tracing::error!(target: "plugin", plugin_id, "{message}"),
        }
    }
}

/// Successful guest execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestOutcome {
    /// Decoded `output` payload, or the entry function's first result
    pub value: Value,
    /// Guest linear memory size after the call
    pub memory_bytes: u64,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub logs: Vec<GuestLog>,
}

struct EpochTicker(JoinHandle<()>);

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Engine with a running epoch ticker
#[derive(Clone)]
pub struct WasmEngine {
    engine: Engine,
    _ticker: Arc<EpochTicker>,
}

impl WasmEngine {
    /// Build an engine and start its ticker on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails outside a Tokio runtime or when the engine configuration is
    /// rejected.
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;

        let runtime = tokio::runtime::Handle::try_current()?;
        let ticking = engine.clone();
        let ticker = runtime.spawn(async move {
            let mut interval = tokio::time::interval(EPOCH_TICK);
            loop {
                interval.tick().await;
                ticking.increment_epoch();
            }
        });

        Ok(Self {
            engine,
            _ticker: Arc::new(EpochTicker(ticker)),
        })
    }

    /// Run guest code under the request's policy.
    ///
    /// # Errors
    ///
    /// Any compile, link, trap or output failure; always
    /// [`ExecutionFailure::Timeout`] once `time_limit` is exceeded.
    pub async fn run(&self, request: GuestRequest) -> Result<GuestOutcome, ExecutionFailure> {
        let limit = request.policy.time_limit;
        let engine = self.engine.clone();
        let task = tokio::task::spawn_blocking(move || run_guest(&engine, request));

        match tokio::time::timeout(limit.saturating_add(HOST_GRACE), task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(ExecutionFailure::Panic(join.to_string())),
            // The guest thread keeps running until its epoch deadline traps.
            Err(_) => Err(ExecutionFailure::Timeout(millis(limit))),
        }
    }
}

struct HostState {
    context: Vec<u8>,
    output: Option<Vec<u8>>,
    logs: Vec<GuestLog>,
    policy: SandboxPolicy,
    limits: StoreLimits,
}

fn run_guest(engine: &Engine, request: GuestRequest) -> Result<GuestOutcome, ExecutionFailure> {
    let GuestRequest {
        code,
        context,
        policy,
    } = request;
    let limit = policy.time_limit;

    let module = Module::new(engine, &code.module)
        .map_err(|e| ExecutionFailure::Module(format!("{e:#}")))?;
    let mut linker = Linker::new(engine);
    define_host_functions(&mut linker, &policy)
        .map_err(|e| ExecutionFailure::Module(format!("{e:#}")))?;

    let memory_limit = usize::try_from(policy.memory_limit).unwrap_or(usize::MAX);
    let state = HostState {
        context: context.to_string().into_bytes(),
        output: None,
        logs: Vec::new(),
        policy,
        limits: StoreLimitsBuilder::new().memory_size(memory_limit).build(),
    };
    let mut store = Store::new(engine, state);
    store.limiter(|state| &mut state.limits);
    store.set_epoch_deadline(deadline_ticks(limit));
    store.epoch_deadline_trap();

    let started = Instant::now();
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| classify(&e, started, limit, ExecutionFailure::Module))?;
    let func = instance
        .get_func(&mut store, &code.entry)
        .ok_or_else(|| ExecutionFailure::Module(format!("missing export '{}'", code.entry)))?;

    let mut results = vec![Val::I32(0); func.ty(&store).results().len()];
    func.call(&mut store, &[], &mut results)
        .map_err(|e| classify(&e, started, limit, ExecutionFailure::Trap))?;

    let elapsed = started.elapsed();
    if elapsed > limit {
        return Err(ExecutionFailure::Timeout(millis(elapsed)));
    }

    let memory_bytes = instance
        .get_memory(&mut store, "memory")
        .map_or(0, |memory| memory.data_size(&store));
    let state = store.into_data();
    let value = match state.output {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| ExecutionFailure::InvalidOutput(e.to_string()))?,
        None => results.first().map_or(Value::Null, val_to_json),
    };

    Ok(GuestOutcome {
        value,
        memory_bytes: u64::try_from(memory_bytes).unwrap_or(u64::MAX),
        elapsed_ms: millis(elapsed),
        logs: state.logs,
    })
}

fn classify(
    error: &anyhow::Error,
    started: Instant,
    limit: Duration,
    otherwise: fn(String) -> ExecutionFailure,
) -> ExecutionFailure {
    let interrupted = matches!(error.downcast_ref::<Trap>(), Some(Trap::Interrupt));
    if interrupted || started.elapsed() > limit {
        ExecutionFailure::Timeout(millis(started.elapsed()))
    } else if error.downcast_ref::<Trap>().is_some() {
        ExecutionFailure::Trap(format!("{error:#}"))
    } else {
        otherwise(format!("{error:#}"))
    }
}

fn deadline_ticks(limit: Duration) -> u64 {
    // One extra tick because the first tick may land immediately.
    let ticks = limit.as_millis() / EPOCH_TICK.as_millis();
    u64::try_from(ticks).unwrap_or(1 << 40).min(1 << 40) + 2
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn val_to_json(value: &Val) -> Value {
    match value {
        Val::I32(v) => Value::from(*v),
        Val::I64(v) => Value::from(*v),
        Val::F32(bits) => Value::from(f64::from(f32::from_bits(*bits))),
        Val::F64(bits) => Value::from(f64::from_bits(*bits)),
        _ => Value::Null,
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export linear memory"))
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = usize::try_from(ptr)?;
    let end = start
        .checked_add(usize::try_from(len)?)
        .ok_or_else(|| anyhow!("guest range overflows"))?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("guest range {start}..{end} is out of bounds"))
}

fn read_guest_str(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    Ok(String::from_utf8(read_guest(caller, ptr, len)?)?)
}

fn define_host_functions(linker: &mut Linker<HostState>, policy: &SandboxPolicy) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let logs = &mut caller.data_mut().logs;
            if logs.len() < MAX_GUEST_LOGS {
                logs.push(GuestLog {
                    level: GuestLogLevel::from_raw(level),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "context_len",
        |caller: Caller<'_, HostState>| -> anyhow::Result<i32> {
            Ok(i32::try_from(caller.data().context.len())?)
        },
    )?;

    linker.func_wrap(
        "env",
        "context_read",
        |mut caller: Caller<'_, HostState>, ptr: i32| -> anyhow::Result<()> {
            let context = caller.data().context.clone();
            let memory = guest_memory(&mut caller)?;
            memory.write(&mut caller, usize::try_from(ptr)?, &context)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "output",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            caller.data_mut().output = Some(bytes);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "has_permission",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let name = read_guest_str(&mut caller, ptr, len)?;
            Ok(i32::from(caller.data().policy.check_permission(&name)))
        },
    )?;

    if policy.allow_network {
        linker.func_wrap(
            "env",
            "net_check",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, port: i32| -> anyhow::Result<i32> {
                let host = read_guest_str(&mut caller, ptr, len)?;
                let allowed = u16::try_from(port)
                    .map(|port| caller.data().policy.validate_network_access(&host, port))
                    .unwrap_or(false);
                Ok(i32::from(allowed))
            },
        )?;
    }

    if policy.allow_file_system {
        linker.func_wrap(
            "env",
            "fs_check",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, write: i32| -> anyhow::Result<i32> {
                let path = read_guest_str(&mut caller, ptr, len)?;
                let allowed = caller
                    .data()
                    .policy
                    .validate_file_system_access(&path, write != 0);
                Ok(i32::from(allowed))
            },
        )?;
    }

    Ok(())
}
