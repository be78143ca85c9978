//! Plugin runtime error types
//!
//! Every fallible operation in the runtime returns [`PluginResult`]. Errors
//! carry the plugin id they concern where one exists, map onto a stable
//! [`ErrorCategory`] for results and metrics, and know whether retrying the
//! failed operation can help.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Main plugin runtime error type
#[derive(Error, Debug)]
pub enum PluginRuntimeError {
    /// A required dependency is not registered
    #[error("Plugin '{plugin_id}' is missing required dependency '{dependency}'")]
    MissingDependency {
        /// Plugin declaring the dependency
        plugin_id: String,
        /// The absent dependency
        dependency: String,
    },

    /// The plugin lies on (or reaches) a dependency cycle
    #[error("Plugin '{plugin_id}' has a cyclic dependency")]
    CyclicDependency {
        /// Plugin whose dependency walk found the cycle
        plugin_id: String,
    },

    /// A dependency is registered at a version outside the declared range
    #[error("Plugin '{plugin_id}' requires '{dependency}' {required}, found {found}")]
    IncompatibleVersion {
        /// Plugin declaring the requirement
        plugin_id: String,
        /// Dependency whose version does not satisfy the requirement
        dependency: String,
        /// Declared version requirement
        required: String,
        /// Registered version
        found: String,
    },

    /// Descriptor or manifest failed shape validation
    #[error("Invalid plugin descriptor: {0}")]
    DescriptorInvalid(String),

    /// Sandbox could not be prepared
    #[error("Sandbox initialization failed for plugin '{plugin_id}': {message}")]
    SandboxInitFailure {
        /// Plugin the sandbox belongs to
        plugin_id: String,
        /// Failure description
        message: String,
    },

    /// Sandboxed code or a guarded hook failed
    #[error("Sandbox execution failed for plugin '{plugin_id}': {reason}")]
    SandboxExecutionFailure {
        /// Plugin the sandbox belongs to
        plugin_id: String,
        /// What went wrong inside the sandbox
        reason: ExecutionFailure,
    },

    /// Access denied by sandbox policy
    #[error("Permission denied for plugin '{plugin_id}': {message}")]
    PermissionDenied {
        /// Plugin that requested access
        plugin_id: String,
        /// What was requested
        message: String,
    },

    /// A plugin with this id is already registered
    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// Unload or stop blocked by dependents
    #[error("Plugin '{plugin_id}' has dependents: {}", dependents.join(", "))]
    HasDependents {
        /// Plugin that cannot be removed
        plugin_id: String,
        /// Plugins that still depend on it
        dependents: Vec<String>,
    },

    /// Plugin not found
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Invalid plugin state for operation
    #[error("Invalid plugin state: {0}")]
    InvalidState(String),

    /// A plugin lifecycle hook returned an error or panicked
    #[error("Plugin '{plugin_id}' failed in {hook} hook: {message}")]
    HookFailed {
        /// Plugin whose hook failed
        plugin_id: String,
        /// Hook name
        hook: String,
        /// Failure description
        message: String,
    },

    /// A plugin source could not discover or fetch a plugin
    #[error("Plugin source error for '{location}': {message}")]
    SourceFailure {
        /// Location being read
        location: String,
        /// Failure description
        message: String,
    },

    /// Plugin timeout
    #[error("Plugin operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Plugin runtime result type
pub type PluginResult<T> = Result<T, PluginRuntimeError>;

/// Reason a sandboxed execution failed.
///
/// Serializable so the sandbox worker can report it across the process
/// boundary unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// Wall-clock limit exceeded
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// Guest trapped (unreachable, out of bounds, memory limit, ...)
    #[error("guest trapped: {0}")]
    Trap(String),
    /// Module failed to compile, link or expose its entry point
    #[error("module rejected: {0}")]
    Module(String),
    /// Guest produced output the host could not decode
    #[error("invalid guest output: {0}")]
    InvalidOutput(String),
    /// Worker process failed or exited
    #[error("worker failure: {0}")]
    Worker(String),
    /// Guarded code panicked
    #[error("panicked: {0}")]
    Panic(String),
    /// Sandbox not initialized or already destroyed
    #[error("sandbox is not ready")]
    NotReady,
}

impl ExecutionFailure {
    /// Whether this failure leaves a worker process in an unknown state
    pub fn poisons_worker(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Worker(_))
    }
}

impl PluginRuntimeError {
    /// Create a hook failure
    pub fn hook_failed(
        plugin_id: impl Into<String>,
        hook: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::HookFailed {
            plugin_id: plugin_id.into(),
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Create a source failure
    pub fn source_failure(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceFailure {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Create a sandbox execution failure
    pub fn execution(plugin_id: impl Into<String>, reason: ExecutionFailure) -> Self {
        Self::SandboxExecutionFailure {
            plugin_id: plugin_id.into(),
            reason,
        }
    }

    /// Whether the sandbox reported a wall-clock timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::SandboxExecutionFailure {
                    reason: ExecutionFailure::Timeout(_),
                    ..
                }
        )
    }

    /// Transient failures worth another attempt.
    ///
    /// Only source and I/O failures qualify; validation, dependency and
    /// lifecycle errors are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceFailure { .. } | Self::IoError(_))
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingDependency { .. } => ErrorCategory::MissingDependency,
            Self::CyclicDependency { .. } => ErrorCategory::CyclicDependency,
            Self::IncompatibleVersion { .. } => ErrorCategory::IncompatibleVersion,
            Self::DescriptorInvalid(_) => ErrorCategory::DescriptorInvalid,
            Self::SandboxInitFailure { .. } => ErrorCategory::SandboxInit,
            Self::SandboxExecutionFailure { .. } => ErrorCategory::SandboxExecution,
            Self::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            Self::AlreadyRegistered(_) => ErrorCategory::AlreadyRegistered,
            Self::HasDependents { .. } => ErrorCategory::HasDependents,
            Self::PluginNotFound(_) => ErrorCategory::NotFound,
            Self::InvalidState(_) => ErrorCategory::State,
            Self::HookFailed { .. } => ErrorCategory::Hook,
            Self::SourceFailure { .. } => ErrorCategory::Source,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::ConfigurationError(_) => ErrorCategory::Configuration,
            Self::SerializationError(_) | Self::JsonError(_) => ErrorCategory::Serialization,
            Self::IoError(_) => ErrorCategory::Io,
        }
    }
}

impl From<serde_yaml::Error> for PluginRuntimeError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::SerializationError(error.to_string())
    }
}

impl From<config::ConfigError> for PluginRuntimeError {
    fn from(error: config::ConfigError) -> Self {
        Self::ConfigurationError(error.to_string())
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingDependency,
    CyclicDependency,
    IncompatibleVersion,
    DescriptorInvalid,
    SandboxInit,
    SandboxExecution,
    PermissionDenied,
    AlreadyRegistered,
    HasDependents,
    NotFound,
    State,
    Hook,
    Source,
    Timeout,
    Configuration,
    Serialization,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MissingDependency => "missing_dependency",
            Self::CyclicDependency => "cyclic_dependency",
            Self::IncompatibleVersion => "incompatible_version",
            Self::DescriptorInvalid => "descriptor_invalid",
            Self::SandboxInit => "sandbox_init",
            Self::SandboxExecution => "sandbox_execution",
            Self::PermissionDenied => "permission_denied",
            Self::AlreadyRegistered => "already_registered",
            Self::HasDependents => "has_dependents",
            Self::NotFound => "not_found",
            Self::State => "state",
            Self::Hook => "hook",
            Self::Source => "source",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Serialization => "serialization",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries (milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between retries (milliseconds)
    pub max_delay_ms: u64,
    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay
    Fixed,
    /// Linear increase
    Linear,
    /// Exponential backoff
    Exponential,
}

impl RetryPolicy {
    /// Policy used for plugin source I/O: `retries` extra attempts with
    /// exponential backoff.
    pub fn for_source_io(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let step = attempt.max(1);
        let millis = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(step)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(step.saturating_sub(1)).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> PluginResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PluginResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
