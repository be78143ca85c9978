//! Loader configuration
//!
//! [`LoaderConfig`] is plain serde data with defaults for every field.
//! [`LoaderConfig::load`] layers an optional file (format chosen by
//! extension) under `PLUGIN_RUNTIME__*` environment variables, e.g.
//! `PLUGIN_RUNTIME__MAX_CONCURRENT_LOADS=8`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PluginResult, PluginRuntimeError};
use crate::sandbox::{IsolationLevel, SandboxPolicy};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PLUGIN_RUNTIME";

/// Loader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directory scanned by the directory source
    pub plugins_dir: PathBuf,
    /// Working directory for sandbox worker processes
    pub temp_dir: PathBuf,
    /// Reserved for on-disk result caches
    pub cache_dir: PathBuf,
    /// Load every discovered plugin on `start`
    pub auto_load: bool,
    /// Upper bound for one load pipeline; also the default sandbox time limit
    #[serde(with = "duration_ms")]
    pub load_timeout: Duration,
    /// Maximum load pipelines in flight
    pub max_concurrent_loads: usize,
    /// Extra attempts for source discovery and descriptor fetches
    pub retry_attempts: u32,
    /// Allocate a sandbox for every loaded plugin
    pub sandbox_enabled: bool,
    /// Permissions granted when a descriptor declares no sandbox policy
    pub default_permissions: Vec<String>,
    /// Isolation level used when a descriptor declares no sandbox policy
    pub isolation_level: IsolationLevel,
    /// Validate dependencies before loading
    pub resolve_dependencies: bool,
    /// Refuse to unload plugins that others depend on
    pub strict_dependencies: bool,
    /// Tolerate unregistered required dependencies
    pub allow_missing_dependencies: bool,
    /// Cache successful load results by source location
    pub cache_enabled: bool,
    #[serde(with = "duration_ms")]
    pub cache_expiration: Duration,
    pub clear_cache_on_start: bool,
    /// Poll sources for changes and reload affected plugins
    pub watch_enabled: bool,
    #[serde(with = "duration_ms")]
    pub watch_interval: Duration,
    /// Glob patterns a location (or its file name) must match to be watched
    pub watch_patterns: Vec<String>,
    /// Path of the `sandbox-worker` executable
    pub worker_binary: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("./plugins"),
            temp_dir: std::env::temp_dir().join("plugin-runtime"),
            cache_dir: PathBuf::from("./.plugin-cache"),
            auto_load: true,
            load_timeout: Duration::from_secs(30),
            max_concurrent_loads: 4,
            retry_attempts: 2,
            sandbox_enabled: true,
            default_permissions: Vec::new(),
            isolation_level: IsolationLevel::Vm,
            resolve_dependencies: true,
            strict_dependencies: true,
            allow_missing_dependencies: false,
            cache_enabled: true,
            cache_expiration: Duration::from_secs(3600), // 1 hour
            clear_cache_on_start: false,
            watch_enabled: false,
            watch_interval: Duration::from_secs(5),
            watch_patterns: vec!["*.json".into(), "*.yaml".into(), "*.yml".into()],
            worker_binary: None,
        }
    }
}

impl LoaderConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` when the file is unreadable, a value has
    /// the wrong type, or the result fails [`LoaderConfig::validate`].
    pub fn load(path: Option<&Path>) -> PluginResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("watch_patterns")
                    .with_list_parse_key("default_permissions"),
            )
            .build()?;

        let loaded: Self = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the loader cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` naming the offending field.
    pub fn validate(&self) -> PluginResult<()> {
        if self.max_concurrent_loads == 0 {
            return Err(PluginRuntimeError::ConfigurationError(
                "max_concurrent_loads must be at least 1".to_string(),
            ));
        }
        if self.load_timeout.is_zero() {
            return Err(PluginRuntimeError::ConfigurationError(
                "load_timeout must be positive".to_string(),
            ));
        }
        if self.watch_enabled && self.watch_interval.is_zero() {
            return Err(PluginRuntimeError::ConfigurationError(
                "watch_interval must be positive when watching is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Sandbox policy for descriptors that do not declare their own
    pub fn default_sandbox_policy(&self) -> SandboxPolicy {
        SandboxPolicy {
            isolation_level: self.isolation_level,
            permissions: self.default_permissions.iter().cloned().collect(),
            time_limit: self.load_timeout,
            ..SandboxPolicy::default()
        }
    }
}

/// Serde helper storing a [`Duration`] as integer milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = LoaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_loads, 4);
        assert!(config.strict_dependencies);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = LoaderConfig {
            max_concurrent_loads: 0,
            ..LoaderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PluginRuntimeError::ConfigurationError(_))
        ));
    }

    #[test]
    fn loads_yaml_file_over_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "max_concurrent_loads: 2\nload_timeout: 1500\nisolation_level: process\nwatch_patterns: [\"*.plugin.json\"]"
        )
        .expect("write config");

        let config = LoaderConfig::load(Some(file.path())).expect("config loads");
        assert_eq!(config.max_concurrent_loads, 2);
        assert_eq!(config.load_timeout, Duration::from_millis(1500));
        assert_eq!(config.isolation_level, IsolationLevel::Process);
        assert_eq!(config.watch_patterns, vec!["*.plugin.json".to_string()]);
        assert!(config.cache_enabled, "unspecified fields keep defaults");
    }

    #[test]
    fn durations_serialize_as_milliseconds() {
        let json = serde_json::to_value(LoaderConfig::default()).expect("serializable");
        assert_eq!(json["watch_interval"], 5000);
        assert_eq!(json["cache_expiration"], 3_600_000);
    }

    #[test]
    fn default_policy_follows_loader_settings() {
        let config = LoaderConfig {
            default_permissions: vec!["kv.read".into()],
            isolation_level: IsolationLevel::None,
            load_timeout: Duration::from_secs(2),
            ..LoaderConfig::default()
        };
        let policy = config.default_sandbox_policy();
        assert_eq!(policy.isolation_level, IsolationLevel::None);
        assert!(policy.check_permission("kv.read"));
        assert_eq!(policy.time_limit, Duration::from_secs(2));
    }
}
