//! Plugin API definitions and interfaces
//!
//! Defines the capability interface every plugin implements, the
//! configuration handed to it at initialization, and the serializable
//! result records the loader returns.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCategory, PluginResult, PluginRuntimeError};
use crate::lifecycle::PluginState;

/// Capability interface implemented by every plugin.
///
/// The runtime owns the instance exclusively once it is created from the
/// descriptor's factory and only calls the lifecycle hooks from the
/// lifecycle manager, so implementations never observe concurrent hook calls.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Static plugin information
    fn metadata(&self) -> &PluginMetadata;

    /// State as last reported to the plugin through `on_state_change`
    fn state(&self) -> PluginState;

    /// Ids the plugin itself expects to be available
    fn dependencies(&self) -> Vec<String> {
        self.metadata().dependency_versions.keys().cloned().collect()
    }

    /// Initialize plugin with configuration
    async fn initialize(&mut self, config: &PluginConfig) -> PluginResult<()>;

    async fn start(&mut self) -> PluginResult<()>;

    async fn stop(&mut self) -> PluginResult<()>;

    /// Release everything the plugin acquired; called once, before removal
    async fn uninstall(&mut self) -> PluginResult<()>;

    fn on_state_change(&mut self, _state: PluginState) {}

    fn on_config_change(&mut self, _config: &PluginConfig) {}

    fn on_error(&mut self, _error: &PluginRuntimeError) {}
}

/// Plugin information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name
    pub name: String,
    /// Plugin version (semver)
    pub version: String,
    /// Plugin description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Plugin author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Semver requirement per dependency id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency_versions: BTreeMap<String, String>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            author: None,
            dependency_versions: BTreeMap::new(),
        }
    }

    /// Require `dependency` to be registered at a version matching `requirement`
    #[must_use]
    pub fn with_requirement(
        mut self,
        dependency: impl Into<String>,
        requirement: impl Into<String>,
    ) -> Self {
        self.dependency_versions
            .insert(dependency.into(), requirement.into());
        self
    }
}

/// Configuration passed to the `initialize` hook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin the configuration belongs to
    pub plugin_id: String,
    /// Plugin-specific settings
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Capabilities granted by the sandbox policy
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl PluginConfig {
    /// Look up a setting by key
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

/// Start, end and duration of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Timings {
    /// Close a timing window opened at `start` / `clock`
    pub fn finish(start: DateTime<Utc>, clock: Instant) -> Self {
        Self {
            start,
            end: Utc::now(),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Failure carried inside a result record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&PluginRuntimeError> for ResultError {
    fn from(error: &PluginRuntimeError) -> Self {
        Self {
            category: error.category(),
            message: error.to_string(),
        }
    }
}

/// Plugin details attached to a successful load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMetadata {
    pub state: Option<PluginState>,
    pub dependencies: Vec<String>,
    pub memory_usage: Option<u64>,
    pub cpu_usage: Option<f32>,
}

/// Outcome of loading one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub success: bool,
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    pub timings: Timings,
    pub metadata: LoadMetadata,
    /// Served from the result cache
    #[serde(default)]
    pub cached: bool,
}

impl LoadResult {
    pub fn succeeded(plugin_id: impl Into<String>, timings: Timings, metadata: LoadMetadata) -> Self {
        Self {
            success: true,
            plugin_id: plugin_id.into(),
            error: None,
            timings,
            metadata,
            cached: false,
        }
    }

    pub fn failed(plugin_id: impl Into<String>, error: &PluginRuntimeError, timings: Timings) -> Self {
        Self {
            success: false,
            plugin_id: plugin_id.into(),
            error: Some(error.into()),
            timings,
            metadata: LoadMetadata::default(),
            cached: false,
        }
    }

    /// Category of the failure, if any
    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().map(|e| e.category)
    }
}

/// Plugin details attached to an unload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnloadMetadata {
    /// State the plugin was in before removal
    pub state: Option<PluginState>,
    pub dependents: Vec<String>,
}

/// Outcome of unloading one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnloadResult {
    pub success: bool,
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    pub timings: Timings,
    pub metadata: UnloadMetadata,
}

impl UnloadResult {
    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().map(|e| e.category)
    }
}
