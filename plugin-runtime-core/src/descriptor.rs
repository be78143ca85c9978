//! Plugin descriptors
//!
//! A [`PluginDescriptor`] is the runtime's record of one plugin: identity,
//! declared dependencies, the factory that builds its instance, and the
//! lifecycle state that only the lifecycle manager mutates.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{Plugin, PluginConfig, PluginMetadata};
use crate::error::{PluginResult, PluginRuntimeError};
use crate::lifecycle::PluginState;
use crate::sandbox::{Sandbox, SandboxPolicy};

/// Constructor for plugin instances
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Declared configuration of a plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Plugins that must be initialized first
    pub dependencies: Vec<String>,
    /// Dependencies that may be absent
    pub optional_dependencies: BTreeSet<String>,
    /// Sandbox policy; loader defaults apply when absent
    pub sandbox: Option<SandboxPolicy>,
    /// Start right after initialization
    pub auto_start: bool,
    /// Settings passed to the `initialize` hook
    pub settings: Map<String, Value>,
}

/// Runtime record of one plugin
pub struct PluginDescriptor {
    id: String,
    source_location: String,
    /// Plugin metadata
    pub metadata: PluginMetadata,
    /// Declared configuration
    pub config: DescriptorConfig,
    factory: PluginFactory,
    pub(crate) instance: Option<Box<dyn Plugin>>,
    pub(crate) state: PluginState,
    pub(crate) error: Option<String>,
    pub(crate) dependencies: BTreeSet<String>,
    pub(crate) dependents: BTreeSet<String>,
    pub(crate) sandbox: Option<Arc<Sandbox>>,
    pub(crate) last_updated: DateTime<Utc>,
    pub(crate) loaded_at: Option<DateTime<Utc>>,
    pub(crate) load_duration: Option<Duration>,
}

impl PluginDescriptor {
    pub fn new(
        id: impl Into<String>,
        source_location: impl Into<String>,
        metadata: PluginMetadata,
        factory: PluginFactory,
    ) -> Self {
        Self {
            id: id.into(),
            source_location: source_location.into(),
            metadata,
            config: DescriptorConfig::default(),
            factory,
            instance: None,
            state: PluginState::Registered,
            error: None,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            sandbox: None,
            last_updated: Utc::now(),
            loaded_at: None,
            load_duration: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: DescriptorConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare a required dependency
    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.config.dependencies.contains(&dependency) {
            self.config.dependencies.push(dependency);
        }
        self
    }

    /// Declare an optional dependency
    #[must_use]
    pub fn optionally_depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.config.optional_dependencies.insert(dependency.into());
        self
    }

    #[must_use]
    pub fn with_sandbox_policy(mut self, policy: SandboxPolicy) -> Self {
        self.config.sandbox = Some(policy);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_location(&self) -> &str {
        &self.source_location
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Last fatal error, if the plugin is in `ERROR`
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Current dependency edges
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Plugins that currently depend on this one
    pub fn dependents(&self) -> &BTreeSet<String> {
        &self.dependents
    }

    pub fn has_instance(&self) -> bool {
        self.instance.is_some()
    }

    pub fn instance(&self) -> Option<&dyn Plugin> {
        self.instance.as_deref()
    }

    pub fn sandbox(&self) -> Option<&Arc<Sandbox>> {
        self.sandbox.as_ref()
    }

    pub fn attach_sandbox(&mut self, sandbox: Arc<Sandbox>) {
        self.sandbox = Some(sandbox);
    }

    /// Detach the sandbox so the caller can destroy it
    pub fn take_sandbox(&mut self) -> Option<Arc<Sandbox>> {
        self.sandbox.take()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn load_duration(&self) -> Option<Duration> {
        self.load_duration
    }

    pub(crate) fn new_instance(&self) -> Box<dyn Plugin> {
        (self.factory)()
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub(crate) fn mark_loaded(&mut self, duration: Duration) {
        self.loaded_at = Some(Utc::now());
        self.load_duration = Some(duration);
    }

    /// Every dependency id: configured ones, then versioned ones, then optional
    pub fn declared_dependencies(&self) -> Vec<String> {
        let mut declared = self.config.dependencies.clone();
        let versioned = self.metadata.dependency_versions.keys();
        for dependency in versioned.chain(&self.config.optional_dependencies) {
            if !declared.contains(dependency) {
                declared.push(dependency.clone());
            }
        }
        declared
    }

    pub fn is_optional(&self, dependency: &str) -> bool {
        self.config.optional_dependencies.contains(dependency)
    }

    /// Configuration handed to the `initialize` hook
    pub fn plugin_config(&self) -> PluginConfig {
        PluginConfig {
            plugin_id: self.id.clone(),
            settings: self.config.settings.clone(),
            permissions: self
                .sandbox
                .as_ref()
                .map(|sandbox| sandbox.policy().permissions.clone())
                .or_else(|| self.config.sandbox.as_ref().map(|p| p.permissions.clone()))
                .unwrap_or_default(),
        }
    }

    /// Check descriptor shape.
    ///
    /// # Errors
    ///
    /// `DescriptorInvalid` describing the first problem found.
    pub fn validate(&self) -> PluginResult<()> {
        if self.id.trim().is_empty() {
            return Err(invalid("plugin id must not be empty"));
        }
        if self.source_location.trim().is_empty() {
            return Err(invalid(format!("plugin '{}' has no source location", self.id)));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(invalid(format!("plugin '{}' has no name", self.id)));
        }
        Version::parse(&self.metadata.version).map_err(|e| {
            invalid(format!(
                "plugin '{}' version '{}' is not semver: {e}",
                self.id, self.metadata.version
            ))
        })?;
        for (dependency, requirement) in &self.metadata.dependency_versions {
            VersionReq::parse(requirement).map_err(|e| {
                invalid(format!(
                    "plugin '{}' requirement '{requirement}' for '{dependency}' is invalid: {e}",
                    self.id
                ))
            })?;
        }
        if self.declared_dependencies().iter().any(|d| d == &self.id) {
            return Err(invalid(format!("plugin '{}' depends on itself", self.id)));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> PluginRuntimeError {
    PluginRuntimeError::DescriptorInvalid(message.into())
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("id", &self.id)
            .field("source_location", &self.source_location)
            .field("metadata", &self.metadata)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("dependencies", &self.dependencies)
            .field("dependents", &self.dependents)
            .field("has_instance", &self.instance.is_some())
            .field("sandbox", &self.sandbox)
            .field("last_updated", &self.last_updated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Inert(PluginMetadata);

    #[async_trait]
    impl Plugin for Inert {
        fn metadata(&self) -> &PluginMetadata {
            &self.0
        }
        fn state(&self) -> PluginState {
            PluginState::Registered
        }
        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            Ok(())
        }
        async fn start(&mut self) -> PluginResult<()> {
            Ok(())
        }
        async fn stop(&mut self) -> PluginResult<()> {
            Ok(())
        }
        async fn uninstall(&mut self) -> PluginResult<()> {
            Ok(())
        }
    }

    fn descriptor(id: &str, version: &str) -> PluginDescriptor {
        let metadata = PluginMetadata::new(id, version);
        let factory_meta = metadata.clone();
        PluginDescriptor::new(
            id,
            format!("mem://{id}"),
            metadata,
            Arc::new(move || Box::new(Inert(factory_meta.clone())) as Box<dyn Plugin>),
        )
    }

    #[test]
    fn valid_descriptor_passes() {
        let d = descriptor("audit", "1.0.0").depends_on("ledger");
        assert!(d.validate().is_ok());
        assert_eq!(d.state(), PluginState::Registered);
        assert!(!d.has_instance());
    }

    #[test]
    fn bad_version_is_rejected() {
        let d = descriptor("audit", "one");
        assert!(matches!(d.validate(), Err(PluginRuntimeError::DescriptorInvalid(_))));
    }

    #[test]
    fn bad_requirement_is_rejected() {
        let mut d = descriptor("audit", "1.0.0");
        d.metadata = d.metadata.clone().with_requirement("ledger", "not a range");
        assert!(matches!(d.validate(), Err(PluginRuntimeError::DescriptorInvalid(_))));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let d = descriptor("audit", "1.0.0").optionally_depends_on("audit");
        assert!(d.validate().is_err());
    }

    #[test]
    fn declared_dependencies_merge_optional() {
        let d = descriptor("audit", "1.0.0")
            .depends_on("ledger")
            .depends_on("ledger")
            .optionally_depends_on("metrics")
            .optionally_depends_on("ledger");
        assert_eq!(d.declared_dependencies(), vec!["ledger".to_string(), "metrics".to_string()]);
        assert!(d.is_optional("metrics"));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: DescriptorConfig =
            serde_json::from_str(r#"{"dependencies":["ledger"],"auto_start":true}"#).expect("valid");
        assert_eq!(config.dependencies, vec!["ledger".to_string()]);
        assert!(config.auto_start);
        assert!(config.sandbox.is_none());
    }
}
