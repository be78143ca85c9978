//! Plugin sources
//!
//! A [`PluginSource`] turns opaque locations into descriptors. Code is never
//! loaded dynamically: a manifest names a constructor registered in the
//! [`FactoryRegistry`] by the embedding application.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::api::{Plugin, PluginMetadata};
use crate::descriptor::{DescriptorConfig, PluginDescriptor, PluginFactory};
use crate::error::{PluginResult, PluginRuntimeError};

/// Directory levels below the root that are scanned for manifests
const MAX_SCAN_DEPTH: usize = 4;

/// Where plugin descriptors come from
#[async_trait]
pub trait PluginSource: Send + Sync {
    /// Locations currently available, sorted
    async fn discover(&self) -> PluginResult<Vec<String>>;

    /// Build the descriptor stored at `location`
    async fn load(&self, location: &str) -> PluginResult<PluginDescriptor>;

    /// Token that changes whenever the content at `location` changes
    async fn fingerprint(&self, _location: &str) -> Option<String> {
        None
    }
}

/// Constructors registered by the embedding application
#[derive(Default)]
pub struct FactoryRegistry {
    factories: DashMap<String, PluginFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` under `name`, replacing any previous one
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn get(&self, name: &str) -> Option<PluginFactory> {
        self.factories.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("FactoryRegistry").field("factories", &names).finish()
    }
}

/// Minimal plugin manifest, as JSON or YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    /// Defaults to `id`
    #[serde(default)]
    pub name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub dependency_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub config: DescriptorConfig,
    /// Factory name; defaults to `id`
    #[serde(default)]
    pub factory: Option<String>,
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            version: version.into(),
            description: None,
            author: None,
            dependency_versions: BTreeMap::new(),
            config: DescriptorConfig::default(),
            factory: None,
        }
    }

    /// Resolve the factory and build a descriptor.
    ///
    /// # Errors
    ///
    /// `DescriptorInvalid` when no factory is registered under the
    /// manifest's factory name.
    pub fn into_descriptor(self, location: &str, factories: &FactoryRegistry) -> PluginResult<PluginDescriptor> {
        let factory_name = self.factory.as_deref().unwrap_or(&self.id);
        let factory = factories.get(factory_name).ok_or_else(|| {
            PluginRuntimeError::DescriptorInvalid(format!(
                "no factory registered as '{factory_name}' for plugin '{}'",
                self.id
            ))
        })?;

        let metadata = PluginMetadata {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            version: self.version,
            description: self.description,
            author: self.author,
            dependency_versions: self.dependency_versions,
        };
        Ok(PluginDescriptor::new(self.id, location, metadata, factory).with_config(self.config))
    }
}

/// In-memory manifests, mostly for embedding and tests
#[derive(Debug)]
pub struct MemorySource {
    factories: Arc<FactoryRegistry>,
    manifests: DashMap<String, (PluginManifest, u64)>,
    revision: AtomicU64,
}

impl MemorySource {
    pub fn new(factories: Arc<FactoryRegistry>) -> Self {
        Self {
            factories,
            manifests: DashMap::new(),
            revision: AtomicU64::new(0),
        }
    }

    /// Add or replace the manifest at `location`
    pub fn insert(&self, location: impl Into<String>, manifest: PluginManifest) {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        self.manifests.insert(location.into(), (manifest, revision));
    }

    pub fn remove(&self, location: &str) -> Option<PluginManifest> {
        self.manifests.remove(location).map(|(_, (manifest, _))| manifest)
    }
}

#[async_trait]
impl PluginSource for MemorySource {
    async fn discover(&self) -> PluginResult<Vec<String>> {
        let mut locations: Vec<String> = self.manifests.iter().map(|e| e.key().clone()).collect();
        locations.sort();
        Ok(locations)
    }

    async fn load(&self, location: &str) -> PluginResult<PluginDescriptor> {
        let manifest = self
            .manifests
            .get(location)
            .map(|entry| entry.value().0.clone())
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(location.to_string()))?;
        manifest.into_descriptor(location, &self.factories)
    }

    async fn fingerprint(&self, location: &str) -> Option<String> {
        self.manifests.get(location).map(|entry| entry.value().1.to_string())
    }
}

/// Manifests on disk below a root directory
#[derive(Debug)]
pub struct DirectorySource {
    root: PathBuf,
    patterns: Vec<WildMatch>,
    factories: Arc<FactoryRegistry>,
}

impl DirectorySource {
    /// `patterns` are matched against file names, e.g. `*.yaml`
    pub fn new(root: impl Into<PathBuf>, patterns: &[String], factories: Arc<FactoryRegistry>) -> Self {
        Self {
            root: root.into(),
            patterns: patterns.iter().map(|p| WildMatch::new(p)).collect(),
            factories,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_manifest(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        ManifestFormat::of(path).is_some() && self.patterns.iter().any(|p| p.matches(name))
    }

    async fn scan(&self) -> std::io::Result<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![(self.root.clone(), 0usize)];
        while let Some((dir, depth)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if depth < MAX_SCAN_DEPTH {
                        pending.push((path, depth + 1));
                    }
                } else if self.is_manifest(&path) {
                    found.push(path.display().to_string());
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestFormat {
    Json,
    Yaml,
}

impl ManifestFormat {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

#[async_trait]
impl PluginSource for DirectorySource {
    async fn discover(&self) -> PluginResult<Vec<String>> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            debug!(root = %self.root.display(), "plugins directory does not exist");
            return Ok(Vec::new());
        }
        self.scan()
            .await
            .map_err(|e| PluginRuntimeError::source_failure(self.root.display().to_string(), e.to_string()))
    }

    async fn load(&self, location: &str) -> PluginResult<PluginDescriptor> {
        let path = Path::new(location);
        let format = ManifestFormat::of(path).ok_or_else(|| {
            PluginRuntimeError::DescriptorInvalid(format!("'{location}' is not a JSON or YAML manifest"))
        })?;
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PluginRuntimeError::source_failure(location, e.to_string()))?;

        let manifest: PluginManifest = match format {
            ManifestFormat::Json => serde_json::from_str(&content)
                .map_err(|e| PluginRuntimeError::DescriptorInvalid(format!("{location}: {e}")))?,
            ManifestFormat::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| PluginRuntimeError::DescriptorInvalid(format!("{location}: {e}")))?,
        };
        manifest.into_descriptor(location, &self.factories)
    }

    async fn fingerprint(&self, location: &str) -> Option<String> {
        let metadata = match tokio::fs::metadata(location).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(location, error = %e, "cannot stat plugin manifest");
                return None;
            }
        };
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |since| since.as_nanos());
        Some(format!("{modified}-{}", metadata.len()))
    }
}
