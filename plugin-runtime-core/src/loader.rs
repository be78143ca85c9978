//! Plugin loader implementation
//!
//! The [`Loader`] ties a [`PluginSource`] to the lifecycle manager. One load
//! is a pipeline:
//!
//! 1. serve a fresh cached result for the location, if any
//! 2. fetch the descriptor from the source (retried with backoff)
//! 3. validate it against the registered plugins
//! 4. create and initialize its sandbox
//! 5. run the `initialize` hook, then `start` when `auto_start` is set
//! 6. admit it into the registry and cache the result
//!
//! Steps 2, 4 and 5 run without the registry lock, so up to
//! `max_concurrent_loads` pipelines make progress at once. Step 6 repeats
//! the validation of step 3 against the registry as it is by then. A
//! failing pipeline leaves nothing registered and never affects its
//! siblings.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use wildmatch::WildMatch;

use crate::api::{LoadMetadata, LoadResult, Timings, UnloadMetadata, UnloadResult};
use crate::cache::{MemoryResultCache, ResultCache};
use crate::config::LoaderConfig;
use crate::descriptor::PluginDescriptor;
use crate::error::{PluginResult, PluginRuntimeError, RetryPolicy};
use crate::events::{EventDispatcher, EventKind, PluginEvent};
use crate::lifecycle::{LifecycleManager, PluginState, Rejected};
use crate::resolver::{DependencyResolver, DependencyStats};
use crate::sandbox::{GuestOutcome, Sandbox, SandboxCode, SandboxSettings, SandboxStats};
use crate::source::{DirectorySource, FactoryRegistry, PluginSource};

/// Per-plugin figures in [`LoaderStats`]
#[derive(Debug, Clone, Serialize)]
pub struct PluginStats {
    pub plugin_id: String,
    pub state: PluginState,
    pub memory_usage: Option<u64>,
    pub cpu_usage: Option<f32>,
    pub load_duration_ms: Option<u64>,
    pub sandbox: Option<SandboxStats>,
}

/// Loader-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub total_plugins: usize,
    pub active_plugins: usize,
    /// Registered plugins currently in `ERROR`
    pub failed_plugins: usize,
    pub total_loads: u64,
    pub failed_loads: u64,
    pub cache_hits: u64,
    pub average_load_ms: f64,
    pub plugins: Vec<PluginStats>,
    pub dependencies: DependencyStats,
}

/// One entry of [`Loader::list_plugins`]
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub source_location: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LoadMetrics {
    loads: u64,
    failed: u64,
    cache_hits: u64,
    total_load_ms: u64,
}

struct WatchHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Why a pipeline stopped. `reported` is set when the lifecycle already
/// emitted an `error` event for it.
struct Failed {
    error: PluginRuntimeError,
    reported: bool,
}

impl From<PluginRuntimeError> for Failed {
    fn from(error: PluginRuntimeError) -> Self {
        Self { error, reported: false }
    }
}

/// A fetched descriptor waiting for its pipeline
struct Pending {
    location: String,
    descriptor: PluginDescriptor,
    started: DateTime<Utc>,
    clock: Instant,
}

/// Builder for [`Loader`]
#[derive(Default)]
pub struct LoaderBuilder {
    config: LoaderConfig,
    source: Option<Arc<dyn PluginSource>>,
    cache: Option<Arc<dyn ResultCache>>,
    events: Option<Arc<EventDispatcher>>,
    factories: Option<Arc<FactoryRegistry>>,
}

impl LoaderBuilder {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn source(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Factories for the default directory source
    #[must_use]
    pub fn factories(mut self, factories: Arc<FactoryRegistry>) -> Self {
        self.factories = Some(factories);
        self
    }

    /// # Errors
    ///
    /// `ConfigurationError` when the configuration fails validation.
    pub fn build(self) -> PluginResult<Loader> {
        self.config.validate()?;
        let config = self.config;

        let source = match self.source {
            Some(source) => source,
            None => Arc::new(DirectorySource::new(
                config.plugins_dir.clone(),
                &config.watch_patterns,
                self.factories.unwrap_or_default(),
            )),
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryResultCache::default()));
        let events = self.events.unwrap_or_default();
        let lifecycle = LifecycleManager::new(Arc::clone(&events)).with_allow_missing(config.allow_missing_dependencies);
        let sandbox_settings = SandboxSettings {
            worker_binary: config.worker_binary.clone(),
            work_dir: config.temp_dir.clone(),
            ..SandboxSettings::default()
        };

        Ok(Loader {
            retry: RetryPolicy::for_source_io(config.retry_attempts),
            watch_patterns: config.watch_patterns.iter().map(|p| WildMatch::new(p)).collect(),
            config,
            source,
            cache,
            events,
            lifecycle: tokio::sync::Mutex::new(lifecycle),
            sandbox_settings,
            locations: DashMap::new(),
            fingerprints: DashMap::new(),
            metrics: Mutex::new(LoadMetrics::default()),
            watcher: Mutex::new(None),
        })
    }
}

/// Plugin loader
pub struct Loader {
    config: LoaderConfig,
    source: Arc<dyn PluginSource>,
    cache: Arc<dyn ResultCache>,
    events: Arc<EventDispatcher>,
    lifecycle: tokio::sync::Mutex<LifecycleManager>,
    sandbox_settings: SandboxSettings,
    retry: RetryPolicy,
    watch_patterns: Vec<WildMatch>,
    /// plugin id -> location it was loaded from
    locations: DashMap<String, String>,
    /// location -> fingerprint at load time
    fingerprints: DashMap<String, String>,
    metrics: Mutex<LoadMetrics>,
    watcher: Mutex<Option<WatchHandle>>,
}

impl Loader {
    /// # Errors
    ///
    /// `ConfigurationError` when the configuration fails validation.
    pub fn new(config: LoaderConfig, source: Arc<dyn PluginSource>) -> PluginResult<Self> {
        Self::builder(config).source(source).build()
    }

    pub fn builder(config: LoaderConfig) -> LoaderBuilder {
        LoaderBuilder::new(config)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Receive plugin events, optionally of one kind only
    pub fn subscribe(&self, kind: Option<EventKind>) -> mpsc::UnboundedReceiver<PluginEvent> {
        self.events.channel(kind)
    }

    /// Load the plugin stored at `location`
    pub async fn load_plugin(&self, location: &str) -> LoadResult {
        if let Some(hit) = self.cached(location).await {
            return hit;
        }

        let started = Utc::now();
        let clock = Instant::now();
        match self.fetch(location).await {
            Ok(descriptor) => {
                self.run_pipeline(Pending {
                    location: location.to_string(),
                    descriptor,
                    started,
                    clock,
                })
                .await
            }
            Err(error) => self.load_failed(location, &error, false, started, clock),
        }
    }

    /// Load everything the source discovers, dependencies first.
    ///
    /// # Errors
    ///
    /// Only discovery failures; individual load failures are reported in
    /// the returned results.
    pub async fn load_plugins(&self) -> PluginResult<Vec<LoadResult>> {
        let locations = self.retry.run("discover", || self.source.discover()).await?;
        debug!(count = locations.len(), "discovered plugin locations");
        let limit = self.config.max_concurrent_loads;

        let mut results = Vec::with_capacity(locations.len());
        let mut uncached = Vec::new();
        for location in locations {
            match self.cached(&location).await {
                Some(hit) => results.push(hit),
                None => uncached.push(location),
            }
        }

        let mut fetched: Vec<(String, PluginResult<PluginDescriptor>, DateTime<Utc>, Instant)> =
            stream::iter(uncached)
                .map(|location| async move {
                    let started = Utc::now();
                    let clock = Instant::now();
                    let descriptor = self.fetch(&location).await;
                    (location, descriptor, started, clock)
                })
                .buffer_unordered(limit)
                .collect()
                .await;
        fetched.sort_by(|a, b| a.0.cmp(&b.0));

        let mut planner = DependencyResolver::new();
        let mut pending: HashMap<String, Pending> = HashMap::new();
        for (location, descriptor, started, clock) in fetched {
            let descriptor = match descriptor {
                Ok(descriptor) => descriptor,
                Err(error) => {
                    results.push(self.load_failed(&location, &error, false, started, clock));
                    continue;
                }
            };
            let id = descriptor.id().to_string();
            if pending.contains_key(&id) {
                let error = PluginRuntimeError::AlreadyRegistered(id);
                results.push(self.load_failed(&location, &error, false, started, clock));
                continue;
            }
            planner.add_plugin(&descriptor);
            pending.insert(
                id,
                Pending {
                    location,
                    descriptor,
                    started,
                    clock,
                },
            );
        }

        for wave in planner.get_load_waves() {
            let batch: Vec<Pending> = wave.iter().filter_map(|id| pending.remove(id)).collect();
            debug!(plugins = ?wave, "loading wave");
            let wave_results: Vec<LoadResult> = stream::iter(batch)
                .map(|item| self.run_pipeline(item))
                .buffer_unordered(limit)
                .collect()
                .await;
            results.extend(wave_results);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        info!(total = results.len(), failed, "plugin batch loaded");
        Ok(results)
    }

    /// Unload a plugin, destroying its sandbox.
    ///
    /// With `strict_dependencies` a plugin anything depends on, directly or
    /// transitively, is refused with `HasDependents`.
    pub async fn unload_plugin(&self, id: &str) -> UnloadResult {
        self.unload_with(id, self.config.strict_dependencies).await
    }

    async fn unload_with(&self, id: &str, strict: bool) -> UnloadResult {
        let started = Utc::now();
        let clock = Instant::now();
        match self.remove(id, strict).await {
            Ok(metadata) => UnloadResult {
                success: true,
                plugin_id: id.to_string(),
                error: None,
                timings: Timings::finish(started, clock),
                metadata,
            },
            Err(error) => {
                warn!(plugin_id = %id, error = %error, "unload failed");
                UnloadResult {
                    success: false,
                    plugin_id: id.to_string(),
                    error: Some((&error).into()),
                    timings: Timings::finish(started, clock),
                    metadata: UnloadMetadata::default(),
                }
            }
        }
    }

    async fn remove(&self, id: &str, strict: bool) -> PluginResult<UnloadMetadata> {
        let mut lifecycle = self.lifecycle.lock().await;
        let state = lifecycle
            .state(id)
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(id.to_string()))?;
        let impact = lifecycle.resolver().get_impact_analysis(id);
        if strict && impact.total_impact > 0 {
            let mut dependents = impact.direct;
            dependents.extend(impact.indirect);
            return Err(PluginRuntimeError::HasDependents {
                plugin_id: id.to_string(),
                dependents,
            });
        }

        let mut descriptor = lifecycle.unload(id, true).await?;
        drop(lifecycle);

        if let Some(sandbox) = descriptor.take_sandbox() {
            sandbox.destroy().await;
        }
        let location = self
            .locations
            .remove(id)
            .map_or_else(|| descriptor.source_location().to_string(), |(_, location)| location);
        self.cache.invalidate(&location).await;
        self.fingerprints.remove(&location);

        Ok(UnloadMetadata {
            state: Some(state),
            dependents: impact.direct,
        })
    }

    /// Unload then load again from the same location.
    ///
    /// Not atomic: when the new load fails the plugin stays unloaded.
    pub async fn reload_plugin(&self, id: &str) -> LoadResult {
        let started = Utc::now();
        let clock = Instant::now();
        let location = {
            let lifecycle = self.lifecycle.lock().await;
            lifecycle.get(id).map(|d| d.source_location().to_string())
        };
        let location = match self.locations.get(id).map(|e| e.value().clone()).or(location) {
            Some(location) => location,
            None => {
                let error = PluginRuntimeError::PluginNotFound(id.to_string());
                return LoadResult::failed(id, &error, Timings::finish(started, clock));
            }
        };

        let unloaded = self.unload_plugin(id).await;
        if !unloaded.success {
            return LoadResult {
                success: false,
                plugin_id: id.to_string(),
                error: unloaded.error,
                timings: Timings::finish(started, clock),
                metadata: LoadMetadata::default(),
                cached: false,
            };
        }
        info!(plugin_id = %id, %location, "reloading plugin");
        self.load_plugin(&location).await
    }

    /// Clear the cache if configured, load everything when `auto_load` is
    /// set and start the watch loop when `watch_enabled` is set.
    ///
    /// # Errors
    ///
    /// Discovery failures from [`Loader::load_plugins`].
    pub async fn start(self: &Arc<Self>) -> PluginResult<Vec<LoadResult>> {
        if self.config.clear_cache_on_start {
            self.cache.clear().await;
        }
        let results = if self.config.auto_load {
            self.load_plugins().await?
        } else {
            Vec::new()
        };
        if self.config.watch_enabled {
            self.start_watching();
        }
        info!(loaded = results.len(), "plugin loader started");
        Ok(results)
    }

    /// Stop watching and unload every plugin, dependents first
    pub async fn stop(&self) -> Vec<UnloadResult> {
        self.stop_watching().await;
        let order = self.lifecycle.lock().await.resolver().get_unload_order();
        let mut results = Vec::with_capacity(order.len());
        for id in order {
            results.push(self.unload_with(&id, false).await);
        }
        info!(unloaded = results.len(), "plugin loader stopped");
        results
    }

    /// Poll source fingerprints every `watch_interval` and reload changed
    /// plugins. Does nothing if already watching.
    pub fn start_watching(self: &Arc<Self>) {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown, mut stopped) = oneshot::channel();
        let loader: Weak<Self> = Arc::downgrade(self);
        let period = self.config.watch_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let Some(strong) = loader.upgrade() else { break };
                        let reloaded = strong.poll_changes().await;
                        if !reloaded.is_empty() {
                            debug!(count = reloaded.len(), "watch loop reloaded plugins");
                        }
                    }
                }
            }
            debug!("watch loop stopped");
        });

        *slot = Some(WatchHandle { shutdown, task });
        info!(interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX), "watching plugin sources");
    }

    pub async fn stop_watching(&self) {
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                warn!(error = %e, "watch task ended abnormally");
            }
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Reload every loaded plugin whose watched location changed since it
    /// was loaded
    pub async fn poll_changes(&self) -> Vec<LoadResult> {
        let loaded: Vec<(String, String)> = self
            .locations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (id, location) in loaded {
            if !self.is_watched(&location) {
                continue;
            }
            let Some(current) = self.source.fingerprint(&location).await else {
                continue;
            };
            let previous = self.fingerprints.get(&location).map(|e| e.value().clone());
            match previous {
                Some(previous) if previous == current => {}
                None => {
                    self.fingerprints.insert(location, current);
                }
                Some(_) => {
                    info!(plugin_id = %id, %location, "plugin source changed");
                    // Recorded first so a failing reload is not retried every tick.
                    self.fingerprints.insert(location, current);
                    results.push(self.reload_plugin(&id).await);
                }
            }
        }
        results
    }

    fn is_watched(&self, location: &str) -> bool {
        let file_name = Path::new(location)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(location);
        self.watch_patterns
            .iter()
            .any(|pattern| pattern.matches(location) || pattern.matches(file_name))
    }

    pub async fn get_plugin_state(&self, id: &str) -> Option<PluginState> {
        self.lifecycle.lock().await.state(id)
    }

    pub async fn list_plugins(&self) -> Vec<PluginSummary> {
        let lifecycle = self.lifecycle.lock().await;
        let mut plugins: Vec<PluginSummary> = lifecycle
            .descriptors()
            .map(|d| PluginSummary {
                id: d.id().to_string(),
                name: d.metadata.name.clone(),
                version: d.metadata.version.clone(),
                state: d.state(),
                source_location: d.source_location().to_string(),
                dependencies: d.dependencies().iter().cloned().collect(),
                dependents: d.dependents().iter().cloned().collect(),
                loaded_at: d.loaded_at(),
            })
            .collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    pub async fn get_stats(&self) -> LoaderStats {
        let lifecycle = self.lifecycle.lock().await;
        let mut plugins: Vec<PluginStats> = lifecycle
            .descriptors()
            .map(|d| {
                let sandbox = d.sandbox().map(|s| s.stats());
                PluginStats {
                    plugin_id: d.id().to_string(),
                    state: d.state(),
                    memory_usage: sandbox.as_ref().map(|s| s.memory_bytes),
                    cpu_usage: sandbox.as_ref().map(|s| s.cpu_percent),
                    load_duration_ms: d
                        .load_duration()
                        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
                    sandbox,
                }
            })
            .collect();
        plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        let dependencies = lifecycle.resolver().get_dependency_stats();
        drop(lifecycle);

        let metrics = self.metrics.lock();
        let succeeded = metrics.loads.saturating_sub(metrics.failed);
        let average_load_ms = if succeeded == 0 {
            0.0
        } else {
            metrics.total_load_ms as f64 / succeeded as f64
        };

        LoaderStats {
            total_plugins: plugins.len(),
            active_plugins: plugins.iter().filter(|p| p.state == PluginState::Active).count(),
            failed_plugins: plugins.iter().filter(|p| p.state == PluginState::Error).count(),
            total_loads: metrics.loads,
            failed_loads: metrics.failed,
            cache_hits: metrics.cache_hits,
            average_load_ms,
            plugins,
            dependencies,
        }
    }

    pub async fn sandbox_stats(&self, id: &str) -> Option<SandboxStats> {
        self.lifecycle.lock().await.sandbox(id).map(|s| s.stats())
    }

    /// Run `code` inside a loaded plugin's sandbox.
    ///
    /// # Errors
    ///
    /// `PluginNotFound`, `InvalidState` when the plugin has no sandbox, or
    /// the sandbox's execution failure.
    pub async fn execute(&self, id: &str, code: &SandboxCode, context: Value) -> PluginResult<GuestOutcome> {
        let sandbox = self.sandbox_of(id).await?;
        sandbox.execute(code, context).await
    }

    /// Fail with `PermissionDenied` unless the plugin's policy grants
    /// `permission`.
    ///
    /// # Errors
    ///
    /// `PluginNotFound`, `InvalidState` without a sandbox, or
    /// `PermissionDenied`.
    pub async fn require_permission(&self, id: &str, permission: &str) -> PluginResult<()> {
        self.sandbox_of(id).await?.require_permission(permission)
    }

    /// Replace a loaded plugin's settings.
    ///
    /// # Errors
    ///
    /// `PluginNotFound`.
    pub async fn update_config(&self, id: &str, settings: Map<String, Value>) -> PluginResult<()> {
        self.lifecycle.lock().await.update_config(id, settings)
    }

    async fn sandbox_of(&self, id: &str) -> PluginResult<Arc<Sandbox>> {
        let lifecycle = self.lifecycle.lock().await;
        if !lifecycle.contains(id) {
            return Err(PluginRuntimeError::PluginNotFound(id.to_string()));
        }
        lifecycle
            .sandbox(id)
            .ok_or_else(|| PluginRuntimeError::InvalidState(format!("plugin '{id}' has no sandbox")))
    }

    async fn cached(&self, location: &str) -> Option<LoadResult> {
        if !self.config.cache_enabled {
            return None;
        }
        let mut hit = self.cache.get(location).await?;
        let state = self.lifecycle.lock().await.state(&hit.plugin_id);
        let Some(state) = state else {
            self.cache.invalidate(location).await;
            return None;
        };

        hit.cached = true;
        hit.metadata.state = Some(state);
        self.metrics.lock().cache_hits += 1;
        debug!(plugin_id = %hit.plugin_id, location, "serving cached load result");
        Some(hit)
    }

    async fn fetch(&self, location: &str) -> PluginResult<PluginDescriptor> {
        self.retry.run("load descriptor", || self.source.load(location)).await
    }

    async fn run_pipeline(&self, pending: Pending) -> LoadResult {
        let Pending {
            location,
            descriptor,
            started,
            clock,
        } = pending;
        let id = descriptor.id().to_string();

        match self.prepare(descriptor, clock).await {
            Ok(metadata) => {
                let timings = Timings::finish(started, clock);
                let result = LoadResult::succeeded(&id, timings, metadata);
                self.locations.insert(id.clone(), location.clone());
                if let Some(fingerprint) = self.source.fingerprint(&location).await {
                    self.fingerprints.insert(location.clone(), fingerprint);
                }
                if self.config.cache_enabled {
                    self.cache
                        .set(&location, result.clone(), self.config.cache_expiration)
                        .await;
                }
                self.record_load(true, result.timings.duration_ms);
                self.events.emit(
                    EventKind::Load,
                    &id,
                    json!({
                        "location": location,
                        "duration_ms": result.timings.duration_ms,
                        "state": result.metadata.state,
                    }),
                );
                info!(plugin_id = %id, %location, duration_ms = result.timings.duration_ms, "plugin loaded");
                result
            }
            Err(Failed { error, reported }) => self.load_failed(&id, &error, reported, started, clock),
        }
    }

    /// Steps 3 to 6 of the pipeline. Sandbox setup and hooks share one
    /// `load_timeout` deadline; on failure everything acquired so far is
    /// released.
    async fn prepare(&self, mut descriptor: PluginDescriptor, clock: Instant) -> Result<LoadMetadata, Failed> {
        let resolve = self.config.resolve_dependencies;
        let deadline = tokio::time::Instant::now() + self.config.load_timeout;
        self.lifecycle.lock().await.check_candidate(&descriptor, resolve)?;

        if self.config.sandbox_enabled {
            let policy = descriptor
                .config
                .sandbox
                .clone()
                .unwrap_or_else(|| self.config.default_sandbox_policy());
            let sandbox = Arc::new(Sandbox::new(descriptor.id(), policy, self.sandbox_settings.clone()));
            let initialized = tokio::time::timeout_at(deadline, sandbox.initialize())
                .await
                .unwrap_or_else(|_| Err(self.timed_out(descriptor.id())));
            if let Err(error) = initialized {
                sandbox.destroy().await;
                return Err(error.into());
            }
            descriptor.attach_sandbox(sandbox);
        }

        let activated = tokio::time::timeout_at(deadline, self.activate(&mut descriptor)).await;
        let activated = activated.unwrap_or_else(|_| Err(self.timed_out(descriptor.id())));
        if let Err(error) = activated {
            // The lifecycle reports hook failures itself and leaves them in ERROR.
            let reported = descriptor.state() == PluginState::Error;
            self.teardown(&mut descriptor).await;
            return Err(Failed { error, reported });
        }

        let metadata = load_metadata(&descriptor);
        descriptor.mark_loaded(clock.elapsed());
        let admitted = self.lifecycle.lock().await.admit(descriptor, resolve);
        if let Err(rejected) = admitted {
            let Rejected { error, mut descriptor } = *rejected;
            warn!(plugin_id = %descriptor.id(), error = %error, "prepared plugin no longer admissible");
            self.teardown(&mut descriptor).await;
            return Err(error.into());
        }
        Ok(metadata)
    }

    fn timed_out(&self, id: &str) -> PluginRuntimeError {
        PluginRuntimeError::Timeout(format!(
            "loading '{id}' exceeded {} ms",
            self.config.load_timeout.as_millis()
        ))
    }

    async fn activate(&self, descriptor: &mut PluginDescriptor) -> PluginResult<()> {
        LifecycleManager::initialize_detached(descriptor, &self.events).await?;
        if descriptor.config.auto_start {
            LifecycleManager::start_detached(descriptor, &self.events).await?;
        }
        Ok(())
    }

    async fn teardown(&self, descriptor: &mut PluginDescriptor) {
        LifecycleManager::uninstall_detached(descriptor, &self.events).await;
        if let Some(sandbox) = descriptor.take_sandbox() {
            sandbox.destroy().await;
        }
    }

    fn load_failed(
        &self,
        plugin_id: &str,
        error: &PluginRuntimeError,
        reported: bool,
        started: DateTime<Utc>,
        clock: Instant,
    ) -> LoadResult {
        let result = LoadResult::failed(plugin_id, error, Timings::finish(started, clock));
        self.record_load(false, result.timings.duration_ms);
        if !reported {
            self.events.emit(
                EventKind::Error,
                plugin_id,
                json!({ "stage": "load", "category": error.category(), "message": error.to_string() }),
            );
        }
        warn!(plugin_id, error = %error, "plugin load failed");
        result
    }

    fn record_load(&self, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock();
        metrics.loads += 1;
        if success {
            metrics.total_load_ms = metrics.total_load_ms.saturating_add(duration_ms);
        } else {
            metrics.failed += 1;
        }
    }
}

fn load_metadata(descriptor: &PluginDescriptor) -> LoadMetadata {
    let stats = descriptor.sandbox().map(|sandbox| sandbox.stats());
    LoadMetadata {
        state: Some(descriptor.state()),
        dependencies: descriptor.declared_dependencies(),
        memory_usage: stats.as_ref().map(|s| s.memory_bytes),
        cpu_usage: stats.as_ref().map(|s| s.cpu_percent),
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("config", &self.config)
            .field("loaded", &self.locations.len())
            .field("watching", &self.is_watching())
            .finish_non_exhaustive()
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.task.abort();
        }
    }
}
