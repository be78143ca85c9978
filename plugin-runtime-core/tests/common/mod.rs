//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use plugin_runtime_core::{
    FactoryRegistry, IsolationLevel, LoaderConfig, MemorySource, Plugin, PluginConfig, PluginEvent,
    PluginManifest, PluginMetadata, PluginResult, PluginRuntimeError, PluginState,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Records hook calls across every plugin built from the same factories
#[derive(Default)]
pub struct HookLog {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    initializing: AtomicUsize,
    peak_initializing: AtomicUsize,
}

impl HookLog {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Hook calls of one kind, in call order, e.g. `"initialize"` -> `["a", "b"]`
    pub fn calls_of(&self, hook: &str) -> Vec<String> {
        let prefix = format!("{hook}:");
        self.calls
            .lock()
            .iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Make `initialize` fail for `id`
    pub fn fail_initialize(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    /// Most `initialize` hooks ever running at the same time
    pub fn peak_initializing(&self) -> usize {
        self.peak_initializing.load(Ordering::SeqCst)
    }

    fn record(&self, hook: &str, id: &str) {
        self.calls.lock().push(format!("{hook}:{id}"));
    }
}

pub struct TestPlugin {
    metadata: PluginMetadata,
    state: PluginState,
    hooks: Arc<HookLog>,
    start_delay: Option<Duration>,
}

fn delay(config: &PluginConfig, key: &str) -> Option<Duration> {
    config
        .setting(key)
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_millis)
}

#[async_trait]
impl Plugin for TestPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn state(&self) -> PluginState {
        self.state
    }

    async fn initialize(&mut self, config: &PluginConfig) -> PluginResult<()> {
        self.hooks.record("initialize", &config.plugin_id);
        let running = self.hooks.initializing.fetch_add(1, Ordering::SeqCst) + 1;
        self.hooks.peak_initializing.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = delay(config, "delay_ms") {
            tokio::time::sleep(delay).await;
        }
        self.hooks.initializing.fetch_sub(1, Ordering::SeqCst);
        self.start_delay = delay(config, "start_delay_ms");
        if self.hooks.failing.lock().contains(&config.plugin_id) {
            return Err(PluginRuntimeError::InvalidState(format!(
                "{} refused to initialize",
                config.plugin_id
            )));
        }
        Ok(())
    }

    async fn start(&mut self) -> PluginResult<()> {
        self.hooks.record("start", &self.metadata.name);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn stop(&mut self) -> PluginResult<()> {
        self.hooks.record("stop", &self.metadata.name);
        Ok(())
    }

    async fn uninstall(&mut self) -> PluginResult<()> {
        self.hooks.record("uninstall", &self.metadata.name);
        Ok(())
    }

    fn on_state_change(&mut self, state: PluginState) {
        self.state = state;
    }
}

/// Factories named after each id, all reporting to `hooks`
pub fn factories(ids: &[&str], hooks: &Arc<HookLog>) -> Arc<FactoryRegistry> {
    let registry = FactoryRegistry::new();
    for id in ids {
        let name = (*id).to_string();
        let hooks = Arc::clone(hooks);
        registry.register(*id, move || {
            Box::new(TestPlugin {
                metadata: PluginMetadata::new(name.clone(), "1.0.0"),
                state: PluginState::Registered,
                hooks: Arc::clone(&hooks),
                start_delay: None,
            }) as Box<dyn Plugin>
        });
    }
    Arc::new(registry)
}

pub fn manifest(id: &str, deps: &[&str]) -> PluginManifest {
    let mut manifest = PluginManifest::new(id, "1.0.0");
    manifest.config.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
    manifest.config.auto_start = true;
    manifest
}

pub fn location(id: &str) -> String {
    format!("mem://{id}")
}

/// Memory source holding `plugins` as `(id, dependencies)` pairs
pub fn memory_source(plugins: &[(&str, &[&str])], hooks: &Arc<HookLog>) -> Arc<MemorySource> {
    let ids: Vec<&str> = plugins.iter().map(|(id, _)| *id).collect();
    let source = MemorySource::new(factories(&ids, hooks));
    for (id, deps) in plugins {
        source.insert(location(id), manifest(id, deps));
    }
    Arc::new(source)
}

/// Loader configuration for tests: in-process sandboxes, no watching
pub fn test_config() -> LoaderConfig {
    LoaderConfig {
        temp_dir: std::env::temp_dir().join("plugin-runtime-tests"),
        load_timeout: Duration::from_secs(5),
        isolation_level: IsolationLevel::Vm,
        default_permissions: vec!["kv.read".to_string()],
        watch_patterns: vec!["mem://*".to_string()],
        watch_interval: Duration::from_millis(50),
        ..LoaderConfig::default()
    }
}

pub fn drain(rx: &mut UnboundedReceiver<PluginEvent>) -> Vec<PluginEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
