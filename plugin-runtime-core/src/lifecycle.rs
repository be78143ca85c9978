//! Plugin lifecycle management
//!
//! [`LifecycleManager`] owns the descriptor registry and the dependency
//! resolver and is the only place plugin state changes. Each plugin moves
//! through:
//!
//! ```text
//! REGISTERED -> INITIALIZED -> ACTIVE <-> INACTIVE
//!      \______________\___________\__________\____-> ERROR
//! ```
//!
//! `ERROR` can be re-initialized. Every transition updates `last_updated`,
//! notifies the plugin through `on_state_change` and emits a `state` event.
//!
//! The loader keeps hook execution outside its registry lock with the
//! detached transitions ([`LifecycleManager::initialize_detached`],
//! [`LifecycleManager::start_detached`]) and then hands the descriptor over
//! with [`LifecycleManager::admit`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::api::PluginConfig;
use crate::descriptor::PluginDescriptor;
use crate::error::{panic_message, PluginResult, PluginRuntimeError};
use crate::events::{EventDispatcher, EventKind};
use crate::registry::PluginRegistry;
use crate::resolver::DependencyResolver;
use crate::sandbox::Sandbox;

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    /// Known to the runtime, no instance yet
    Registered,
    /// Instance created and initialized
    Initialized,
    /// Running
    Active,
    /// Stopped; can be started again
    Inactive,
    /// Unrecoverable failure; instance dropped
    Error,
}

impl PluginState {
    /// States in which the descriptor holds an instance
    pub fn has_instance(self) -> bool {
        matches!(self, Self::Initialized | Self::Active | Self::Inactive)
    }

    /// States a dependency must be in before its dependents initialize
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Initialized | Self::Active)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Registered => "REGISTERED",
            Self::Initialized => "INITIALIZED",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A descriptor [`LifecycleManager::admit`] refused, handed back for cleanup
#[derive(Debug)]
pub struct Rejected {
    pub error: PluginRuntimeError,
    pub descriptor: Box<PluginDescriptor>,
}

/// Plugin lifecycle manager
#[derive(Debug)]
pub struct LifecycleManager {
    registry: PluginRegistry,
    resolver: DependencyResolver,
    events: Arc<EventDispatcher>,
    allow_missing: bool,
}

impl LifecycleManager {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            registry: PluginRegistry::new(),
            resolver: DependencyResolver::new(),
            events,
            allow_missing: false,
        }
    }

    /// Let plugins initialize while required dependencies are unregistered
    #[must_use]
    pub fn with_allow_missing(mut self, allow_missing: bool) -> Self {
        self.allow_missing = allow_missing;
        self
    }

    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.registry.get(id)
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.registry.get(id).map(PluginDescriptor::state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.registry.iter()
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Sandbox attached to a registered plugin
    pub fn sandbox(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.registry.get(id).and_then(|d| d.sandbox().cloned())
    }

    fn descriptor(&self, id: &str) -> PluginResult<&PluginDescriptor> {
        self.registry
            .get(id)
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(id.to_string()))
    }

    fn descriptor_mut(&mut self, id: &str) -> PluginResult<&mut PluginDescriptor> {
        self.registry
            .get_mut(id)
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(id.to_string()))
    }

    /// Register a plugin in `REGISTERED` state.
    ///
    /// Dependencies are not checked here; a plugin may be registered before
    /// the plugins it depends on.
    ///
    /// # Errors
    ///
    /// `DescriptorInvalid` or `AlreadyRegistered`.
    pub fn register(&mut self, mut descriptor: PluginDescriptor) -> PluginResult<()> {
        descriptor.validate()?;
        if self.registry.contains(descriptor.id()) {
            return Err(PluginRuntimeError::AlreadyRegistered(descriptor.id().to_string()));
        }
        descriptor.instance = None;
        descriptor.state = PluginState::Registered;
        descriptor.error = None;
        descriptor.touch();
        self.insert(descriptor)
            .map_err(|rejected| PluginRuntimeError::AlreadyRegistered(rejected.id().to_string()))
    }

    #[allow(clippy::result_large_err)]
    fn insert(&mut self, descriptor: PluginDescriptor) -> Result<(), PluginDescriptor> {
        let id = descriptor.id().to_string();
        let state = descriptor.state;
        let dependencies = descriptor.declared_dependencies();

        if self.registry.contains(&id) {
            return Err(descriptor);
        }
        self.resolver.add_plugin(&descriptor);
        self.registry.insert(descriptor)?;
        self.sync_edges();

        self.events.emit(
            EventKind::Register,
            &id,
            json!({ "state": state, "dependencies": dependencies }),
        );
        info!(plugin_id = %id, %state, "plugin registered");
        Ok(())
    }

    /// Mirror resolver adjacency onto every descriptor
    fn sync_edges(&mut self) {
        for descriptor in self.registry.iter_mut() {
            descriptor.dependencies = self.resolver.get_dependencies(descriptor.id());
            descriptor.dependents = self.resolver.get_dependents(descriptor.id());
        }
    }

    /// Graph validation plus readiness of registered dependencies
    fn check_dependencies(&self, descriptor: &PluginDescriptor, resolved: PluginResult<()>) -> PluginResult<()> {
        resolved?;
        for dependency in descriptor.declared_dependencies() {
            if let Some(found) = self.registry.get(&dependency) {
                if !found.state.is_ready() {
                    return Err(PluginRuntimeError::InvalidState(format!(
                        "dependency '{dependency}' of plugin '{}' is {}",
                        descriptor.id(),
                        found.state
                    )));
                }
            }
        }
        Ok(())
    }

    /// Initialize a registered plugin with its descriptor configuration.
    ///
    /// # Errors
    ///
    /// See [`LifecycleManager::initialize_with`].
    pub async fn initialize(&mut self, id: &str) -> PluginResult<()> {
        let config = self.descriptor(id)?.plugin_config();
        self.initialize_with(id, config).await
    }

    /// Validate dependencies, build the instance and run its `initialize`
    /// hook.
    ///
    /// # Errors
    ///
    /// Dependency and state errors leave the plugin untouched. A failing
    /// hook moves it to `ERROR` and is returned as `HookFailed` or a
    /// sandbox failure.
    pub async fn initialize_with(&mut self, id: &str, config: PluginConfig) -> PluginResult<()> {
        let descriptor = self.descriptor(id)?;
        ensure_state(descriptor, "initialize", &[PluginState::Registered, PluginState::Error])?;
        let resolved = self.resolver.validate_dependencies_with(id, self.allow_missing);
        if let Err(error) = self.check_dependencies(descriptor, resolved) {
            warn!(plugin_id = %id, error = %error, "dependency check failed");
            return Err(error);
        }

        let events = Arc::clone(&self.events);
        let descriptor = self.descriptor_mut(id)?;
        run_initialize(descriptor, config, &events).await
    }

    /// # Errors
    ///
    /// `InvalidState` unless `INITIALIZED` or `INACTIVE`; hook failures move
    /// the plugin to `ERROR`.
    pub async fn start(&mut self, id: &str) -> PluginResult<()> {
        let events = Arc::clone(&self.events);
        let descriptor = self.descriptor_mut(id)?;
        ensure_state(descriptor, "start", &[PluginState::Initialized, PluginState::Inactive])?;
        run_start(descriptor, &events).await
    }

    /// # Errors
    ///
    /// `HasDependents` while an active plugin depends on this one,
    /// `InvalidState` unless `ACTIVE`; hook failures move the plugin to
    /// `ERROR`.
    pub async fn stop(&mut self, id: &str) -> PluginResult<()> {
        ensure_state(self.descriptor(id)?, "stop", &[PluginState::Active])?;
        let active: Vec<String> = self
            .resolver
            .get_dependents(id)
            .into_iter()
            .filter(|dependent| self.state(dependent) == Some(PluginState::Active))
            .collect();
        if !active.is_empty() {
            return Err(PluginRuntimeError::HasDependents {
                plugin_id: id.to_string(),
                dependents: active,
            });
        }

        let events = Arc::clone(&self.events);
        let descriptor = self.descriptor_mut(id)?;
        run_stop(descriptor, &events).await
    }

    /// Remove a plugin and hand its descriptor back.
    ///
    /// An active plugin is stopped first, then its `uninstall` hook runs.
    /// Hook failures are reported as `error` events and do not block
    /// removal. The caller owns the returned sandbox.
    ///
    /// # Errors
    ///
    /// `HasDependents` when other plugins depend on it and `force` is false.
    pub async fn unload(&mut self, id: &str, force: bool) -> PluginResult<PluginDescriptor> {
        self.descriptor(id)?;
        let dependents: Vec<String> = self.resolver.get_dependents(id).into_iter().collect();
        if !force && !dependents.is_empty() {
            return Err(PluginRuntimeError::HasDependents {
                plugin_id: id.to_string(),
                dependents,
            });
        }

        let events = Arc::clone(&self.events);
        let descriptor = self.descriptor_mut(id)?;
        let previous = descriptor.state;
        if previous == PluginState::Active {
            if let Err(error) = run_stop(descriptor, &events).await {
                warn!(plugin_id = %id, error = %error, "stop before unload failed");
            }
        }
        Self::uninstall_detached(descriptor, &events).await;

        self.resolver.remove_plugin(id);
        let mut descriptor = self.registry.remove(id).ok_or_else(|| PluginRuntimeError::PluginNotFound(id.to_string()))?;
        descriptor.instance = None;
        descriptor.dependencies.clear();
        descriptor.dependents.clear();
        self.sync_edges();

        events.emit(
            EventKind::Unload,
            id,
            json!({ "previous_state": previous, "forced": force, "dependents": dependents }),
        );
        info!(plugin_id = %id, %previous, force, "plugin unloaded");
        Ok(descriptor)
    }

    /// Replace a plugin's settings and notify it
    ///
    /// # Errors
    ///
    /// `PluginNotFound`.
    pub fn update_config(&mut self, id: &str, settings: Map<String, Value>) -> PluginResult<()> {
        let events = Arc::clone(&self.events);
        let descriptor = self.descriptor_mut(id)?;
        descriptor.config.settings = settings;
        let config = descriptor.plugin_config();
        if let Some(instance) = descriptor.instance.as_mut() {
            instance.on_config_change(&config);
        }
        descriptor.touch();

        let keys: Vec<&String> = config.settings.keys().collect();
        events.emit(EventKind::Config, id, json!({ "settings": keys }));
        debug!(plugin_id = %id, "plugin configuration updated");
        Ok(())
    }

    /// Check that `descriptor` could be admitted right now.
    ///
    /// Registered dependencies must be ready even when `resolve` is false;
    /// `resolve` adds the full graph validation.
    ///
    /// # Errors
    ///
    /// `DescriptorInvalid`, `AlreadyRegistered`, dependency errors or
    /// `InvalidState` for a dependency that is not ready.
    pub fn check_candidate(&self, descriptor: &PluginDescriptor, resolve: bool) -> PluginResult<()> {
        descriptor.validate()?;
        if self.registry.contains(descriptor.id()) {
            return Err(PluginRuntimeError::AlreadyRegistered(descriptor.id().to_string()));
        }
        let resolved = if resolve {
            self.resolver.validate_candidate(descriptor, self.allow_missing)
        } else {
            Ok(())
        };
        self.check_dependencies(descriptor, resolved)
    }

    /// Initialize a descriptor that is not registered yet.
    ///
    /// # Errors
    ///
    /// As [`LifecycleManager::initialize_with`], minus dependency checks,
    /// which belong to [`LifecycleManager::check_candidate`].
    pub async fn initialize_detached(descriptor: &mut PluginDescriptor, events: &EventDispatcher) -> PluginResult<()> {
        ensure_state(descriptor, "initialize", &[PluginState::Registered, PluginState::Error])?;
        let config = descriptor.plugin_config();
        run_initialize(descriptor, config, events).await
    }

    /// Start a descriptor that is not registered yet.
    ///
    /// # Errors
    ///
    /// As [`LifecycleManager::start`].
    pub async fn start_detached(descriptor: &mut PluginDescriptor, events: &EventDispatcher) -> PluginResult<()> {
        ensure_state(descriptor, "start", &[PluginState::Initialized, PluginState::Inactive])?;
        run_start(descriptor, events).await
    }

    /// Run the `uninstall` hook if an instance exists, then drop it.
    /// Failures are logged and emitted, never returned.
    pub async fn uninstall_detached(descriptor: &mut PluginDescriptor, events: &EventDispatcher) {
        let id = descriptor.id().to_string();
        let sandbox = descriptor.sandbox.clone();
        let Some(instance) = descriptor.instance.as_mut() else {
            return;
        };

        let result = guarded(sandbox.as_deref(), &id, "uninstall", instance.uninstall()).await;
        if let Err(error) = result {
            let error = hook_error(&id, "uninstall", error);
            instance.on_error(&error);
            warn!(plugin_id = %id, error = %error, "uninstall hook failed");
            events.emit(
                EventKind::Error,
                &id,
                json!({ "hook": "uninstall", "category": error.category(), "message": error.to_string() }),
            );
        }
        descriptor.instance = None;
    }

    /// Register a descriptor whose instance was prepared outside the
    /// registry, keeping its current state.
    ///
    /// Runs the same checks as [`LifecycleManager::check_candidate`] again,
    /// since the registry may have changed while the instance was prepared.
    ///
    /// # Errors
    ///
    /// The descriptor is handed back when its id is taken, a dependency was
    /// unloaded or stopped being ready, or (with `resolve`) admitting it
    /// would close a cycle.
    pub fn admit(&mut self, descriptor: PluginDescriptor, resolve: bool) -> Result<(), Box<Rejected>> {
        if let Err(error) = self.check_candidate(&descriptor, resolve) {
            return Err(Box::new(Rejected {
                error,
                descriptor: Box::new(descriptor),
            }));
        }
        self.insert(descriptor).map_err(|descriptor| {
            Box::new(Rejected {
                error: PluginRuntimeError::AlreadyRegistered(descriptor.id().to_string()),
                descriptor: Box::new(descriptor),
            })
        })
    }
}

fn ensure_state(descriptor: &PluginDescriptor, operation: &str, allowed: &[PluginState]) -> PluginResult<()> {
    if allowed.contains(&descriptor.state) {
        Ok(())
    } else {
        Err(PluginRuntimeError::InvalidState(format!(
            "cannot {operation} plugin '{}' in state {}",
            descriptor.id(),
            descriptor.state
        )))
    }
}

/// Run a hook through the plugin's sandbox when it has one, otherwise
/// directly with panics caught.
async fn guarded<T, F>(sandbox: Option<&Sandbox>, plugin_id: &str, hook: &str, future: F) -> PluginResult<T>
where
    F: Future<Output = PluginResult<T>>,
{
    match sandbox {
        Some(sandbox) => sandbox.run_hook(hook, future).await,
        None => match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(PluginRuntimeError::hook_failed(plugin_id, hook, panic_message(&*panic))),
        },
    }
}

/// Errors the plugin returned itself are reported as hook failures
fn hook_error(plugin_id: &str, hook: &str, error: PluginRuntimeError) -> PluginRuntimeError {
    match error {
        PluginRuntimeError::HookFailed { .. } | PluginRuntimeError::SandboxExecutionFailure { .. } => error,
        other => PluginRuntimeError::hook_failed(plugin_id, hook, other.to_string()),
    }
}

fn transition(descriptor: &mut PluginDescriptor, to: PluginState, events: &EventDispatcher) {
    let from = descriptor.state;
    descriptor.state = to;
    descriptor.touch();
    if let Some(instance) = descriptor.instance.as_mut() {
        instance.on_state_change(to);
    }
    events.emit(EventKind::State, descriptor.id(), json!({ "from": from, "to": to }));
    debug!(plugin_id = %descriptor.id(), %from, %to, "plugin state changed");
}

/// Move to `ERROR`, dropping the instance after notifying it
fn fail(descriptor: &mut PluginDescriptor, hook: &str, error: &PluginRuntimeError, events: &EventDispatcher) {
    if let Some(mut instance) = descriptor.instance.take() {
        instance.on_error(error);
    }
    descriptor.error = Some(error.to_string());
    transition(descriptor, PluginState::Error, events);
    events.emit(
        EventKind::Error,
        descriptor.id(),
        json!({ "hook": hook, "category": error.category(), "message": error.to_string() }),
    );
    warn!(plugin_id = %descriptor.id(), hook, error = %error, "plugin failed");
}

async fn run_initialize(
    descriptor: &mut PluginDescriptor,
    config: PluginConfig,
    events: &EventDispatcher,
) -> PluginResult<()> {
    let id = descriptor.id().to_string();
    let sandbox = descriptor.sandbox.clone();
    let mut instance = descriptor.new_instance();

    let result = guarded(sandbox.as_deref(), &id, "initialize", instance.initialize(&config)).await;
    match result {
        Ok(()) => {
            descriptor.instance = Some(instance);
            descriptor.error = None;
            transition(descriptor, PluginState::Initialized, events);
            events.emit(EventKind::Initialize, &id, json!({ "settings": config.settings.len() }));
            info!(plugin_id = %id, "plugin initialized");
            Ok(())
        }
        Err(error) => {
            let error = hook_error(&id, "initialize", error);
            instance.on_error(&error);
            fail(descriptor, "initialize", &error, events);
            Err(error)
        }
    }
}

async fn run_start(descriptor: &mut PluginDescriptor, events: &EventDispatcher) -> PluginResult<()> {
    let id = descriptor.id().to_string();
    let sandbox = descriptor.sandbox.clone();
    let Some(instance) = descriptor.instance.as_mut() else {
        return Err(PluginRuntimeError::InvalidState(format!("plugin '{id}' has no instance")));
    };

    match guarded(sandbox.as_deref(), &id, "start", instance.start()).await {
        Ok(()) => {
            transition(descriptor, PluginState::Active, events);
            events.emit(EventKind::Start, &id, Value::Null);
            info!(plugin_id = %id, "plugin started");
            Ok(())
        }
        Err(error) => {
            let error = hook_error(&id, "start", error);
            fail(descriptor, "start", &error, events);
            Err(error)
        }
    }
}

async fn run_stop(descriptor: &mut PluginDescriptor, events: &EventDispatcher) -> PluginResult<()> {
    let id = descriptor.id().to_string();
    let sandbox = descriptor.sandbox.clone();
    let Some(instance) = descriptor.instance.as_mut() else {
        return Err(PluginRuntimeError::InvalidState(format!("plugin '{id}' has no instance")));
    };

    match guarded(sandbox.as_deref(), &id, "stop", instance.stop()).await {
        Ok(()) => {
            transition(descriptor, PluginState::Inactive, events);
            events.emit(EventKind::Stop, &id, Value::Null);
            info!(plugin_id = %id, "plugin stopped");
            Ok(())
        }
        Err(error) => {
            let error = hook_error(&id, "stop", error);
            fail(descriptor, "stop", &error, events);
            Err(error)
        }
    }
}
