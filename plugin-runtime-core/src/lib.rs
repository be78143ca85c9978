//! Plugin runtime core
//!
//! Loads, wires and supervises plugins inside a host process:
//! - Dependency resolution with cycle detection, version checks and
//!   topological load/unload ordering
//! - Lifecycle management (register, initialize, start, stop, unload)
//!   with failure containment for plugin hooks
//! - Sandboxed execution of WebAssembly code, in-process or in a
//!   `sandbox-worker` child process, under a per-plugin policy
//! - A loader that fetches descriptors from a [`PluginSource`], loads them
//!   in dependency waves, caches results and reloads changed sources
//!
//! # Plugin States
//!
//! - **REGISTERED**: known to the registry, no instance yet
//! - **INITIALIZED**: instance created and `initialize` succeeded
//! - **ACTIVE**: started
//! - **INACTIVE**: stopped, can be started again
//! - **ERROR**: a hook failed; `initialize` may be retried
//!
//! # Security Model
//!
//! - Capability-based permissions granted per plugin
//! - Network and filesystem allow-lists checked by the sandbox
//! - Memory, CPU time and wall-clock limits on guest code
//! - Process isolation for untrusted plugins
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use plugin_runtime_core::{FactoryRegistry, Loader, LoaderConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factories = Arc::new(FactoryRegistry::new());
//!     // factories.register("audit-log", || Box::new(AuditLog::default()));
//!
//!     let loader = Arc::new(
//!         Loader::builder(LoaderConfig::load(None)?)
//!             .factories(factories)
//!             .build()?,
//!     );
//!
//!     for result in loader.start().await? {
//!         println!("{}: success={}", result.plugin_id, result.success);
//!     }
//!
//!     let stats = loader.get_stats().await;
//!     println!("{} plugins active", stats.active_plugins);
//!
//!     loader.stop().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod sandbox;
pub mod source;

pub use api::{
    LoadMetadata, LoadResult, Plugin, PluginConfig, PluginMetadata, ResultError, Timings, UnloadMetadata,
    UnloadResult,
};
pub use cache::{MemoryResultCache, ResultCache};
pub use config::LoaderConfig;
pub use descriptor::{DescriptorConfig, PluginDescriptor, PluginFactory};
pub use error::{
    BackoffStrategy, ErrorCategory, ExecutionFailure, PluginResult, PluginRuntimeError, RetryPolicy,
};
pub use events::{EventDispatcher, EventKind, EventObserver, PluginEvent, SubscriptionId};
pub use lifecycle::{LifecycleManager, PluginState, Rejected};
pub use loader::{Loader, LoaderBuilder, LoaderStats, PluginStats, PluginSummary};
pub use logging::{init_tracing, LogFormat};
pub use registry::PluginRegistry;
pub use resolver::{DependencyResolver, DependencyStats, ImpactAnalysis};
pub use sandbox::{
    GuestOutcome, IsolationLevel, Sandbox, SandboxCode, SandboxPolicy, SandboxSettings, SandboxStats,
    SandboxStatus,
};
pub use source::{DirectorySource, FactoryRegistry, MemorySource, PluginManifest, PluginSource};
