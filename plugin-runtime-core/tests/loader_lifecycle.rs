//! End-to-end loading, unloading and reloading through the loader

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{location, manifest, memory_source, test_config, HookLog};
use plugin_runtime_core::{
    ErrorCategory, EventKind, Loader, LoaderConfig, MemorySource, PluginDescriptor, PluginResult,
    PluginRuntimeError, PluginSource, PluginState, SandboxCode,
};
use serde_json::json;

fn loader(config: LoaderConfig, source: Arc<dyn PluginSource>) -> Arc<Loader> {
    Arc::new(Loader::new(config, source).expect("valid config"))
}

#[tokio::test]
async fn loads_in_dependency_waves() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(
        &[("c", &["b"]), ("b", &["a"]), ("a", &[]), ("solo", &[])],
        &hooks,
    );
    let loader = loader(test_config(), source);
    let mut events = loader.subscribe(Some(EventKind::Load));

    let results = loader.load_plugins().await.expect("discovery");
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success), "{results:?}");

    let initialized = hooks.calls_of("initialize");
    let position = |id: &str| initialized.iter().position(|x| x == id).expect("initialized");
    assert!(position("a") < position("b"));
    assert!(position("b") < position("c"));

    let loaded: Vec<String> = common::drain(&mut events).into_iter().map(|e| e.plugin_id).collect();
    assert_eq!(loaded.len(), 4);
    for id in ["a", "b", "c", "solo"] {
        assert_eq!(loader.get_plugin_state(id).await, Some(PluginState::Active));
    }

    let stats = loader.get_stats().await;
    assert_eq!(stats.total_plugins, 4);
    assert_eq!(stats.active_plugins, 4);
    assert_eq!(stats.dependencies.total_edges, 2);
    assert_eq!(stats.failed_loads, 0);
}

#[tokio::test]
async fn strict_unload_refuses_plugins_with_dependents() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[]), ("b", &["a"]), ("c", &["b"])], &hooks);
    let loader = loader(test_config(), source);
    loader.load_plugins().await.expect("discovery");

    let refused = loader.unload_plugin("b").await;
    assert!(!refused.success);
    assert_eq!(refused.error_category(), Some(ErrorCategory::HasDependents));
    assert_eq!(loader.get_plugin_state("b").await, Some(PluginState::Active));
    assert!(hooks.calls_of("uninstall").is_empty());

    for id in ["c", "b", "a"] {
        let result = loader.unload_plugin(id).await;
        assert!(result.success, "{id}: {:?}", result.error);
        assert_eq!(result.metadata.state, Some(PluginState::Active));
    }
    assert_eq!(hooks.calls_of("stop"), vec!["c", "b", "a"]);
    assert_eq!(hooks.calls_of("uninstall"), vec!["c", "b", "a"]);
    assert!(loader.list_plugins().await.is_empty());
}

#[tokio::test]
async fn relaxed_unload_prunes_edges() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[]), ("b", &["a"])], &hooks);
    let config = LoaderConfig {
        strict_dependencies: false,
        ..test_config()
    };
    let loader = loader(config, source);
    loader.load_plugins().await.expect("discovery");

    let result = loader.unload_plugin("a").await;
    assert!(result.success);
    assert_eq!(result.metadata.dependents, vec!["b"]);

    let remaining = loader.list_plugins().await;
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].dependencies.is_empty());
}

#[tokio::test]
async fn second_load_is_served_from_cache() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[])], &hooks);
    let loader = loader(test_config(), source);

    let first = loader.load_plugin(&location("a")).await;
    assert!(first.success);
    assert!(!first.cached);
    let before = loader.sandbox_stats("a").await.expect("sandboxed");

    let second = loader.load_plugin(&location("a")).await;
    assert!(second.success);
    assert!(second.cached);
    assert_eq!(second.plugin_id, first.plugin_id);

    let after = loader.sandbox_stats("a").await.expect("sandboxed");
    assert_eq!(after.sandbox_id, before.sandbox_id);
    assert_eq!(after.operations.total, before.operations.total);
    assert_eq!(hooks.calls_of("initialize"), vec!["a"]);
    assert_eq!(loader.get_stats().await.cache_hits, 1);
}

#[tokio::test]
async fn disabled_cache_reports_duplicate_load() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[])], &hooks);
    let config = LoaderConfig {
        cache_enabled: false,
        ..test_config()
    };
    let loader = loader(config, source);

    assert!(loader.load_plugin(&location("a")).await.success);
    let again = loader.load_plugin(&location("a")).await;
    assert!(!again.success);
    assert_eq!(again.error_category(), Some(ErrorCategory::AlreadyRegistered));
    assert_eq!(hooks.calls_of("initialize"), vec!["a"]);
    assert!(hooks.calls_of("uninstall").is_empty());
    assert_eq!(loader.get_plugin_state("a").await, Some(PluginState::Active));
}

#[tokio::test]
async fn failures_stay_isolated_from_siblings() {
    let hooks = Arc::new(HookLog::default());
    hooks.fail_initialize("broken");
    let source = memory_source(
        &[("broken", &[]), ("needs-broken", &["broken"]), ("healthy", &[])],
        &hooks,
    );
    let loader = loader(test_config(), source);
    let mut errors = loader.subscribe(Some(EventKind::Error));

    let results = loader.load_plugins().await.expect("discovery");
    let outcome = |id: &str| results.iter().find(|r| r.plugin_id == id).expect("reported");

    assert_eq!(outcome("broken").error_category(), Some(ErrorCategory::Hook));
    assert_eq!(
        outcome("needs-broken").error_category(),
        Some(ErrorCategory::MissingDependency)
    );
    assert!(outcome("healthy").success);

    let ids: Vec<String> = loader.list_plugins().await.into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["healthy"]);
    let reported = common::drain(&mut errors);
    assert_eq!(reported.iter().filter(|e| e.plugin_id == "broken").count(), 1);
    assert_eq!(reported.iter().filter(|e| e.plugin_id == "needs-broken").count(), 1);
    assert_eq!(loader.get_stats().await.failed_loads, 2);
}

#[tokio::test]
async fn slow_initialize_times_out() {
    let hooks = Arc::new(HookLog::default());
    let source = MemorySource::new(common::factories(&["slow"], &hooks));
    let mut slow = manifest("slow", &[]);
    slow.config.settings.insert("delay_ms".into(), json!(2_000));
    source.insert(location("slow"), slow);

    let config = LoaderConfig {
        load_timeout: Duration::from_millis(100),
        sandbox_enabled: false,
        ..test_config()
    };
    let loader = loader(config, Arc::new(source));

    let result = loader.load_plugin(&location("slow")).await;
    assert!(!result.success);
    assert_eq!(result.error_category(), Some(ErrorCategory::Timeout));
    assert!(loader.get_plugin_state("slow").await.is_none());
}

#[tokio::test]
async fn timeout_during_start_uninstalls_the_instance() {
    let hooks = Arc::new(HookLog::default());
    let source = MemorySource::new(common::factories(&["sluggish"], &hooks));
    let mut sluggish = manifest("sluggish", &[]);
    sluggish.config.settings.insert("start_delay_ms".into(), json!(2_000));
    source.insert(location("sluggish"), sluggish);

    let config = LoaderConfig {
        load_timeout: Duration::from_millis(150),
        sandbox_enabled: false,
        ..test_config()
    };
    let loader = loader(config, Arc::new(source));
    let mut errors = loader.subscribe(Some(EventKind::Error));

    let result = loader.load_plugin(&location("sluggish")).await;
    assert_eq!(result.error_category(), Some(ErrorCategory::Timeout));
    assert_eq!(hooks.calls_of("start"), vec!["sluggish"]);
    assert_eq!(hooks.calls_of("uninstall"), vec!["sluggish"]);
    assert!(loader.get_plugin_state("sluggish").await.is_none());
    assert_eq!(common::drain(&mut errors).len(), 1);
}

#[tokio::test]
async fn dependency_unloaded_mid_load_blocks_admission() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[]), ("b", &["a"])], &hooks);
    let mut slow = manifest("b", &["a"]);
    slow.config.settings.insert("delay_ms".into(), json!(400));
    source.insert(location("b"), slow);
    let loader = loader(test_config(), Arc::clone(&source) as Arc<dyn PluginSource>);
    assert!(loader.load_plugin(&location("a")).await.success);

    let loading = tokio::spawn({
        let loader = Arc::clone(&loader);
        async move { loader.load_plugin(&location("b")).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let unloaded = loader.unload_plugin("a").await;
    assert!(unloaded.success, "{:?}", unloaded.error);

    let loaded = loading.await.expect("load task");
    assert!(!loaded.success);
    assert_eq!(loaded.error_category(), Some(ErrorCategory::MissingDependency));
    assert!(loader.get_plugin_state("a").await.is_none());
    assert!(loader.get_plugin_state("b").await.is_none());
    assert_eq!(hooks.calls_of("uninstall"), vec!["a", "b"]);
}

#[tokio::test]
async fn batch_respects_max_concurrent_loads() {
    let hooks = Arc::new(HookLog::default());
    let ids = ["p1", "p2", "p3", "p4", "p5", "p6"];
    let source = MemorySource::new(common::factories(&ids, &hooks));
    for id in ids {
        let mut plugin = manifest(id, &[]);
        plugin.config.settings.insert("delay_ms".into(), json!(100));
        source.insert(location(id), plugin);
    }
    let config = LoaderConfig {
        max_concurrent_loads: 2,
        ..test_config()
    };
    let loader = loader(config, Arc::new(source));

    let results = loader.load_plugins().await.expect("discovery");
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.success), "{results:?}");
    assert_eq!(hooks.peak_initializing(), 2);
}

/// Fails the first `failures` loads with a source error
struct FlakySource {
    inner: Arc<MemorySource>,
    failures: u32,
    attempts: AtomicU32,
}

#[async_trait]
impl PluginSource for FlakySource {
    async fn discover(&self) -> PluginResult<Vec<String>> {
        self.inner.discover().await
    }

    async fn load(&self, location: &str) -> PluginResult<PluginDescriptor> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(PluginRuntimeError::source_failure(location, "connection reset"));
        }
        self.inner.load(location).await
    }
}

#[tokio::test]
async fn transient_source_failures_are_retried() {
    let hooks = Arc::new(HookLog::default());
    let flaky = Arc::new(FlakySource {
        inner: memory_source(&[("a", &[])], &hooks),
        failures: 2,
        attempts: AtomicU32::new(0),
    });
    let config = LoaderConfig {
        retry_attempts: 2,
        ..test_config()
    };
    let loader = loader(config, Arc::clone(&flaky) as Arc<dyn PluginSource>);

    let result = loader.load_plugin(&location("a")).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_report_source_error() {
    let hooks = Arc::new(HookLog::default());
    let flaky = Arc::new(FlakySource {
        inner: memory_source(&[("a", &[])], &hooks),
        failures: 10,
        attempts: AtomicU32::new(0),
    });
    let config = LoaderConfig {
        retry_attempts: 1,
        ..test_config()
    };
    let loader = loader(config, Arc::clone(&flaky) as Arc<dyn PluginSource>);

    let result = loader.load_plugin(&location("a")).await;
    assert_eq!(result.error_category(), Some(ErrorCategory::Source));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reload_picks_up_new_manifest() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[])], &hooks);
    let loader = loader(test_config(), Arc::clone(&source) as Arc<dyn PluginSource>);
    assert!(loader.load_plugin(&location("a")).await.success);

    let mut updated = manifest("a", &[]);
    updated.version = "1.1.0".to_string();
    source.insert(location("a"), updated);

    let reloaded = loader.reload_plugin("a").await;
    assert!(reloaded.success);
    assert!(!reloaded.cached);
    let plugins = loader.list_plugins().await;
    assert_eq!(plugins[0].version, "1.1.0");
    assert_eq!(hooks.calls_of("initialize"), vec!["a", "a"]);

    let missing = loader.reload_plugin("ghost").await;
    assert_eq!(missing.error_category(), Some(ErrorCategory::NotFound));
}

#[tokio::test]
async fn poll_changes_reloads_modified_sources_only() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[]), ("b", &[])], &hooks);
    let loader = loader(test_config(), Arc::clone(&source) as Arc<dyn PluginSource>);
    loader.load_plugins().await.expect("discovery");

    assert!(loader.poll_changes().await.is_empty());

    source.insert(location("b"), manifest("b", &[]));
    let reloaded = loader.poll_changes().await;
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].plugin_id, "b");
    assert!(reloaded[0].success);

    assert!(loader.poll_changes().await.is_empty());
    assert_eq!(hooks.calls_of("initialize").iter().filter(|id| *id == "b").count(), 2);
}

#[tokio::test]
async fn failed_reload_waits_for_the_next_change() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[]), ("b", &["a"])], &hooks);
    let loader = loader(test_config(), Arc::clone(&source) as Arc<dyn PluginSource>);
    loader.load_plugins().await.expect("discovery");

    let mut updated = manifest("a", &[]);
    updated.version = "1.1.0".to_string();
    source.insert(location("a"), updated);

    let refused = loader.poll_changes().await;
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].error_category(), Some(ErrorCategory::HasDependents));
    assert!(loader.poll_changes().await.is_empty());
    assert_eq!(loader.get_plugin_state("a").await, Some(PluginState::Active));
    assert_eq!(hooks.calls_of("initialize").iter().filter(|id| *id == "a").count(), 1);
}

#[tokio::test]
async fn watch_loop_reloads_in_background() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("a", &[])], &hooks);
    let config = LoaderConfig {
        watch_enabled: true,
        ..test_config()
    };
    let loader = loader(config, Arc::clone(&source) as Arc<dyn PluginSource>);
    loader.start().await.expect("started");
    assert!(loader.is_watching());

    let mut updated = manifest("a", &[]);
    updated.version = "2.0.0".to_string();
    source.insert(location("a"), updated);

    let mut version = String::new();
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(plugin) = loader.list_plugins().await.into_iter().next() {
            version = plugin.version;
            if version == "2.0.0" {
                break;
            }
        }
    }
    assert_eq!(version, "2.0.0");

    let unloaded = loader.stop().await;
    assert!(!loader.is_watching());
    assert_eq!(unloaded.len(), 1);
}

#[tokio::test]
async fn stop_unloads_dependents_first() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("base", &[]), ("mid", &["base"]), ("top", &["mid"])], &hooks);
    let loader = loader(test_config(), source);
    let results = loader.start().await.expect("started");
    assert_eq!(results.len(), 3);

    let unloaded = loader.stop().await;
    assert!(unloaded.iter().all(|r| r.success));
    assert_eq!(hooks.calls_of("uninstall"), vec!["top", "mid", "base"]);
}

#[tokio::test]
async fn executes_code_in_plugin_sandbox() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("calc", &[])], &hooks);
    let loader = loader(test_config(), source);
    assert!(loader.load_plugin(&location("calc")).await.success);

    let code = SandboxCode::wat(r#"(module (func (export "run") (result i32) (i32.const 42)))"#);
    let outcome = loader.execute("calc", &code, json!({})).await.expect("runs");
    assert_eq!(outcome.value, json!(42));

    loader.require_permission("calc", "kv.read").await.expect("granted by default");
    assert!(matches!(
        loader.require_permission("calc", "kv.write").await,
        Err(PluginRuntimeError::PermissionDenied { .. })
    ));
    assert!(matches!(
        loader.execute("ghost", &code, json!({})).await,
        Err(PluginRuntimeError::PluginNotFound(_))
    ));
}

#[tokio::test]
async fn unsandboxed_plugins_cannot_execute() {
    let hooks = Arc::new(HookLog::default());
    let source = memory_source(&[("bare", &[])], &hooks);
    let config = LoaderConfig {
        sandbox_enabled: false,
        ..test_config()
    };
    let loader = loader(config, source);
    assert!(loader.load_plugin(&location("bare")).await.success);

    let code = SandboxCode::wat(r#"(module (func (export "run") (result i32) (i32.const 1)))"#);
    assert!(matches!(
        loader.execute("bare", &code, json!(null)).await,
        Err(PluginRuntimeError::InvalidState(_))
    ));
}

#[tokio::test]
async fn loads_manifests_from_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("store.json"),
        r#"{"id": "store", "version": "1.2.0", "config": {"auto_start": true}}"#,
    )
    .expect("write");
    std::fs::create_dir(dir.path().join("nested")).expect("mkdir");
    std::fs::write(
        dir.path().join("nested").join("reports.yaml"),
        "id: reports\nversion: 0.3.0\ndependency_versions:\n  store: \"^1.0\"\n",
    )
    .expect("write");
    std::fs::write(dir.path().join("README.md"), "not a manifest").expect("write");

    let hooks = Arc::new(HookLog::default());
    let config = LoaderConfig {
        plugins_dir: dir.path().to_path_buf(),
        watch_patterns: vec!["*.json".into(), "*.yaml".into()],
        ..test_config()
    };
    let loader = Loader::builder(config)
        .factories(common::factories(&["store", "reports"], &hooks))
        .build()
        .expect("valid config");

    let results = loader.load_plugins().await.expect("discovery");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success), "{results:?}");
    assert_eq!(hooks.calls_of("initialize"), vec!["store", "reports"]);
    assert_eq!(loader.get_plugin_state("store").await, Some(PluginState::Active));
    assert_eq!(loader.get_plugin_state("reports").await, Some(PluginState::Initialized));
}
