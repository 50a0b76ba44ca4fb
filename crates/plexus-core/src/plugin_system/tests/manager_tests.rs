#![cfg(test)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::common::{manager_with, matching, new_log, plugin, position, register_mock, CallLog, MockSpec};
use crate::config::ManagerConfig;
use crate::kernel::component::KernelComponent;
use crate::plugin_system::dependency::{PackageDependency, PackagePolicy, StaticPackageProbe};
use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::instance::LifecycleState;
use crate::plugin_system::manager::{DefaultPluginManager, PluginManager, UnloadPolicy};
use crate::plugin_system::traits::{Plugin, PluginError, UnitContext};
use crate::plugin_system::report::ConditionKind;

fn net_pair() -> Vec<PluginDescriptor> {
    vec![
        plugin("net.x", "1.2.0"),
        plugin("net.y", "1.0.0").requires_plugin("net.x", "1.x.x").unwrap(),
    ]
}

fn configured(config: ManagerConfig, descriptors: Vec<PluginDescriptor>, log: &CallLog) -> DefaultPluginManager {
    let manager = DefaultPluginManager::with_config(config).unwrap();
    for descriptor in &descriptors {
        register_mock(&manager, descriptor.id(), MockSpec::new(log));
    }
    manager.add_descriptors(descriptors).unwrap();
    manager
}

#[tokio::test]
async fn test_unload_refuses_while_in_use() {
    let log = new_log();
    let manager = manager_with(net_pair(), &log);
    manager.start_all().await.unwrap();

    let err = manager.unload("net.x", UnloadPolicy::Refuse).await.unwrap_err();
    assert!(matches!(
        err,
        PluginSystemError::PluginInUse { ref plugin_id, ref dependents } if plugin_id == "net.x" && dependents == &["net.y"]
    ));
    assert_eq!(manager.state("net.x"), Some(LifecycleState::Active));
    assert_eq!(manager.state("net.y"), Some(LifecycleState::Active));
    assert!(matching(&log, "teardown").is_empty());
    assert!(manager.report().has_condition("net.x", ConditionKind::PluginInUse));
}

#[tokio::test]
async fn test_cascade_unloads_dependents_first() {
    let log = new_log();
    let manager = manager_with(
        vec![
            plugin("net.x", "1.2.0"),
            plugin("net.y", "1.0.0").requires_plugin("net.x", "1.x.x").unwrap(),
            plugin("net.z", "1.0.0").requires_plugin("net.y", "*").unwrap(),
        ],
        &log,
    );
    manager.start_all().await.unwrap();

    manager.unload("net.x", UnloadPolicy::Cascade).await.unwrap();
    assert!(position(&log, "net.z:teardown") < position(&log, "net.y:teardown"));
    assert!(position(&log, "net.y:teardown") < position(&log, "net.x:teardown"));
    for id in ["net.x", "net.y", "net.z"] {
        assert_eq!(manager.state(id), Some(LifecycleState::Unloaded));
    }
}

#[tokio::test]
async fn test_unload_of_inactive_plugin() {
    let log = new_log();
    let manager = manager_with(net_pair(), &log);
    let err = manager.unload("net.x", UnloadPolicy::Refuse).await.unwrap_err();
    assert!(matches!(err, PluginSystemError::NotActive { .. }));
    assert!(manager.report().conditions.is_empty());
}

#[tokio::test]
async fn test_reload_is_one_removed_added_pair() {
    let log = new_log();
    let manager = manager_with(
        vec![
            plugin("cache", "1.0.0").provides("cache"),
            plugin("web", "1.0.0").consumes("cache"),
        ],
        &log,
    );
    manager.start_all().await.unwrap();
    let before = manager.instance("cache").unwrap();

    let after = manager.reload("cache", UnloadPolicy::Refuse).await.unwrap();
    assert!(!after.ptr_eq(&before));
    assert_eq!(before.state(), LifecycleState::Unloaded);
    assert_eq!(after.state(), LifecycleState::Active);
    assert_eq!(
        matching(&log, "web:changed"),
        [
            "web:changed:cache:added:cache:ACTIVE",
            "web:changed:cache:removed:cache:UNLOADING",
            "web:changed:cache:added:cache:LOADED"
        ]
    );
    let current = manager.instance("web").unwrap().providers("cache");
    assert!(current.len() == 1 && current[0].ptr_eq(&after));
}

#[tokio::test]
async fn test_reload_picks_up_newer_version() {
    let log = new_log();
    let manager = manager_with(vec![plugin("cache", "1.0.0")], &log);
    manager.start_all().await.unwrap();

    manager.add_descriptor(plugin("cache", "1.1.0")).unwrap();
    assert_eq!(manager.instance("cache").unwrap().version().to_string(), "1.0.0");
    assert_eq!(manager.status()[0].version, "1.0.0");

    let handle = manager.reload("cache", UnloadPolicy::Refuse).await.unwrap();
    assert_eq!(handle.version().to_string(), "1.1.0");
    assert_eq!(manager.status()[0].version, "1.1.0");
}

#[tokio::test]
async fn test_reload_of_inactive_plugin_loads_it() {
    let log = new_log();
    let manager = manager_with(vec![plugin("cache", "1.0.0")], &log);
    let handle = manager.reload("cache", UnloadPolicy::Refuse).await.unwrap();
    assert_eq!(handle.state(), LifecycleState::Active);
}

#[tokio::test]
async fn test_reload_refuses_while_in_use() {
    let log = new_log();
    let manager = manager_with(net_pair(), &log);
    manager.start_all().await.unwrap();

    let err = manager.reload("net.x", UnloadPolicy::Refuse).await.unwrap_err();
    assert!(matches!(err, PluginSystemError::PluginInUse { .. }));
    assert_eq!(manager.state("net.x"), Some(LifecycleState::Active));
}

#[tokio::test]
async fn test_cascade_reload_reactivates_dependents() {
    let log = new_log();
    let manager = manager_with(net_pair(), &log);
    manager.start_all().await.unwrap();
    let old_y = manager.instance("net.y").unwrap();

    let x = manager.reload("net.x", UnloadPolicy::Cascade).await.unwrap();
    let y = manager.instance("net.y").expect("dependent should be active again");
    assert!(!y.ptr_eq(&old_y));
    assert!(y.dependency("net.x").is_some_and(|dep| dep.ptr_eq(&x)));
    assert_eq!(matching(&log, "net.y:activated").len(), 2);
    assert!(position(&log, "net.y:teardown") < position(&log, "net.x:teardown"));
}

#[tokio::test]
async fn test_lookup_loads_lazy_providers_on_miss() {
    let log = new_log();
    let manager = manager_with(
        vec![
            plugin("cache.disk", "1.0.0").provides("cache").lazy(),
            plugin("cache.mem", "1.0.0").provides("cache").lazy(),
            plugin("web", "1.0.0"),
        ],
        &log,
    );
    let report = manager.start_all().await.unwrap();
    assert_eq!(report.ids_in_state(LifecycleState::Active), ["web"]);
    assert_eq!(manager.state("cache.mem"), Some(LifecycleState::Unloaded));
    assert!(manager.providers("cache").is_empty());

    let providers = manager.lookup("cache").await;
    let ids: Vec<&str> = providers.iter().map(|p| p.id()).collect();
    assert_eq!(ids, ["cache.disk", "cache.mem"]);
    assert!(providers.iter().all(|p| p.state() == LifecycleState::Active));

    // A hit does not load anything new
    assert_eq!(manager.lookup("cache").await.len(), 2);
    assert_eq!(matching(&log, "activated").len(), 3);
    assert!(manager.lookup("unknown").await.is_empty());
}

#[tokio::test]
async fn test_lookup_without_lazy_loading() {
    let log = new_log();
    let manager = configured(
        ManagerConfig::new().with_lazy_on_miss(false),
        vec![plugin("cache", "1.0.0").provides("cache").lazy()],
        &log,
    );
    assert!(manager.lookup("cache").await.is_empty());
    assert_eq!(manager.state("cache"), Some(LifecycleState::Unloaded));
}

#[tokio::test]
async fn test_hot_add_descriptors() {
    let log = new_log();
    let manager = manager_with(vec![plugin("net.x", "1.2.0")], &log);
    manager.start_all().await.unwrap();
    assert_eq!(manager.state("net.y"), None);

    register_mock(&manager, "net.y", MockSpec::new(&log));
    manager
        .add_descriptor(plugin("net.y", "1.0.0").requires_plugin("net.x", "1.x.x").unwrap())
        .unwrap();
    assert_eq!(manager.state("net.y"), Some(LifecycleState::Unloaded));
    assert_eq!(manager.graph().load_order(), ["net.x", "net.y"]);

    manager.load("net.y").await.unwrap();
    assert_eq!(manager.state("net.y"), Some(LifecycleState::Active));
    assert_eq!(matching(&log, "net.x:activated").len(), 1);
}

#[tokio::test]
async fn test_duplicate_batch_is_rejected_whole() {
    let log = new_log();
    let manager = manager_with(net_pair(), &log);

    let err = manager
        .add_descriptors(vec![plugin("net.z", "1.0.0"), plugin("net.x", "1.2.0")])
        .unwrap_err();
    assert!(matches!(err, PluginSystemError::DuplicateDescriptor { ref plugin_id, .. } if plugin_id == "net.x"));
    assert_eq!(manager.descriptors().len(), 2);
    assert!(!manager.graph().contains("net.z"));
}

#[tokio::test]
async fn test_shutdown_unloads_in_reverse_order() {
    let log = new_log();
    let manager = manager_with(net_pair(), &log);
    manager.start_all().await.unwrap();

    manager.shutdown().await.unwrap();
    assert!(manager.is_shutting_down());
    assert!(position(&log, "net.y:teardown") < position(&log, "net.x:teardown"));
    assert_eq!(manager.state("net.x"), Some(LifecycleState::Unloaded));
    assert_eq!(manager.state("net.y"), Some(LifecycleState::Unloaded));
    assert!(manager.capabilities().is_empty());

    assert!(matches!(manager.load("net.x").await, Err(PluginSystemError::ShuttingDown)));
    assert!(matches!(manager.start_all().await, Err(PluginSystemError::ShuttingDown)));
}

#[tokio::test]
async fn test_state_of_blocked_and_unknown_plugins() {
    let log = new_log();
    let manager = manager_with(
        vec![
            plugin("net.x", "2.0.0"),
            plugin("net.y", "1.0.0").requires_plugin("net.x", "1.x.x").unwrap(),
        ],
        &log,
    );
    assert_eq!(manager.state("net.y"), Some(LifecycleState::Blocked));
    assert_eq!(manager.state("net.x"), Some(LifecycleState::Unloaded));
    assert_eq!(manager.state("nope"), None);

    assert!(matches!(manager.load("net.y").await, Err(PluginSystemError::Blocked { .. })));
    assert!(matches!(manager.load("nope").await, Err(PluginSystemError::UnknownPlugin(_))));
}

#[tokio::test]
async fn test_report_after_start() {
    let log = new_log();
    let manager = manager_with(
        vec![
            plugin("net.x", "2.0.0"),
            plugin("net.y", "1.0.0").requires_plugin("net.x", "1.x.x").unwrap(),
        ],
        &log,
    );
    let report = manager.start_all().await.unwrap();

    assert_eq!(report.ids_in_state(LifecycleState::Active), ["net.x"]);
    let y = report.status("net.y").unwrap();
    assert_eq!(y.state, LifecycleState::Blocked);
    assert!(y.reason.as_deref().is_some_and(|reason| reason.contains("1.x.x")));

    let condition = report.conditions_for("net.y").next().unwrap();
    assert_eq!(condition.kind, ConditionKind::DependencyUnresolved);
    assert!(condition.message.contains("net.x"));
    assert!(condition.message.contains("1.x.x"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["plugins"][1]["state"], "BLOCKED");
    assert_eq!(json["conditions"][0]["kind"], "DependencyUnresolved");
}

#[tokio::test]
async fn test_cycle_is_reported_not_raised() {
    let log = new_log();
    let manager = manager_with(
        vec![
            plugin("a", "1.0.0").requires_plugin("b", "*").unwrap(),
            plugin("b", "1.0.0").requires_plugin("a", "*").unwrap(),
        ],
        &log,
    );
    let report = manager.start_all().await.unwrap();
    assert_eq!(report.ids_in_state(LifecycleState::Blocked), ["a", "b"]);
    assert!(report.has_condition("a", ConditionKind::DependencyCycle));
    assert!(matching(&log, "activated").is_empty());
}

#[tokio::test]
async fn test_start_all_skips_dependents_of_failed_plugins() {
    let log = new_log();
    let manager = DefaultPluginManager::new();
    register_mock(&manager, "net.x", MockSpec::new(&log).failing("activated"));
    register_mock(&manager, "net.y", MockSpec::new(&log));
    register_mock(&manager, "other", MockSpec::new(&log));
    let mut descriptors = net_pair();
    descriptors.push(plugin("other", "1.0.0"));
    manager.add_descriptors(descriptors).unwrap();

    let report = manager.start_all().await.unwrap();
    assert_eq!(report.ids_in_state(LifecycleState::Active), ["other"]);
    assert!(report.has_condition("net.x", ConditionKind::CallbackFailure));
    assert!(report.has_condition("net.y", ConditionKind::DependencyUnresolved));
    assert!(matching(&log, "net.y:").is_empty());
}

#[tokio::test]
async fn test_enforced_package_policy_blocks() {
    let log = new_log();
    let descriptors = || vec![plugin("crypto", "1.0.0").requires(PackageDependency::new("openssl"))];

    let advisory = configured(ManagerConfig::new(), descriptors(), &log);
    let report = advisory.start_all().await.unwrap();
    assert_eq!(report.status("crypto").unwrap().state, LifecycleState::Active);
    assert!(report.has_condition("crypto", ConditionKind::PackageMissing));

    let enforced = configured(
        ManagerConfig::new().with_package_policy(PackagePolicy::Enforce),
        descriptors(),
        &log,
    );
    assert_eq!(enforced.state("crypto"), Some(LifecycleState::Blocked));

    let installed = configured(
        ManagerConfig::new()
            .with_package_policy(PackagePolicy::Enforce)
            .with_package("openssl", Some("3.0.0")),
        descriptors(),
        &log,
    );
    assert_eq!(installed.state("crypto"), Some(LifecycleState::Unloaded));
}

#[tokio::test]
async fn test_custom_probe() {
    let log = new_log();
    let probe = StaticPackageProbe::new().with_package("openssl", None);
    let manager = DefaultPluginManager::with_probe(
        ManagerConfig::new().with_package_policy(PackagePolicy::Enforce),
        Arc::new(probe),
    );
    register_mock(&manager, "crypto", MockSpec::new(&log));
    manager
        .add_descriptor(plugin("crypto", "1.0.0").requires(PackageDependency::new("openssl")))
        .unwrap();
    assert!(manager.load("crypto").await.is_ok());
}

#[tokio::test]
async fn test_invalid_package_table_is_a_config_error() {
    let config = ManagerConfig::new().with_package("openssl", Some("three"));
    assert!(DefaultPluginManager::with_config(config).is_err());
}

#[tokio::test]
async fn test_manager_handle_tracks_liveness() {
    let manager = DefaultPluginManager::new();
    let handle = manager.handle();
    assert!(handle.is_alive());
    assert!(handle.upgrade().is_some());

    let clone = manager.clone();
    drop(manager);
    assert!(handle.is_alive());
    drop(clone);
    assert!(!handle.is_alive());
    assert!(handle.upgrade().is_none());
}

#[tokio::test]
async fn test_kernel_component_drives_start_and_stop() {
    let log = new_log();
    let manager = manager_with(net_pair(), &log);
    assert_eq!(manager.name(), "DefaultPluginManager");

    manager.initialize().await.unwrap();
    manager.start().await.unwrap();
    assert_eq!(manager.state("net.y"), Some(LifecycleState::Active));

    manager.stop().await.unwrap();
    assert_eq!(manager.state("net.x"), Some(LifecycleState::Unloaded));
    assert!(manager.is_shutting_down());
}

/// Unit whose `activated` waits until released
struct SlowStart {
    log: CallLog,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Plugin for SlowStart {
    async fn activated(&self) -> Result<(), PluginError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.log.lock().unwrap().push("b.slow:activated".to_string());
        Ok(())
    }

    async fn teardown(&self) -> Result<(), PluginError> {
        self.log.lock().unwrap().push("b.slow:teardown".to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_during_start_all_waits_for_in_flight_activation() {
    let log = new_log();
    let manager = DefaultPluginManager::new();
    register_mock(&manager, "a.first", MockSpec::new(&log));
    register_mock(&manager, "c.last", MockSpec::new(&log));
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let slow = Arc::new(SlowStart {
        log: log.clone(),
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    });
    manager.register_unit("b.slow", move |_: &UnitContext| {
        let unit: Arc<dyn Plugin> = slow.clone();
        Ok(unit)
    });
    manager
        .add_descriptors(vec![
            plugin("a.first", "1.0.0"),
            plugin("b.slow", "1.0.0").requires_plugin("a.first", "1").unwrap(),
            plugin("c.last", "1.0.0"),
        ])
        .unwrap();
    assert_eq!(manager.graph().load_order(), ["a.first", "b.slow", "c.last"]);

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_all().await })
    };
    entered.notified().await;

    let stopping = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.shutdown().await })
    };
    while !manager.is_shutting_down() {
        tokio::task::yield_now().await;
    }
    release.notify_one();

    assert!(matches!(starting.await.unwrap(), Err(PluginSystemError::ShuttingDown)));
    stopping.await.unwrap().unwrap();

    assert_eq!(manager.state("a.first"), Some(LifecycleState::Unloaded));
    assert_eq!(manager.state("b.slow"), Some(LifecycleState::Unloaded));
    assert_eq!(manager.state("c.last"), Some(LifecycleState::Unloaded));
    assert!(matching(&log, "c.last").is_empty());
    assert!(position(&log, "b.slow:activated") < position(&log, "b.slow:teardown"));
    assert!(position(&log, "b.slow:teardown") < position(&log, "a.first:teardown"));
    assert!(matches!(manager.load("c.last").await, Err(PluginSystemError::ShuttingDown)));
}
