use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{self, ManagerConfig};
use crate::kernel::component::KernelComponent;
use crate::kernel::error::Result;
use crate::plugin_system::capability::{CapabilityRegistry, HookFailure};
use crate::plugin_system::dependency::{PackageProbe, StaticPackageProbe};
use crate::plugin_system::descriptor::{LoadingMode, PluginDescriptor};
use crate::plugin_system::error::{PluginResult, PluginSystemError};
use crate::plugin_system::graph::{DependencyGraph, DescriptorSet};
use crate::plugin_system::manifest::ManifestContents;
use crate::plugin_system::instance::{LifecycleState, PluginHandle, PluginSlot, Transition};
use crate::plugin_system::report::{Condition, ConditionKind, LoadReport, PluginStatus};
use crate::plugin_system::traits::{Plugin, PluginError, UnitContext, UnitFactory};

/// What `unload` does about active plugins that depend on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnloadPolicy {
    /// Refuse with `PluginInUse`
    #[default]
    Refuse,
    /// Unload the dependents first, in reverse dependency order
    Cascade,
}

/// Plugin system component interface
#[async_trait]
pub trait PluginManager: KernelComponent {
    /// Add descriptors and rebuild the dependency graph. Nothing is added if
    /// the batch contains a duplicate `(id, version)`.
    fn add_descriptors(&self, descriptors: Vec<PluginDescriptor>) -> PluginResult<()>;

    /// Activate every eager, non-blocked plugin in load order.
    /// Per-plugin failures end up in the returned report.
    async fn start_all(&self) -> PluginResult<LoadReport>;

    /// Activate one plugin and, first, everything it requires
    async fn load(&self, id: &str) -> PluginResult<PluginHandle>;

    /// Deactivate one plugin
    async fn unload(&self, id: &str, policy: UnloadPolicy) -> PluginResult<()>;

    /// Unload then load again, picking up the current effective version
    async fn reload(&self, id: &str, policy: UnloadPolicy) -> PluginResult<PluginHandle>;

    /// Current providers of `tag`; lazy providers are loaded on the first miss
    async fn lookup(&self, tag: &str) -> Vec<PluginHandle>;

    /// Lifecycle state of a known plugin
    fn state(&self, id: &str) -> Option<LifecycleState>;

    /// Id, version, state and block reason of every known plugin
    fn status(&self) -> Vec<PluginStatus>;

    fn report(&self) -> LoadReport;

    /// Refuse further activations, wait for in-flight transitions and unload
    /// everything in reverse dependency order.
    async fn shutdown(&self) -> PluginResult<()>;
}

/// Shared state behind every clone of a [`DefaultPluginManager`]
pub(crate) struct ManagerInner {
    pub(crate) config: ManagerConfig,
    probe: Arc<dyn PackageProbe>,
    descriptors: RwLock<Arc<DescriptorSet>>,
    graph: RwLock<Arc<DependencyGraph>>,
    factories: RwLock<HashMap<String, Arc<dyn UnitFactory>>>,
    slots: RwLock<HashMap<String, Arc<PluginSlot>>>,
    pub(crate) capabilities: CapabilityRegistry,
    /// Conditions raised at runtime (graph conditions live in the graph)
    conditions: Mutex<Vec<Condition>>,
    pub(crate) cancel: CancellationToken,
}

/// Weak reference to the manager that owns an instance
#[derive(Clone, Debug)]
pub struct ManagerHandle(Weak<ManagerInner>);

impl ManagerHandle {
    /// The owning manager, unless it was dropped
    pub fn upgrade(&self) -> Option<DefaultPluginManager> {
        self.0.upgrade().map(|inner| DefaultPluginManager {
            name: MANAGER_NAME,
            inner,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

const MANAGER_NAME: &str = "DefaultPluginManager";

/// Default implementation of plugin manager
#[derive(Clone)]
pub struct DefaultPluginManager {
    name: &'static str,
    inner: Arc<ManagerInner>,
}

impl DefaultPluginManager {
    /// Create a manager with default settings and no known packages
    pub fn new() -> Self {
        Self::with_probe(ManagerConfig::default(), Arc::new(StaticPackageProbe::new()))
    }

    /// Create a manager whose package probe answers from `config.packages`
    pub fn with_config(config: ManagerConfig) -> config::Result<Self> {
        let probe = config.package_probe()?;
        Ok(Self::with_probe(config, Arc::new(probe)))
    }

    pub fn with_probe(config: ManagerConfig, probe: Arc<dyn PackageProbe>) -> Self {
        Self {
            name: MANAGER_NAME,
            inner: Arc::new(ManagerInner {
                config,
                probe,
                descriptors: RwLock::new(Arc::new(DescriptorSet::new())),
                graph: RwLock::new(Arc::new(DependencyGraph::default())),
                factories: RwLock::new(HashMap::new()),
                slots: RwLock::new(HashMap::new()),
                capabilities: CapabilityRegistry::new(),
                conditions: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Bind a code-unit name to the closure that builds it
    pub fn register_unit<F>(&self, name: &str, factory: F)
    where
        F: Fn(&UnitContext) -> std::result::Result<Arc<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.register_factory(name, Arc::new(factory));
    }

    pub fn register_factory(&self, name: &str, factory: Arc<dyn UnitFactory>) {
        log::debug!("Registering code unit factory '{}'", name);
        self.inner.factories.write().insert(name.to_string(), factory);
    }

    pub fn has_unit(&self, name: &str) -> bool {
        self.inner.factories.read().contains_key(name)
    }

    /// Convenience wrapper around [`add_descriptors`](PluginManager::add_descriptors)
    pub fn add_descriptor(&self, descriptor: PluginDescriptor) -> PluginResult<()> {
        self.inner.add_descriptors(vec![descriptor])
    }

    /// Add the accepted descriptors of a manifest and record its rejected entries
    pub fn add_manifest(&self, manifest: ManifestContents) -> PluginResult<()> {
        self.inner.add_descriptors(manifest.descriptors)?;
        for condition in manifest.rejected {
            self.inner.record(condition);
        }
        Ok(())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Current descriptor set snapshot
    pub fn descriptors(&self) -> Arc<DescriptorSet> {
        self.inner.descriptors.read().clone()
    }

    /// Current dependency graph snapshot
    pub fn graph(&self) -> Arc<DependencyGraph> {
        self.inner.graph_snapshot()
    }

    /// The active instance of `id`, if any
    pub fn instance(&self, id: &str) -> Option<PluginHandle> {
        self.inner.existing_slot(id).and_then(|slot| slot.active_instance())
    }

    /// Providers currently registered for `tag`, without lazy loading
    pub fn providers(&self, tag: &str) -> Vec<PluginHandle> {
        self.inner.capabilities.providers(tag)
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.inner.capabilities
    }

    /// Conditions recorded at runtime so far
    pub fn conditions(&self) -> Vec<Condition> {
        self.inner.conditions.lock().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn handle(&self) -> ManagerHandle {
        self.inner.handle()
    }
}

impl Default for DefaultPluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for DefaultPluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultPluginManager")
            .field("name", &self.name)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KernelComponent for DefaultPluginManager {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn initialize(&self) -> Result<()> {
        let graph = self.inner.graph_snapshot();
        log::info!(
            "Initializing plugin manager: {} plugin(s) known, {} blocked",
            graph.nodes().count(),
            graph.blocked_ids().len()
        );
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let report = self.start_all().await?;
        log::info!(
            "Plugin manager started: {} active, {} condition(s)",
            report.ids_in_state(LifecycleState::Active).len(),
            report.conditions.len()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl PluginManager for DefaultPluginManager {
    fn add_descriptors(&self, descriptors: Vec<PluginDescriptor>) -> PluginResult<()> {
        self.inner.add_descriptors(descriptors)
    }

    async fn start_all(&self) -> PluginResult<LoadReport> {
        self.inner.start_all().await
    }

    async fn load(&self, id: &str) -> PluginResult<PluginHandle> {
        let graph = self.inner.graph_snapshot();
        self.inner.activate(&graph, id).await.inspect_err(|e| {
            log::error!("Failed to load plugin '{}': {}", id, e);
            self.inner.record_failure(id, e);
        })
    }

    async fn unload(&self, id: &str, policy: UnloadPolicy) -> PluginResult<()> {
        self.inner.deactivate(id, policy).await.inspect_err(|e| {
            if !matches!(e, PluginSystemError::NotActive { .. }) {
                self.inner.record_failure(id, e);
            }
        })
    }

    async fn reload(&self, id: &str, policy: UnloadPolicy) -> PluginResult<PluginHandle> {
        self.inner.reload(id, policy).await
    }

    async fn lookup(&self, tag: &str) -> Vec<PluginHandle> {
        self.inner.lookup(tag).await
    }

    fn state(&self, id: &str) -> Option<LifecycleState> {
        self.inner.state(&self.inner.graph_snapshot(), id)
    }

    fn status(&self) -> Vec<PluginStatus> {
        self.inner.status(&self.inner.graph_snapshot())
    }

    fn report(&self) -> LoadReport {
        self.inner.report()
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.inner.shutdown().await
    }
}

impl ManagerInner {
    pub(crate) fn handle(self: &Arc<Self>) -> ManagerHandle {
        ManagerHandle(Arc::downgrade(self))
    }

    pub(crate) fn graph_snapshot(&self) -> Arc<DependencyGraph> {
        self.graph.read().clone()
    }

    pub(crate) fn factory(&self, name: &str) -> Option<Arc<dyn UnitFactory>> {
        self.factories.read().get(name).cloned()
    }

    pub(crate) fn slot(&self, id: &str) -> Arc<PluginSlot> {
        if let Some(slot) = self.slots.read().get(id) {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.slots
                .write()
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(PluginSlot::new())),
        )
    }

    pub(crate) fn existing_slot(&self, id: &str) -> Option<Arc<PluginSlot>> {
        self.slots.read().get(id).cloned()
    }

    fn add_descriptors(&self, descriptors: Vec<PluginDescriptor>) -> PluginResult<()> {
        let mut current = self.descriptors.write();
        let mut next = DescriptorSet::clone(&current);
        next.extend(descriptors)?;
        let graph = DependencyGraph::build(&next, self.probe.as_ref(), self.config.package_policy);
        log::info!(
            "Descriptor set updated: {} descriptor(s), {} blocked plugin(s)",
            next.len(),
            graph.blocked_ids().len()
        );
        *self.graph.write() = Arc::new(graph);
        *current = Arc::new(next);
        Ok(())
    }

    /// Record a runtime failure, including what a dependency failure wraps.
    pub(crate) fn record_failure(&self, id: &str, error: &PluginSystemError) {
        match error {
            // Already part of the graph conditions
            PluginSystemError::Blocked { .. } | PluginSystemError::ShuttingDown => {}
            PluginSystemError::DependencyNotActive {
                dependency_id,
                source: Some(source),
                ..
            } => {
                self.record_failure(dependency_id, source);
                self.conditions.lock().push(Condition::from_error(id, error));
            }
            _ => self.conditions.lock().push(Condition::from_error(id, error)),
        }
    }

    pub(crate) fn record_hook_failures(&self, failures: Vec<HookFailure>) {
        if failures.is_empty() {
            return;
        }
        let mut conditions = self.conditions.lock();
        for failure in failures {
            log::error!(
                "Capability hook of '{}' failed for '{}' ({:?}): {}",
                failure.consumer_id,
                failure.tag,
                failure.kind,
                failure.error
            );
            let error = PluginSystemError::CallbackFailure {
                plugin_id: failure.consumer_id.clone(),
                transition: Transition::Notify,
                source: failure.error,
            };
            conditions.push(Condition::from_error(&failure.consumer_id, &error));
        }
    }

    pub(crate) fn record(&self, condition: Condition) {
        self.conditions.lock().push(condition);
    }

    pub(crate) fn state(&self, graph: &DependencyGraph, id: &str) -> Option<LifecycleState> {
        let slot = self.existing_slot(id);
        if let Some(instance) = slot.as_ref().and_then(|slot| slot.instance()) {
            return Some(instance.state());
        }
        if graph.is_blocked(id) {
            return Some(LifecycleState::Blocked);
        }
        match slot {
            Some(slot) => Some(slot.state()),
            None if graph.contains(id) => Some(LifecycleState::Unloaded),
            None => None,
        }
    }

    fn status(&self, graph: &DependencyGraph) -> Vec<PluginStatus> {
        graph
            .nodes()
            .map(|(id, node)| {
                let instance = self.existing_slot(id).and_then(|slot| slot.instance());
                let version = instance
                    .as_ref()
                    .map(|instance| instance.version().to_string())
                    .unwrap_or_else(|| node.descriptor().version().to_string());
                PluginStatus {
                    id: id.to_string(),
                    version,
                    state: self.state(graph, id).unwrap_or(LifecycleState::Unloaded),
                    reason: node.blocked_reason().map(ToString::to_string),
                }
            })
            .collect()
    }

    fn report(&self) -> LoadReport {
        let graph = self.graph_snapshot();
        let mut conditions = graph.conditions().to_vec();
        conditions.extend(self.conditions.lock().iter().cloned());
        LoadReport {
            plugins: self.status(&graph),
            conditions,
        }
    }

    async fn start_all(self: &Arc<Self>) -> PluginResult<LoadReport> {
        if self.cancel.is_cancelled() {
            return Err(PluginSystemError::ShuttingDown);
        }
        let graph = self.graph_snapshot();
        let order: Vec<String> = graph.load_order().into_iter().map(str::to_string).collect();
        log::info!("Starting {} eager plugin(s): {:?}", order.len(), order);

        let mut failed: HashSet<String> = HashSet::new();
        for id in &order {
            let failed_dependency = graph
                .node(id)
                .and_then(|node| node.resolved().find(|dep| failed.contains(&dep.plugin_id)))
                .map(|dep| dep.plugin_id.clone());
            if let Some(dependency_id) = failed_dependency {
                let error = PluginSystemError::DependencyNotActive {
                    plugin_id: id.clone(),
                    dependency_id,
                    source: None,
                };
                log::warn!("Skipping plugin '{}': {}", id, error);
                self.record_failure(id, &error);
                failed.insert(id.clone());
                continue;
            }

            match self.activate(&graph, id).await {
                Ok(_) => {}
                Err(PluginSystemError::ShuttingDown) => return Err(PluginSystemError::ShuttingDown),
                Err(error) => {
                    log::error!("Failed to start plugin '{}': {}", id, error);
                    self.record_failure(id, &error);
                    failed.insert(id.clone());
                }
            }
        }
        Ok(self.report())
    }

    async fn lookup(self: &Arc<Self>, tag: &str) -> Vec<PluginHandle> {
        let providers = self.capabilities.providers(tag);
        if !providers.is_empty() || !self.config.lazy_on_miss || self.cancel.is_cancelled() {
            return providers;
        }

        let graph = self.graph_snapshot();
        let lazy: Vec<String> = graph
            .providers_of(tag)
            .filter(|id| {
                graph
                    .node(id)
                    .is_some_and(|node| !node.is_blocked() && node.descriptor().loading_mode() == LoadingMode::Lazy)
            })
            .map(str::to_string)
            .collect();
        if lazy.is_empty() {
            return providers;
        }

        log::info!("No provider of '{}' is active, loading lazy provider(s) {:?}", tag, lazy);
        for id in &lazy {
            if let Err(error) = self.activate(&graph, id).await {
                log::warn!("Lazy load of '{}' for capability '{}' failed: {}", id, tag, error);
                self.record_failure(id, &error);
            }
        }
        self.capabilities.providers(tag)
    }

    /// Ids of instances holding `id` as a hard dependency or activating
    /// against it, in reverse dependency order
    pub(crate) fn active_dependents(&self, id: &str) -> Vec<String> {
        let dependents = self
            .existing_slot(id)
            .map(|slot| slot.pinned_by())
            .unwrap_or_default();
        self.reverse_order(&dependents)
    }

    /// `ids` in reverse topological order; ids the graph cannot order come first
    pub(crate) fn reverse_order(&self, ids: &BTreeSet<String>) -> Vec<String> {
        let graph = self.graph_snapshot();
        let ordered = graph.order_subset(ids);
        let mut result: Vec<String> = ids
            .iter()
            .filter(|id| !ordered.contains(&id.as_str()))
            .cloned()
            .collect();
        result.extend(ordered.iter().rev().map(|id| id.to_string()));
        result
    }

    /// Every active plugin that (transitively) holds `id` as a dependency
    fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.active_dependents(&current) {
                if found.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        found
    }

    async fn reload(self: &Arc<Self>, id: &str, policy: UnloadPolicy) -> PluginResult<PluginHandle> {
        let dependents = match policy {
            UnloadPolicy::Cascade => self.transitive_dependents(id),
            UnloadPolicy::Refuse => BTreeSet::new(),
        };
        log::info!("Reloading plugin '{}'", id);

        match self.deactivate(id, policy).await {
            Ok(()) | Err(PluginSystemError::NotActive { .. }) => {}
            Err(error) => return Err(error),
        }

        let graph = self.graph_snapshot();
        let handle = self.activate(&graph, id).await.inspect_err(|e| {
            log::error!("Reload of '{}' failed: {}", id, e);
            self.record_failure(id, e);
        })?;

        for dependent in graph.order_subset(&dependents) {
            if let Err(error) = self.activate(&graph, dependent).await {
                log::error!("Failed to re-activate '{}' after reloading '{}': {}", dependent, id, error);
                self.record_failure(dependent, &error);
            }
        }
        log::info!("Plugin '{}' reloaded at version {}", id, handle.version());
        Ok(handle)
    }

    async fn shutdown(self: &Arc<Self>) -> PluginResult<()> {
        self.cancel.cancel();
        log::info!("Shutting down plugin manager");

        let known: BTreeSet<String> = self.slots.read().keys().cloned().collect();
        let mut first_error = None;
        for id in self.reverse_order(&known) {
            let Some(slot) = self.existing_slot(&id) else {
                continue;
            };
            // Wait for any in-flight transition of this id
            drop(slot.transition.lock().await);
            if slot.active_instance().is_none() {
                continue;
            }
            match self.deactivate(&id, UnloadPolicy::Cascade).await {
                Ok(()) | Err(PluginSystemError::NotActive { .. }) => {}
                Err(error) => {
                    log::error!("Failed to unload '{}' during shutdown: {}", id, error);
                    self.record_failure(&id, &error);
                    first_error.get_or_insert(error);
                }
            }
        }
        log::info!("Plugin manager shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// Record a failure that a caller cannot see, such as a failed `teardown_complete`
    pub(crate) fn record_callback_failure(&self, id: &str, transition: Transition, source: PluginError) {
        let error = PluginSystemError::CallbackFailure {
            plugin_id: id.to_string(),
            transition,
            source,
        };
        log::error!("{}", error);
        self.record(Condition::new(id, ConditionKind::CallbackFailure, error.to_string()));
    }
}
