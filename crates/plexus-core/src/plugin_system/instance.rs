//! Runtime side of a plugin: lifecycle states, per-id slots and instances.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::plugin_system::capability::{CapabilityChange, CapabilityHooks, ChangeKind};
use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::manager::ManagerHandle;
use crate::plugin_system::traits::{guarded, AsAny, Plugin, PluginError};
use crate::plugin_system::version::Version;

/// Where a plugin is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Loaded,
    Active,
    Unloading,
    /// The current graph cannot activate this id
    Blocked,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unloaded => "UNLOADED",
            LifecycleState::Loading => "LOADING",
            LifecycleState::Loaded => "LOADED",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Unloading => "UNLOADING",
            LifecycleState::Blocked => "BLOCKED",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle step a callback failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Code unit construction
    Load,
    Inject,
    /// Capability registration and the `activated` callback
    Activate,
    /// A capability hook invoked on behalf of another plugin
    Notify,
    Unload,
    TeardownComplete,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Load => "load",
            Transition::Inject => "inject",
            Transition::Activate => "activate",
            Transition::Notify => "notify",
            Transition::Unload => "unload",
            Transition::TeardownComplete => "teardown-complete",
        };
        write!(f, "{}", name)
    }
}

/// Live instance of one effective descriptor
pub struct PluginInstance {
    descriptor: Arc<PluginDescriptor>,
    units: Vec<Arc<dyn Plugin>>,
    /// Hook table of each unit, index-aligned with `units`
    hooks: Vec<CapabilityHooks>,
    state: RwLock<LifecycleState>,
    /// dependency id -> injected provider
    dependencies: Mutex<BTreeMap<String, PluginHandle>>,
    /// consumed tag -> provider id -> provider
    capabilities: Mutex<BTreeMap<String, BTreeMap<String, PluginHandle>>>,
    manager: ManagerHandle,
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.descriptor.id())
            .field("version", self.descriptor.version())
            .field("state", &*self.state.read())
            .field("units", &self.units.len())
            .finish_non_exhaustive()
    }
}

/// Cheap, clonable reference to a live [`PluginInstance`]
#[derive(Clone, Debug)]
pub struct PluginHandle(Arc<PluginInstance>);

impl PluginHandle {
    pub(crate) fn new(descriptor: Arc<PluginDescriptor>, units: Vec<Arc<dyn Plugin>>, manager: ManagerHandle) -> Self {
        let hooks = units.iter().map(|unit| unit.capability_hooks()).collect();
        Self(Arc::new(PluginInstance {
            descriptor,
            units,
            hooks,
            state: RwLock::new(LifecycleState::Loaded),
            dependencies: Mutex::new(BTreeMap::new()),
            capabilities: Mutex::new(BTreeMap::new()),
            manager,
        }))
    }

    pub fn id(&self) -> &str {
        self.0.descriptor.id()
    }

    pub fn version(&self) -> &Version {
        self.0.descriptor.version()
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.0.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        *self.0.state.read()
    }

    /// First code unit of concrete type `T`
    pub fn unit<T: Plugin>(&self) -> Option<&T> {
        self.0.units.iter().find_map(|unit| {
            let unit: &dyn Plugin = unit.as_ref();
            AsAny::as_any(unit).downcast_ref::<T>()
        })
    }

    pub fn units(&self) -> &[Arc<dyn Plugin>] {
        &self.0.units
    }

    /// Injected hard dependency by plugin id
    pub fn dependency(&self, plugin_id: &str) -> Option<PluginHandle> {
        self.0.dependencies.lock().get(plugin_id).cloned()
    }

    /// Providers of a consumed tag this instance has been told about, ordered by id
    pub fn providers(&self, tag: &str) -> Vec<PluginHandle> {
        self.0
            .capabilities
            .lock()
            .get(tag)
            .map(|providers| providers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn manager(&self) -> &ManagerHandle {
        &self.0.manager
    }

    /// Whether both handles point at the same instance
    pub fn ptr_eq(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        *self.0.state.write() = state;
    }

    /// Ids of the injected hard dependencies
    pub(crate) fn dependency_ids(&self) -> Vec<String> {
        self.0.dependencies.lock().keys().cloned().collect()
    }

    pub(crate) fn attach_dependency(&self, dependency: &PluginHandle) {
        self.0
            .dependencies
            .lock()
            .insert(dependency.id().to_string(), dependency.clone());
    }

    pub(crate) fn forget_capability(&self, tag: &str) {
        self.0.capabilities.lock().remove(tag);
    }

    /// Drop every injected handle so released instances do not keep each other alive.
    pub(crate) fn clear_injections(&self) {
        self.0.dependencies.lock().clear();
        self.0.capabilities.lock().clear();
    }

    /// Hand a capability change to every unit: the tag-specific hook first,
    /// then the generic one. Changes already reflected in the capability map
    /// are dropped.
    pub(crate) async fn deliver(&self, change: &CapabilityChange) -> Result<(), PluginError> {
        if self.state() == LifecycleState::Unloaded {
            return Ok(());
        }
        let provider_id = change.provider.id();
        let fresh = {
            let mut capabilities = self.0.capabilities.lock();
            match change.kind {
                ChangeKind::Added => {
                    let providers = capabilities.entry(change.tag.clone()).or_default();
                    if providers.get(provider_id).is_some_and(|known| known.ptr_eq(&change.provider)) {
                        false
                    } else {
                        providers.insert(provider_id.to_string(), change.provider.clone());
                        true
                    }
                }
                ChangeKind::Removed => capabilities
                    .get(&change.tag)
                    .and_then(|providers| providers.get(provider_id))
                    .is_some_and(|known| known.ptr_eq(&change.provider)),
            }
        };
        if !fresh {
            return Ok(());
        }

        log::debug!(
            "Plugin '{}': capability '{}' {:?} by '{}'",
            self.id(),
            change.tag,
            change.kind,
            provider_id
        );
        let result = self.run_hooks(change).await;

        if change.kind == ChangeKind::Removed {
            let mut capabilities = self.0.capabilities.lock();
            if let Some(providers) = capabilities.get_mut(&change.tag) {
                providers.remove(provider_id);
                if providers.is_empty() {
                    capabilities.remove(&change.tag);
                }
            }
        }
        result
    }

    async fn run_hooks(&self, change: &CapabilityChange) -> Result<(), PluginError> {
        for (unit, hooks) in self.0.units.iter().zip(&self.0.hooks) {
            if let Some(hook) = hooks.get(&change.tag).cloned() {
                guarded(hook.call(change)).await?;
            }
            guarded(unit.capability_changed(change)).await?;
        }
        Ok(())
    }
}

/// Persistent per-id cell; outlives the instances it hosts
pub(crate) struct PluginSlot {
    /// Held for the whole of a load or unload of this id
    pub(crate) transition: tokio::sync::Mutex<()>,
    /// State while no instance exists (UNLOADED or LOADING)
    state: RwLock<LifecycleState>,
    instance: RwLock<Option<PluginHandle>>,
    /// Ids of plugins activating against, or holding, the hosted instance
    pins: Mutex<BTreeSet<String>>,
}

impl PluginSlot {
    pub(crate) fn new() -> Self {
        Self {
            transition: tokio::sync::Mutex::new(()),
            state: RwLock::new(LifecycleState::Unloaded),
            instance: RwLock::new(None),
            pins: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        match self.instance() {
            Some(instance) => instance.state(),
            None => *self.state.read(),
        }
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        *self.state.write() = state;
    }

    pub(crate) fn instance(&self) -> Option<PluginHandle> {
        self.instance.read().clone()
    }

    pub(crate) fn active_instance(&self) -> Option<PluginHandle> {
        self.instance().filter(|instance| instance.state() == LifecycleState::Active)
    }

    pub(crate) fn attach(&self, instance: PluginHandle) {
        *self.instance.write() = Some(instance);
    }

    /// Pin the active instance on behalf of `dependent`. Returns `None`
    /// when nothing is ACTIVE here.
    pub(crate) fn pin(&self, dependent: &str) -> Option<PluginHandle> {
        let mut pins = self.pins.lock();
        let active = self.active_instance()?;
        pins.insert(dependent.to_string());
        Some(active)
    }

    pub(crate) fn unpin(&self, dependent: &str) {
        self.pins.lock().remove(dependent);
    }

    pub(crate) fn pinned_by(&self) -> BTreeSet<String> {
        self.pins.lock().clone()
    }

    /// Move `instance` to UNLOADING unless a dependent pins it; the pinning
    /// ids are returned otherwise. Shares the pin lock with [`pin`](Self::pin)
    /// so no dependent can attach once this succeeds.
    pub(crate) fn begin_unload(&self, instance: &PluginHandle) -> Result<(), BTreeSet<String>> {
        let pins = self.pins.lock();
        if !pins.is_empty() {
            return Err(pins.clone());
        }
        instance.set_state(LifecycleState::Unloading);
        Ok(())
    }

    /// Release the hosted instance and fall back to UNLOADED.
    pub(crate) fn release(&self) -> Option<PluginHandle> {
        let released = self.instance.write().take();
        self.set_state(LifecycleState::Unloaded);
        released
    }
}
