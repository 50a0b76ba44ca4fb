#![cfg(test)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::FutureExt;

use crate::plugin_system::capability::{CapabilityChange, CapabilityHooks, ChangeKind};
use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::instance::PluginHandle;
use crate::plugin_system::manager::{DefaultPluginManager, PluginManager};
use crate::plugin_system::traits::{Plugin, PluginError, UnitContext};

/// Shared, ordered record of callback invocations
pub type CallLog = Arc<StdMutex<Vec<String>>>;

pub fn new_log() -> CallLog {
    Arc::new(StdMutex::new(Vec::new()))
}

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Entries containing `needle`
pub fn matching(log: &CallLog, needle: &str) -> Vec<String> {
    entries(log).into_iter().filter(|entry| entry.contains(needle)).collect()
}

pub fn position(log: &CallLog, entry: &str) -> usize {
    entries(log)
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("'{}' not found in {:?}", entry, entries(log)))
}

fn kind_name(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Added => "added",
        ChangeKind::Removed => "removed",
    }
}

/// How a [`RecordingPlugin`] behaves
#[derive(Clone)]
pub struct MockSpec {
    pub log: CallLog,
    /// Callback names returning an error ("construct", "inject", "hook", "changed", "activated", "teardown", "teardown_complete")
    pub fail: HashSet<&'static str>,
    /// Callback names that panic
    pub panic: HashSet<&'static str>,
    /// Tags with a tag-specific hook
    pub hooks: Vec<String>,
    /// Number of units built
    pub built: Arc<AtomicUsize>,
}

impl MockSpec {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            fail: HashSet::new(),
            panic: HashSet::new(),
            hooks: Vec::new(),
            built: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(mut self, callback: &'static str) -> Self {
        self.fail.insert(callback);
        self
    }

    pub fn panicking(mut self, callback: &'static str) -> Self {
        self.panic.insert(callback);
        self
    }

    pub fn with_hook(mut self, tag: &str) -> Self {
        self.hooks.push(tag.to_string());
        self
    }

    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }
}

/// Plugin unit recording every callback as `"<unit>:<callback>[:details]"`
pub struct RecordingPlugin {
    id: String,
    spec: MockSpec,
    injected: StdMutex<Vec<(String, PluginHandle)>>,
}

impl RecordingPlugin {
    pub fn new(id: &str, spec: MockSpec) -> Self {
        Self {
            id: id.to_string(),
            spec,
            injected: StdMutex::new(Vec::new()),
        }
    }

    /// (slot, handle) pairs received through `inject`
    pub fn injected(&self) -> Vec<(String, PluginHandle)> {
        self.injected.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.spec.log.lock().unwrap().push(entry);
    }

    fn outcome(&self, callback: &str) -> Result<(), PluginError> {
        if self.spec.panic.contains(callback) {
            panic!("{} panicked in {}", self.id, callback);
        }
        if self.spec.fail.contains(callback) {
            return Err(PluginError::ExecutionError(format!("{} failed in {}", self.id, callback)));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    async fn inject(&self, slot: &str, dependency: &PluginHandle) -> Result<(), PluginError> {
        self.record(format!("{}:inject:{}:{}@{}", self.id, slot, dependency.id(), dependency.version()));
        self.outcome("inject")?;
        self.injected.lock().unwrap().push((slot.to_string(), dependency.clone()));
        Ok(())
    }

    fn capability_hooks(&self) -> CapabilityHooks {
        let mut hooks = CapabilityHooks::new();
        for tag in &self.spec.hooks {
            let id = self.id.clone();
            let log = self.spec.log.clone();
            let fails = self.spec.fail.contains("hook");
            hooks = hooks.on(tag, move |change: CapabilityChange| {
                let id = id.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!(
                        "{}:hook:{}:{}:{}",
                        id,
                        change.tag,
                        kind_name(change.kind),
                        change.provider.id()
                    ));
                    if fails {
                        return Err(PluginError::ExecutionError(format!("{} hook failed", id)));
                    }
                    Ok(())
                }
                .boxed()
            });
        }
        hooks
    }

    async fn capability_changed(&self, change: &CapabilityChange) -> Result<(), PluginError> {
        self.record(format!(
            "{}:changed:{}:{}:{}:{}",
            self.id,
            change.tag,
            kind_name(change.kind),
            change.provider.id(),
            change.provider.state()
        ));
        self.outcome("changed")
    }

    async fn activated(&self) -> Result<(), PluginError> {
        self.record(format!("{}:activated", self.id));
        self.outcome("activated")
    }

    async fn teardown(&self) -> Result<(), PluginError> {
        self.record(format!("{}:teardown", self.id));
        self.outcome("teardown")
    }

    async fn teardown_complete(&self) -> Result<(), PluginError> {
        self.record(format!("{}:teardown_complete", self.id));
        self.outcome("teardown_complete")
    }
}

/// Register a factory for code unit `unit` building [`RecordingPlugin`]s
pub fn register_mock(manager: &DefaultPluginManager, unit: &str, spec: MockSpec) {
    manager.register_unit(unit, move |ctx: &UnitContext| {
        spec.built.fetch_add(1, Ordering::SeqCst);
        if spec.panic.contains("construct") {
            panic!("constructor of {} panicked", ctx.unit);
        }
        if spec.fail.contains("construct") {
            return Err(PluginError::InitError(format!("cannot build {}", ctx.unit)));
        }
        let unit: Arc<dyn Plugin> = Arc::new(RecordingPlugin::new(&ctx.unit, spec.clone()));
        Ok(unit)
    });
}

/// Descriptor whose single code unit is named after the plugin id
pub fn plugin(id: &str, version: &str) -> PluginDescriptor {
    PluginDescriptor::new(id, version).unwrap().code_unit(id)
}

/// Manager with a recording unit registered for each id
pub fn manager_with(descriptors: Vec<PluginDescriptor>, log: &CallLog) -> DefaultPluginManager {
    let manager = DefaultPluginManager::new();
    for descriptor in &descriptors {
        register_mock(&manager, descriptor.id(), MockSpec::new(log));
    }
    manager.add_descriptors(descriptors).expect("descriptor batch should be accepted");
    manager
}

/// Look up a unit of a live instance as a recording mock
pub fn recorder(handle: &PluginHandle) -> &RecordingPlugin {
    handle.unit::<RecordingPlugin>().expect("instance should contain a recording unit")
}
