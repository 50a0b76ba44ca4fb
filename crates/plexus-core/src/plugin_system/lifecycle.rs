//! Activation and deactivation of single plugins.
//!
//! A transition of one id holds that id's slot lock for its whole duration.
//! Dependencies are activated before the lock is taken and dependents are
//! unloaded before it is taken, so a task never waits on one slot lock while
//! holding another.
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::error::{PluginResult, PluginSystemError};
use crate::plugin_system::graph::DependencyGraph;
use crate::plugin_system::instance::{LifecycleState, PluginHandle, PluginSlot, Transition};
use crate::plugin_system::manager::{ManagerInner, UnloadPolicy};
use crate::plugin_system::traits::{guarded, panic_message, Plugin, PluginError, UnitContext};

fn callback_failure(plugin_id: &str, transition: Transition, source: PluginError) -> PluginSystemError {
    PluginSystemError::CallbackFailure {
        plugin_id: plugin_id.to_string(),
        transition,
        source,
    }
}

impl ManagerInner {
    /// Drive `id` to ACTIVE, activating its resolved dependencies first.
    ///
    /// `graph` is the snapshot the whole activation works against; non-blocked
    /// nodes of one snapshot never form a cycle, so the recursion ends.
    pub(crate) fn activate<'a>(
        self: &'a Arc<Self>,
        graph: &'a Arc<DependencyGraph>,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = PluginResult<PluginHandle>> + Send + 'a>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(PluginSystemError::ShuttingDown);
            }
            let node = graph
                .node(id)
                .ok_or_else(|| PluginSystemError::UnknownPlugin(id.to_string()))?;
            if let Some(reason) = node.blocked_reason() {
                return Err(PluginSystemError::Blocked {
                    plugin_id: id.to_string(),
                    reason: reason.clone(),
                });
            }

            let slot = self.slot(id);
            if let Some(active) = slot.active_instance() {
                return Ok(active);
            }

            for resolved in node.resolved() {
                if let Err(source) = self.activate(graph, &resolved.plugin_id).await {
                    return Err(PluginSystemError::DependencyNotActive {
                        plugin_id: id.to_string(),
                        dependency_id: resolved.plugin_id.clone(),
                        source: Some(Box::new(source)),
                    });
                }
            }

            let _transition = slot.transition.lock().await;
            if self.cancel.is_cancelled() {
                return Err(PluginSystemError::ShuttingDown);
            }
            // Another task finished the job while we waited
            if let Some(active) = slot.active_instance() {
                return Ok(active);
            }

            // Pinned dependencies cannot start unloading until this id lets go
            let mut dependencies = Vec::new();
            for resolved in node.resolved() {
                match self.existing_slot(&resolved.plugin_id).and_then(|dependency| dependency.pin(id)) {
                    Some(handle) => dependencies.push((resolved.slot.clone(), handle)),
                    None => {
                        self.unpin_all(id, dependencies.iter().map(|(_, handle)| handle.id()));
                        return Err(PluginSystemError::DependencyNotActive {
                            plugin_id: id.to_string(),
                            dependency_id: resolved.plugin_id.clone(),
                            source: None,
                        });
                    }
                }
            }

            let descriptor = Arc::clone(node.descriptor());
            log::info!("Loading plugin {}", descriptor);
            slot.set_state(LifecycleState::Loading);
            let units = match self.build_units(&descriptor) {
                Ok(units) => units,
                Err(error) => {
                    log::error!("{}", error);
                    self.unpin_all(id, dependencies.iter().map(|(_, handle)| handle.id()));
                    slot.set_state(LifecycleState::Unloaded);
                    return Err(error);
                }
            };

            let instance = PluginHandle::new(descriptor, units, self.handle());
            for (_, dependency) in &dependencies {
                instance.attach_dependency(dependency);
            }
            slot.attach(instance.clone());
            let mut activated = 0;
            let outcome = self.bring_up(&instance, &dependencies, &mut activated).await.and_then(|()| {
                match dependencies.iter().find(|(_, dependency)| dependency.state() != LifecycleState::Active) {
                    Some((_, gone)) => Err(PluginSystemError::DependencyNotActive {
                        plugin_id: id.to_string(),
                        dependency_id: gone.id().to_string(),
                        source: None,
                    }),
                    None => Ok(()),
                }
            });
            match outcome {
                Ok(()) => {
                    instance.set_state(LifecycleState::Active);
                    log::info!("Plugin '{}' v{} is active", id, instance.version());
                    Ok(instance)
                }
                Err(error) => {
                    log::error!("{}", error);
                    self.roll_back(&instance, activated).await;
                    slot.release();
                    Err(error)
                }
            }
        })
    }

    /// Drop the pins `dependent` holds on `dependencies`.
    fn unpin_all<'d>(&self, dependent: &str, dependencies: impl Iterator<Item = &'d str>) {
        for dependency in dependencies {
            if let Some(slot) = self.existing_slot(dependency) {
                slot.unpin(dependent);
            }
        }
    }

    /// Construct every code unit named by `descriptor`.
    fn build_units(self: &Arc<Self>, descriptor: &Arc<PluginDescriptor>) -> PluginResult<Vec<Arc<dyn Plugin>>> {
        let mut units = Vec::with_capacity(descriptor.code_units().len());
        for unit in descriptor.code_units() {
            let factory = self.factory(unit).ok_or_else(|| PluginSystemError::MissingCodeUnit {
                plugin_id: descriptor.id().to_string(),
                unit: unit.clone(),
            })?;
            let context = UnitContext {
                descriptor: Arc::clone(descriptor),
                unit: unit.clone(),
                manager: self.handle(),
            };
            let built = match panic::catch_unwind(AssertUnwindSafe(|| factory.create(&context))) {
                Ok(result) => result,
                Err(payload) => Err(PluginError::Panicked(panic_message(&*payload))),
            };
            units.push(built.map_err(|source| callback_failure(descriptor.id(), Transition::Load, source))?);
        }
        Ok(units)
    }

    /// LOADED -> ACTIVE minus the final state change: injection, capability
    /// registration and the `activated` callbacks. `activated` counts the
    /// units whose `activated` callback succeeded.
    async fn bring_up(
        &self,
        instance: &PluginHandle,
        dependencies: &[(String, PluginHandle)],
        activated: &mut usize,
    ) -> PluginResult<()> {
        let id = instance.id();
        for (slot_name, dependency) in dependencies {
            for unit in instance.units() {
                guarded(unit.inject(slot_name, dependency))
                    .await
                    .map_err(|source| callback_failure(id, Transition::Inject, source))?;
            }
        }

        for tag in instance.descriptor().provided() {
            let failures = self.capabilities.register_provider(tag, instance).await;
            self.record_hook_failures(failures);
        }
        for tag in instance.descriptor().consumed() {
            self.capabilities
                .register_consumer(tag, instance)
                .await
                .map_err(|failure| callback_failure(id, Transition::Activate, failure.error))?;
        }

        for unit in instance.units() {
            guarded(unit.activated())
                .await
                .map_err(|source| callback_failure(id, Transition::Activate, source))?;
            *activated += 1;
        }
        Ok(())
    }

    /// Undo a partial activation: withdraw every registration, tear down the
    /// first `activated` units in reverse order and drop injections.
    async fn roll_back(&self, instance: &PluginHandle, activated: usize) {
        let id = instance.id();
        log::warn!("Rolling back activation of '{}'", id);
        instance.set_state(LifecycleState::Unloading);
        self.withdraw(instance).await;
        for unit in instance.units()[..activated].iter().rev() {
            if let Err(source) = guarded(unit.teardown()).await {
                self.record_callback_failure(id, Transition::Unload, source);
            }
        }
        self.release_dependencies(instance);
        instance.set_state(LifecycleState::Unloaded);
    }

    /// Unpin every dependency `instance` holds and drop its injected handles.
    fn release_dependencies(&self, instance: &PluginHandle) {
        self.unpin_all(instance.id(), instance.dependency_ids().iter().map(String::as_str));
        instance.clear_injections();
    }

    /// Unregister `instance` as provider (consumers are told) and as consumer.
    async fn withdraw(&self, instance: &PluginHandle) {
        for tag in instance.descriptor().provided() {
            let failures = self.capabilities.unregister_provider(tag, instance).await;
            self.record_hook_failures(failures);
        }
        for tag in instance.descriptor().consumed() {
            self.capabilities.unregister_consumer(tag, instance);
        }
    }

    /// Put a plugin whose teardown failed back into service.
    async fn restore(&self, instance: &PluginHandle) {
        instance.set_state(LifecycleState::Active);
        for tag in instance.descriptor().provided() {
            let failures = self.capabilities.register_provider(tag, instance).await;
            self.record_hook_failures(failures);
        }
        for tag in instance.descriptor().consumed() {
            if let Err(failure) = self.capabilities.register_consumer(tag, instance).await {
                self.record_hook_failures(vec![failure]);
            }
        }
    }

    /// Drive `id` from ACTIVE to UNLOADED.
    pub(crate) fn deactivate<'a>(
        self: &'a Arc<Self>,
        id: &'a str,
        policy: UnloadPolicy,
    ) -> Pin<Box<dyn Future<Output = PluginResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let not_active = || PluginSystemError::NotActive { plugin_id: id.to_string() };
            let slot = self.existing_slot(id).ok_or_else(not_active)?;
            if slot.active_instance().is_none() {
                return Err(not_active());
            }

            if policy == UnloadPolicy::Cascade {
                for dependent in self.active_dependents(id) {
                    log::info!("Unloading '{}' before its dependency '{}'", dependent, id);
                    match self.deactivate(&dependent, UnloadPolicy::Cascade).await {
                        Ok(()) | Err(PluginSystemError::NotActive { .. }) => {}
                        Err(error) => return Err(error),
                    }
                }
            }

            let _transition = slot.transition.lock().await;
            let instance = slot.active_instance().ok_or_else(not_active)?;
            if let Err(dependents) = slot.begin_unload(&instance) {
                let error = PluginSystemError::PluginInUse {
                    plugin_id: id.to_string(),
                    dependents: self.reverse_order(&dependents),
                };
                log::warn!("{}", error);
                return Err(error);
            }
            self.tear_down(&slot, &instance).await
        })
    }

    async fn tear_down(&self, slot: &PluginSlot, instance: &PluginHandle) -> PluginResult<()> {
        let id = instance.id();
        log::info!("Unloading plugin '{}'", id);
        self.withdraw(instance).await;

        for unit in instance.units().iter().rev() {
            if let Err(source) = guarded(unit.teardown()).await {
                let error = callback_failure(id, Transition::Unload, source);
                log::error!("{}; restoring '{}' to ACTIVE", error, id);
                self.restore(instance).await;
                return Err(error);
            }
        }

        instance.set_state(LifecycleState::Unloaded);
        self.release_dependencies(instance);
        slot.release();

        for unit in instance.units().iter().rev() {
            if let Err(source) = guarded(unit.teardown_complete()).await {
                self.record_callback_failure(id, Transition::TeardownComplete, source);
            }
        }
        log::info!("Plugin '{}' unloaded", id);
        Ok(())
    }
}
