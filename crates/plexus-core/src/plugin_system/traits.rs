use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

use crate::plugin_system::capability::{CapabilityChange, CapabilityHooks};
use crate::plugin_system::descriptor::PluginDescriptor;
use crate::plugin_system::instance::PluginHandle;
use crate::plugin_system::manager::ManagerHandle;

/// Error type for plugin callbacks
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin initialization error: {0}")]
    InitError(String),
    #[error("Plugin dependency error: {0}")]
    DependencyError(String),
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
    #[error("Plugin shutdown error: {0}")]
    ShutdownError(String),
    #[error("Plugin callback panicked: {0}")]
    Panicked(String),
}

/// Upcast helper so handles can hand out concrete unit types
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Callback surface of one code unit.
///
/// Every method has a no-op default. Callbacks run on the task driving the
/// transition; a slow callback (capability hooks in particular) delays the
/// activation of whichever plugin triggered it, so long-running work belongs
/// in background tasks started from [`activated`](Plugin::activated).
#[async_trait]
pub trait Plugin: AsAny + Send + Sync {
    /// Receive the live instance of a resolved hard dependency.
    ///
    /// Called once per dependency during LOADING → LOADED; `slot` is the
    /// dependency's declared slot name (its plugin id unless overridden).
    async fn inject(&self, _slot: &str, _dependency: &PluginHandle) -> Result<(), PluginError> {
        Ok(())
    }

    /// Tag-specific capability hooks. Read once, when the instance is built.
    fn capability_hooks(&self) -> CapabilityHooks {
        CapabilityHooks::new()
    }

    /// Generic capability hook, called for every consumed tag after the
    /// tag-specific hook (if any).
    async fn capability_changed(&self, _change: &CapabilityChange) -> Result<(), PluginError> {
        Ok(())
    }

    /// All injections are in place and the instance is registered.
    async fn activated(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// The instance is no longer visible to lookups; stop background work.
    async fn teardown(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Final callback after the instance was released by the manager.
    async fn teardown_complete(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// What a factory gets to build a code unit with
#[derive(Clone)]
pub struct UnitContext {
    pub descriptor: Arc<PluginDescriptor>,
    /// Name of the unit being built
    pub unit: String,
    /// Handle to the manager that owns the instance
    pub manager: ManagerHandle,
}

/// Builds the implementation object of a named code unit
pub trait UnitFactory: Send + Sync {
    fn create(&self, context: &UnitContext) -> Result<Arc<dyn Plugin>, PluginError>;
}

impl<F> UnitFactory for F
where
    F: Fn(&UnitContext) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync,
{
    fn create(&self, context: &UnitContext) -> Result<Arc<dyn Plugin>, PluginError> {
        self(context)
    }
}

/// Await a callback future, turning a panic into [`PluginError::Panicked`].
pub(crate) async fn guarded<F>(callback: F) -> Result<(), PluginError>
where
    F: Future<Output = Result<(), PluginError>> + Send,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(PluginError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
