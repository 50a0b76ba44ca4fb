use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use plexus_core::plugin_system::{CapabilityChange, ChangeKind, Plugin, PluginError, PluginHandle, UnitContext};

/// Code unit that only logs its callbacks
#[derive(Debug)]
pub struct LoggingUnit {
    plugin: String,
    unit: String,
}

impl LoggingUnit {
    pub fn build(ctx: &UnitContext) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(LoggingUnit {
            plugin: ctx.descriptor.to_string(),
            unit: ctx.unit.clone(),
        }))
    }
}

#[async_trait]
impl Plugin for LoggingUnit {
    async fn inject(&self, slot: &str, dependency: &PluginHandle) -> Result<(), PluginError> {
        info!("[{}/{}] injected {}@{} into '{}'", self.plugin, self.unit, dependency.id(), dependency.version(), slot);
        Ok(())
    }

    async fn capability_changed(&self, change: &CapabilityChange) -> Result<(), PluginError> {
        let verb = match change.kind {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
        };
        info!("[{}/{}] '{}' provider {} {}", self.plugin, self.unit, change.tag, change.provider.id(), verb);
        Ok(())
    }

    async fn activated(&self) -> Result<(), PluginError> {
        info!("[{}/{}] activated", self.plugin, self.unit);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), PluginError> {
        info!("[{}/{}] teardown", self.plugin, self.unit);
        Ok(())
    }
}
