use std::path::Path;
use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::kernel::component::KernelComponent;
use crate::kernel::constants;
use crate::kernel::error::{Error, KernelLifecyclePhase, Result};
use crate::plugin_system::manifest::load_manifest;
use crate::plugin_system::{DefaultPluginManager, LoadReport, PluginManager};

/// Main application struct owning the configuration and the plugin manager
pub struct Application {
    config: ManagerConfig,
    initialized: bool,
    started: bool,
    plugin_manager: Arc<DefaultPluginManager>,
    // Components in initialization order
    components: Vec<Arc<dyn KernelComponent>>,
}

impl Application {
    /// Creates an application with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Result<Self> {
        log::info!("Initializing {} v{}", constants::APP_NAME, constants::APP_VERSION);
        let plugin_manager = Arc::new(DefaultPluginManager::with_config(config.clone())?);
        let components: Vec<Arc<dyn KernelComponent>> = vec![plugin_manager.clone() as Arc<dyn KernelComponent>];
        Ok(Application {
            config,
            initialized: false,
            started: false,
            plugin_manager,
            components,
        })
    }

    /// Creates an application from a JSON, YAML or TOML configuration file.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        log::info!("Reading configuration from {}", path.display());
        Self::with_config(ManagerConfig::from_file(path)?)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn plugin_manager(&self) -> &DefaultPluginManager {
        &self.plugin_manager
    }

    /// Returns whether the application has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Initialize and start, returning the startup report.
    pub async fn run(&mut self) -> Result<LoadReport> {
        self.initialize().await?;
        self.start().await?;
        log::info!("Application initialized and started successfully.");
        Ok(self.plugin_manager.report())
    }

    /// Load the configured manifests, then initialize every component.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::lifecycle(
                KernelLifecyclePhase::Initialize,
                None,
                "Application already initialized",
            ));
        }

        for manifest in &self.config.manifests {
            self.plugin_manager.add_manifest(load_manifest(manifest)?)?;
        }

        log::info!("Initializing components...");
        for component in &self.components {
            log::info!("Initializing component: {}", component.name());
            component.initialize().await.map_err(|e| {
                Error::lifecycle(
                    KernelLifecyclePhase::Initialize,
                    Some(component.name()),
                    "Component failed to initialize",
                )
                .with_source(e)
            })?;
        }
        self.initialized = true;
        log::info!("Component initialization complete.");
        Ok(())
    }

    /// Start all initialized components in order.
    pub async fn start(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::lifecycle(
                KernelLifecyclePhase::Start,
                None,
                "Application must be initialized before it is started",
            ));
        }
        log::info!("Starting components...");
        for component in &self.components {
            log::info!("Starting component: {}", component.name());
            component.start().await.map_err(|e| {
                Error::lifecycle(KernelLifecyclePhase::Start, Some(component.name()), "Component failed to start")
                    .with_source(e)
            })?;
        }
        self.started = true;
        log::info!("Component start complete.");
        Ok(())
    }

    /// Shutdown all components in reverse order of initialization.
    pub async fn shutdown(&mut self) -> Result<()> {
        log::info!("Shutting down components...");
        for component in self.components.iter().rev() {
            log::info!("Stopping component: {}", component.name());
            if let Err(e) = component.stop().await {
                log::error!("Error stopping component {}: {}", component.name(), e);
                return Err(Error::lifecycle(
                    KernelLifecyclePhase::Shutdown,
                    Some(component.name()),
                    "Component failed to stop",
                )
                .with_source(e));
            }
        }
        self.initialized = false;
        self.started = false;
        log::info!("Component shutdown complete.");
        Ok(())
    }
}
