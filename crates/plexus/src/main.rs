mod units;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};
use plexus_core::kernel::constants;
use plexus_core::kernel::{Application, Result};
use plexus_core::plugin_system::{LoadReport, PluginManager};
use plexus_core::ManagerConfig;
use tracing_subscriber::EnvFilter;

use crate::units::LoggingUnit;

/// Plexus: plugin dependency resolution and lifecycle management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Manager configuration file (JSON, YAML or TOML); defaults to ./plexus.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the load order and the blocked plugins of a manifest
    Plan {
        /// Descriptor manifest
        manifest: PathBuf,
    },
    /// Activate every eager plugin of a manifest, print their status and shut down
    Start {
        /// Descriptor manifest
        manifest: PathBuf,
        /// Print the load report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env(constants::LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let result = match args.command {
        Commands::Plan { manifest } => plan(args.config.as_deref(), &manifest).await,
        Commands::Start { manifest, json } => start(args.config.as_deref(), &manifest, json).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ManagerConfig> {
    match path {
        Some(path) => Ok(ManagerConfig::from_file(path)?),
        None => {
            let default = Path::new(constants::DEFAULT_CONFIG_FILE);
            if default.is_file() {
                info!("Using {}", default.display());
                Ok(ManagerConfig::from_file(default)?)
            } else {
                Ok(ManagerConfig::default())
            }
        }
    }
}

async fn application(config: Option<&Path>, manifest: &Path) -> Result<Application> {
    let config = load_config(config)?.with_manifest(manifest);
    let mut app = Application::with_config(config)?;
    app.initialize().await?;
    Ok(app)
}

async fn plan(config: Option<&Path>, manifest: &Path) -> Result<()> {
    let app = application(config, manifest).await?;
    let graph = app.plugin_manager().graph();

    let eager = graph.load_order();
    println!("Load order:");
    if eager.is_empty() {
        println!("  (none)");
    }
    for (position, id) in eager.iter().enumerate() {
        if let Some(node) = graph.node(id) {
            println!("  {}. {}", position + 1, node.descriptor());
        }
    }

    let lazy: Vec<&str> = graph
        .topological_order()
        .iter()
        .map(String::as_str)
        .filter(|id| !eager.contains(id))
        .collect();
    if !lazy.is_empty() {
        println!("Lazy:");
        for id in lazy {
            if let Some(node) = graph.node(id) {
                println!("  - {}", node.descriptor());
            }
        }
    }

    let blocked = graph.blocked_ids();
    if !blocked.is_empty() {
        println!("Blocked:");
        for id in blocked {
            let reason = graph
                .node(id)
                .and_then(|node| node.blocked_reason())
                .map(ToString::to_string)
                .unwrap_or_default();
            println!("  - {}: {}", id, reason);
        }
    }

    print_conditions(&app.plugin_manager().report());
    Ok(())
}

async fn start(config: Option<&Path>, manifest: &Path, json: bool) -> Result<()> {
    let mut app = application(config, manifest).await?;

    let manager = app.plugin_manager();
    let units: BTreeSet<String> = manager
        .descriptors()
        .iter()
        .flat_map(|descriptor| descriptor.code_units().to_vec())
        .collect();
    for unit in &units {
        if !manager.has_unit(unit) {
            manager.register_unit(unit, LoggingUnit::build);
        }
    }

    app.start().await?;
    let report = app.plugin_manager().report();
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => eprintln!("Failed to render report: {}", e),
        }
    } else {
        print_status(&report);
        print_conditions(&report);
    }

    app.shutdown().await
}

fn print_status(report: &LoadReport) {
    let width = report.plugins.iter().map(|status| status.id.len()).max().unwrap_or(2).max(2);
    println!("{:<width$}  {:<10}  {:<9}  REASON", "ID", "VERSION", "STATE", width = width);
    for status in &report.plugins {
        println!(
            "{:<width$}  {:<10}  {:<9}  {}",
            status.id,
            status.version,
            status.state.to_string(),
            status.reason.as_deref().unwrap_or("-"),
            width = width
        );
    }
}

fn print_conditions(report: &LoadReport) {
    if report.conditions.is_empty() {
        return;
    }
    println!("Conditions:");
    for condition in &report.conditions {
        println!("  {}", condition);
    }
}
