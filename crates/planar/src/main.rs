//! Planar: job execution coordination and monitoring
//!
//! Main binary with subcommands:
//! - `daemon`: Scheduler, executor, monitor scanner and hook dispatch
//! - `test-hook`: Invoke one hook with the synthetic test context
//! - `check-config`: Validate a configuration file

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use planar_monitor::{
    DirectoryHookLoader, HookDispatcher, HookRegistry, MonitorEvent, MonitorGroup, test_context,
};

mod config;
mod daemon;

use config::PlanarConfig;

#[derive(Parser)]
#[command(name = "planar")]
#[command(about = "Job execution coordination and monitoring", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "PLANAR_CONFIG", default_value = "planar.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon {
        /// Directory for audit logs and the running-executions snapshot
        #[arg(long, env = "PLANAR_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Directory of executable hooks
        #[arg(long, env = "PLANAR_HOOKS_DIR")]
        hooks_dir: Option<PathBuf>,

        /// Environment tag attached to every execution
        #[arg(long, env = "PLANAR_ENVIRONMENT")]
        environment: Option<String>,
    },

    /// Invoke a hook's test entry point with the synthetic context
    TestHook {
        /// Hook name (file stem in the hooks directory)
        hook: String,

        /// Directory of executable hooks
        #[arg(long, env = "PLANAR_HOOKS_DIR")]
        hooks_dir: Option<PathBuf>,

        /// Monitor event id to simulate
        #[arg(long, default_value = "3")]
        event: u32,

        /// Notification group to include in the payload
        #[arg(long)]
        group: Option<String>,

        /// Hook timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Validate the configuration file and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "planar=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            state_dir,
            hooks_dir,
            environment,
        } => {
            let config = PlanarConfig::load(&cli.config)?;
            let options = daemon::DaemonOptions {
                environment: environment
                    .or_else(|| config.environment.clone())
                    .unwrap_or_else(|| "default".to_string()),
                state_dir: state_dir
                    .or_else(|| config.state_dir.clone())
                    .unwrap_or_else(default_state_dir),
                hooks_dir: hooks_dir.or_else(|| config.hooks_dir.clone()),
                config,
            };
            daemon::run(options).await
        }

        Commands::TestHook {
            hook,
            hooks_dir,
            event,
            group,
            timeout,
        } => {
            let config = PlanarConfig::load(&cli.config)?;
            let hooks_dir = hooks_dir
                .or_else(|| config.hooks_dir.clone())
                .ok_or_else(|| miette::miette!("no hooks directory configured"))?;
            run_test_hook(&config, &hooks_dir, &hook, event, group.as_deref(), timeout).await
        }

        Commands::CheckConfig => check_config(&cli.config),
    }
}

/// Default state directory (~/.local/share/planar or ./planar-state).
fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("planar"))
        .unwrap_or_else(|| PathBuf::from("planar-state"))
}

async fn run_test_hook(
    config: &PlanarConfig,
    hooks_dir: &Path,
    hook: &str,
    event: u32,
    group: Option<&str>,
    timeout: u64,
) -> Result<()> {
    let event = MonitorEvent::from_id(event)
        .ok_or_else(|| miette::miette!("unknown monitor event id {}", event))?;
    let group = match group {
        Some(name) => config
            .groups
            .iter()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| miette::miette!("group {} is not configured", name))?,
        None => MonitorGroup {
            name: test_context::TEST_GROUP.to_string(),
            ..MonitorGroup::default()
        },
    };

    let registry = Arc::new(HookRegistry::new(vec![Arc::new(DirectoryHookLoader::new(
        hooks_dir,
    ))]));
    registry.refresh().await;
    let dispatcher = HookDispatcher::new(registry, Duration::from_secs(timeout));

    let payload = test_context::payload(event, hook, group).into_diagnostic()?;
    tracing::info!(hook, event = %event, "invoking hook test entry point");

    dispatcher
        .test(hook, payload)
        .await
        .map_err(|e| miette::miette!("hook {} failed: {}", hook, e))?;
    println!("hook {hook} handled {event}");
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(miette::miette!("config file {} not found", path.display()));
    }
    let config = PlanarConfig::load(path)?;
    println!(
        "{}: {} jobs, {} triggers, {} rules, {} groups",
        path.display(),
        config.jobs.len(),
        config.triggers.len(),
        config.rules.len(),
        config.groups.len()
    );
    Ok(())
}
