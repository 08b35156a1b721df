//! SDS Controller
//!
//! Control plane daemon for DRBD-replicated block storage. Wires the
//! catalog, node registry, pool manager, resource engine, HA controller
//! and gateway bridge together, then keeps node health current until
//! shutdown. The outward RPC layer attaches to the [`ControlSurface`]
//! this binary constructs.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sds_controller::{
    Catalog, CatalogConfig, ControlSurface, ExecutorConfig, FileCatalog, GatewayBridge,
    HaController, LocalIdentity, NodeRegistry, PoolManager, RemoteExecutor, ResourceEngine,
    SystemShell, SystemShellConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SDS Controller - control plane for DRBD-replicated block storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the on-disk state file
    #[arg(long, env = "STATE_FILE", default_value = "/var/lib/sds-controller/state.db")]
    state_file: PathBuf,

    /// User for SSH sessions to storage nodes
    #[arg(long, env = "SSH_USER", default_value = "root")]
    ssh_user: String,

    /// Maximum concurrent target hosts per fan-out
    #[arg(long, env = "EXEC_PARALLEL", default_value = "10")]
    exec_parallel: usize,

    /// Per-host command deadline in seconds
    #[arg(long, env = "EXEC_TIMEOUT", default_value = "30")]
    exec_timeout_secs: u64,

    /// Node health probe interval in seconds (0 disables probing)
    #[arg(long, env = "HEALTH_INTERVAL", default_value = "60")]
    health_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting SDS Controller");
    info!("  Version: {}", sds_controller::VERSION);
    info!("  State file: {}", args.state_file.display());
    info!("  SSH user: {}", args.ssh_user);
    info!("  Fan-out parallelism: {}", args.exec_parallel);

    // Persistent catalog
    let store = FileCatalog::open(CatalogConfig {
        path: args.state_file.clone(),
        open_timeout: Duration::from_secs(10),
    })
    .await
    .context("opening state file")?;
    let catalog = Catalog::new(store);

    // Remote executor over the system shell / SSH
    let transport = Arc::new(SystemShell::new(SystemShellConfig {
        ssh_user: args.ssh_user.clone(),
        ..Default::default()
    }));
    let identity = LocalIdentity::detect();
    info!("  Local identity: {}", identity.hostname());
    let executor = RemoteExecutor::new(
        transport,
        identity,
        ExecutorConfig {
            parallel: args.exec_parallel,
            default_timeout: Duration::from_secs(args.exec_timeout_secs),
        },
    );

    // Managers, dependency-injected
    let registry = NodeRegistry::new(executor.clone(), catalog.clone());
    let known = registry.load().await.context("loading node registry")?;
    info!("  Known nodes: {known}");

    let pools = PoolManager::new(executor.clone(), registry.clone(), catalog.clone());
    let engine = ResourceEngine::new(executor.clone(), registry.clone(), catalog.clone());
    let ha = HaController::new(executor.clone(), engine.clone(), catalog.clone());
    let gateways = GatewayBridge::new(executor.clone(), engine.clone(), catalog.clone());

    let surface = ControlSurface::new(
        registry.clone(),
        pools,
        engine,
        ha,
        gateways,
        catalog.clone(),
    );

    // Background health probing keeps node states current for the
    // status queries the surface serves.
    if args.health_interval_secs > 0 {
        let registry = registry.clone();
        let interval = Duration::from_secs(args.health_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for node in registry.list() {
                    if let Err(err) = registry.health(&node.address).await {
                        warn!(node = %node.address, "health probe error: {err}");
                    }
                }
            }
        });
    }

    info!("Controller ready, {} resources in catalog", surface.resource_list().await?.len());

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Controller shutdown complete");
    drop(surface);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
