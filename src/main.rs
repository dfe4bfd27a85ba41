//! fleetguard - resilience layer for a fleet of service instances
//!
//! Usage:
//!     fleetguard --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use fleetguard::config::{load_config, Config, ConfigWatcher, ReloadCallback};
use fleetguard::metrics::MetricsServer;
use fleetguard::state::AppState;
use fleetguard::util::init_logging;

/// Circuit breaking, load balancing and health checking for service fleets.
#[derive(Parser, Debug)]
#[command(name = "fleetguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format)
        .context("failed to initialize logging")?;

    if cli.validate {
        info!("configuration is valid");
        println!("Configuration is valid.");
        println!("  Services: {}", config.services.len());
        for service in &config.services {
            println!(
                "    - {} [{:?}] instances={} health_check={} scaling_rules={}",
                service.name,
                service.strategy,
                service.instances.len(),
                service.health_check.is_some(),
                service.scaling_rules.len()
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        services = config.services.len(),
        "fleetguard starting"
    );

    for service in &config.services {
        info!(
            name = %service.name,
            strategy = ?service.strategy,
            instances = service.instances.len(),
            health_check = service.health_check.is_some(),
            "configured service"
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(cli.config, config))
}

async fn run(config_path: PathBuf, config: Config) -> Result<()> {
    let metrics_config = config.global.metrics.clone();
    let state = AppState::new(config);
    state.apply_config().await;

    let mut handles = Vec::new();

    if metrics_config.enabled {
        let server = MetricsServer::new(metrics_config.address, metrics_config.path, state.clone());
        let shutdown = state.shutdown().subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!(error = %e, "metrics server failed");
            }
        }));
    }

    let reload_state = state.clone();
    let on_reload: ReloadCallback = Box::new(move |config| {
        let state = reload_state.clone();
        Box::pin(async move { state.reload(config).await })
    });
    let watcher = ConfigWatcher::new(config_path, on_reload);
    let shutdown = state.shutdown().subscribe();
    handles.push(tokio::spawn(watcher.run(shutdown)));

    info!(
        services = state.balancers().len(),
        "fleetguard is running, press Ctrl+C to stop"
    );

    state.shutdown().shutdown_on_ctrl_c().await;
    state.shutdown_all().await;

    for handle in handles {
        let _ = handle.await;
    }

    info!("fleetguard shut down complete");
    Ok(())
}
