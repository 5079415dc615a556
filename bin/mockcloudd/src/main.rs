//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the mock cloud daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mockcloud_api::{spawn_api_server, ApiServer, ApiState};
use mockcloud_common::config::AppConfig;
use mockcloud_common::logging::init_tracing;
use mockcloud_common::VERSION;
use mockcloud_core::ControlPlane;
use mockcloud_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = VERSION,
    about = "Mock cloud control plane daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "ADDR",
        env = "MOCKCLOUD_LISTEN",
        help = "Override the API listen address"
    )]
    listen: Option<SocketAddr>,

    #[arg(
        long,
        value_name = "P",
        help = "Override the simulated failure probability (0.0 to 1.0)"
    )]
    failure_probability: Option<f64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the control plane and REST API")]
    Run,
    #[command(about = "Load and validate the configuration, then print it")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/mockcloud.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();

    if let Some(listen) = cli.listen {
        config.api.listen = listen;
    }
    if let Some(probability) = cli.failure_probability {
        config.worker.failure_probability = probability;
    }
    config
        .validate()
        .context("configuration rejected after command-line overrides")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            let source = loaded
                .source
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string());
            println!("configuration OK ({source})");
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run => {
            init_tracing("mockcloudd", &config.logging)?;
            match &loaded.source {
                Some(path) => info!(config_path = %path.display(), version = VERSION, "configuration loaded"),
                None => info!(version = VERSION, "no configuration file found; running with defaults"),
            }

            let registry = new_registry();
            let daemon_metrics = DaemonMetrics::new(registry.clone())?;
            daemon_metrics.observe_config_load(load_duration.as_secs_f64());
            daemon_metrics.inc_start();
            daemon_metrics.set_build_info(VERSION);

            run_daemon(config, registry).await
        }
    }
}

async fn run_daemon(config: AppConfig, registry: SharedRegistry) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let api_settings = config.api.clone();

    let metrics_server = if metrics_settings.enabled {
        info!(address = %metrics_settings.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), metrics_settings.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let handle = ControlPlane::new(config, Some(registry)).start().await?;

    let mut api_server: Option<ApiServer> = None;
    if api_settings.enabled {
        let state = ApiState::new(handle.service());
        let server = spawn_api_server(state, api_settings.listen)
            .context("failed to start api server")?;
        info!(address = %server.addr(), "api server listening");
        api_server = Some(server);
    } else {
        warn!("api server disabled by configuration; jobs can only be resumed from the journal");
    }

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    handle.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}
