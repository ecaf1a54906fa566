//! ironfleet region controller

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use ironfleet_core::observability::{init_tracing, shutdown_tracing, TracingConfig};
use ironfleet_core::version;
use ironfleet_region::observability::init_metrics;
use ironfleet_region::{api, open_store, Region, RegionArgs, RegionConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ironfleet-region")]
#[command(about = "Region controller for the ironfleet bare-metal control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print build information
    Version,
    /// Run the region controller
    Run(RegionArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", version::build_info("ironfleet-region"));
            Ok(())
        }
        Commands::Run(args) => run(RegionConfig::try_from(args)?).await,
    }
}

async fn run(config: RegionConfig) -> anyhow::Result<()> {
    init_tracing(&TracingConfig::from_env("ironfleet-region"))
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    let metrics_state = match init_metrics() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    info!(
        region_id = %config.region_id,
        version = %version::full_version(),
        store = ?config.store,
        "Starting ironfleet-region"
    );

    let store = open_store(&config)
        .await
        .context("failed to open the store")?;
    let rack_listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind rack listener on {}", config.listen_addr))?;
    let http_listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind API on {}", config.http_addr))?;

    let mut region = Region::start(config.clone(), store).await?;
    region.serve(rack_listener);
    info!(rack_addr = %config.listen_addr, api_addr = %config.http_addr, "Accepting racks");

    let app = api::create_router(region.app_state(metrics_state));
    let shutdown = region.shutdown_token();
    axum::serve(http_listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("API server failed")?;

    region.shutdown().await;
    shutdown_tracing();
    Ok(())
}
