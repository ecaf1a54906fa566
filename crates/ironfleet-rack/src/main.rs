//! ironfleet rack controller

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use ironfleet_core::models::{ControllerIdentity, ControllerKind};
use ironfleet_core::observability::{init_tracing, shutdown_tracing, TracingConfig};
use ironfleet_core::version::{self, PROTOCOL_REVISION};
use ironfleet_rack::capability::{ExecPowerDriver, ExecScriptRunner, PowerControl, ScriptControl};
use ironfleet_rack::observability::init_metrics;
use ironfleet_rack::session::TcpConnector;
use ironfleet_rack::{Agent, RackArgs, RackConfig, RackSession, ServiceHost, SessionDeps};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "ironfleet-rack")]
#[command(about = "Rack controller for the ironfleet bare-metal control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print build information
    Version,
    /// Run the rack controller
    Run(RackArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", version::build_info("ironfleet-rack"));
            Ok(())
        }
        Commands::Run(args) => run(RackConfig::try_from(args)?).await,
    }
}

async fn run(config: RackConfig) -> anyhow::Result<()> {
    init_tracing(&TracingConfig::from_env("ironfleet-rack"))
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    init_metrics(config.metrics_addr)
        .map_err(|e| anyhow::anyhow!("failed to initialize metrics: {e}"))?;

    info!(
        rack_id = %config.rack_id,
        rack_name = %config.rack_name,
        version = %version::full_version(),
        segments = config.segments.len(),
        "Starting ironfleet-rack"
    );

    let local = ControllerIdentity {
        id: config.rack_id,
        kind: ControllerKind::Rack,
        name: config.rack_name.clone(),
        started_at: Utc::now(),
        version: version::VERSION.to_string(),
        protocol: PROTOCOL_REVISION,
        segments: config.segments.clone(),
    };

    let power = PowerControl::new(
        Arc::new(ExecPowerDriver::new(&config.power_command)),
        config.power_policy,
    );
    let scripts = ScriptControl::new(
        Arc::new(ExecScriptRunner::new(&config.script_command)),
        config.script_policy,
    );
    let services = Arc::new(ServiceHost::new(&config.segments));
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(
        power,
        scripts,
        Arc::clone(&services),
        config.journal_capacity,
        outbox_tx,
    ));

    let session = RackSession::start(
        config.session.clone(),
        SessionDeps {
            local,
            connector: Arc::new(TcpConnector),
            handler: agent,
            services,
            outbox: outbox_rx,
        },
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    session.shutdown().await;
    shutdown_tracing();
    Ok(())
}
