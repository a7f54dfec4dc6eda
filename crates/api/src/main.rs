//! OBD Diagnostic Core - Main Entry Point

use api::{init_logging, run_server, AppConfig, SourceKind};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "obd-core", version, about = "OBD-II diagnostic telemetry server")]
struct Args {
    /// Config file (defaults to $OBD_CORE_CONFIG or ./obd-core.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,

    /// Serial port of the ELM327 adapter
    #[arg(short, long)]
    port: Option<String>,

    /// Use the simulated vehicle instead of a serial adapter
    #[arg(long)]
    simulated: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.source.port = Some(port);
    }
    if args.simulated {
        config.source.kind = SourceKind::Simulated;
    }

    init_logging(&config.log).map_err(|e| anyhow::anyhow!(e))?;

    info!("=== OBD Diagnostic Core v{} ===", env!("CARGO_PKG_VERSION"));
    info!(source = ?config.source.kind, "Telemetry source configured");

    run_server(config).await
}
