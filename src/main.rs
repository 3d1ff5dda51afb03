//! Fabric entry point.
//!
//! Loads the TOML configuration, initialises logging and serves the HTTP
//! surface until SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fabric_common::ConfigFile;
use fabric_server::FabricServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Multi-tenant WebAssembly plugin execution fabric.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, env = "FABRIC_CONFIG")]
    config: Option<PathBuf>,

    /// Override `server.bind_addr`.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,fabric=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    if let Some(bind) = cli.bind {
        file.server.bind_addr = bind.to_string();
    }
    let server = FabricServer::from_config(&file).context("Failed to build the fabric")?;

    info!(
        config = ?cli.config,
        bind_addr = %server.config().bind_addr,
        source = ?file.runtime.source.kind,
        auth = file.runtime.auth.enabled,
        workflows = file.workflows.len(),
        "Configuration loaded"
    );
    info!("Available endpoints:");
    info!("  POST /name/:ident/:namespace/:name     - Run a module");
    info!("  POST /workflow/:ident/:namespace/:name - Run a workflow");
    info!("  POST /ref/:ref                         - Run a module by ref");
    info!("  POST /exec                             - Run an exec request");
    info!("  GET  /health                           - Health check");
    info!("  GET  /ready                            - Readiness check");

    server.run().await?;

    Ok(())
}
