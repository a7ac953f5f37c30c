//! love-me daemon binary.
//!
//! Starts the WebSocket gateway over the workflow engine, email pipeline,
//! and turn coordinator (§1). No REST surface, no auth: a trusted local
//! client is assumed.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use love_me_core::config::Config;
use tracing_subscriber::EnvFilter;

/// love-me — a personal automation daemon with a workflow engine, email
/// pipeline, and LLM-driven turn coordinator behind a local WebSocket gateway.
#[derive(Parser)]
#[command(name = "love-me-server", version, about)]
struct Cli {
    /// Directory under which all persisted state lives.
    #[arg(long)]
    home: Option<PathBuf>,

    /// Bind host. Overrides config and defaults to loopback.
    #[arg(long)]
    host: Option<String>,

    /// Bind port. Overrides config.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.home.as_deref())?;
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    love_me_server::run(config).await
}
