/// love-me CLI - personal automation daemon.
///
/// Entry point for the `love-me` binary. Parses CLI arguments, initializes
/// logging, and dispatches to subcommand handlers.
use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use love_me_core::config::Config;
use tracing_subscriber::EnvFilter;

/// Personal automation daemon: workflow engine, email pipeline, and an
/// LLM-driven turn coordinator behind a local WebSocket gateway.
#[derive(Parser)]
#[command(name = "love-me")]
#[command(version)]
#[command(about = "Personal automation daemon")]
#[command(after_help = "\
Quick start:
  1. love-me init     — scaffold a config file and home directory
  2. love-me run      — start the daemon")]
struct Cli {
    /// Directory under which all persisted state lives.
    #[arg(short = 'H', long, global = true)]
    home: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Scaffold a default config.toml and home directory
    Init(InitArgs),
    /// Start the daemon and its WebSocket gateway
    Run(RunArgs),
}

#[derive(clap::Args)]
struct InitArgs {
    /// Overwrite an existing config.toml
    #[arg(long)]
    force: bool,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Bind host. Overrides config and defaults to loopback.
    #[arg(long)]
    host: Option<String>,

    /// Bind port. Overrides config.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose/--quiet flags > default (warn).
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("love_me=debug,love_me_core=debug,love_me_server=debug,info")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::new("love_me=info,love_me_core=info,love_me_server=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .compact()
        .init();

    match cli.command {
        Commands::Init(args) => init(cli.home, args).await,
        Commands::Run(args) => run(cli.home, args).await,
    }
}

async fn init(home: Option<PathBuf>, args: InitArgs) -> anyhow::Result<()> {
    let mut config = Config::load(home.as_deref())?;
    let path = config.home_dir.join("config.toml");

    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists. Re-run with --force to overwrite it.",
            path.display()
        );
    }

    std::fs::create_dir_all(&config.home_dir)?;
    config.save()?;

    if std::io::stdout().is_terminal() {
        println!("Wrote {}", path.display());
        println!("Edit it to add an LLM API key and email credentials, then run `love-me run`.");
    }
    Ok(())
}

async fn run(home: Option<PathBuf>, args: RunArgs) -> anyhow::Result<()> {
    let mut config = Config::load(home.as_deref())?;
    if let Some(host) = args.host {
        config.gateway.host = host;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    love_me_server::run(config).await
}
