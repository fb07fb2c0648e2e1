use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;

use ask_relay::{
    config::ServeArgs,
    events::{init_logging, EventEmitter},
    install::{default_config_path, install_server, uninstall_server, ServerEntry},
    mcp::McpServer,
    service::RelayService,
};

#[derive(Debug, Parser)]
#[command(name = "ask-continue-relay")]
#[command(about = "Relay that hands an agent's turn back to the human in the editor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the MCP tool server on stdio (default).
    Serve(ServeArgs),
    /// Register this binary in an MCP config file.
    Install {
        /// Config to edit; defaults to the Windsurf MCP config.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove this binary's entry from an MCP config file.
    Uninstall {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Install { config } => {
            init_logging(None)?;
            run_install(config)
        }
        Commands::Uninstall { config } => {
            init_logging(None)?;
            run_uninstall(config)
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    init_logging(args.log_level.as_deref())?;
    let events = EventEmitter::new(args.json_events);
    let config = args.relay_config();

    let service = RelayService::start(config, events)
        .await
        .context("failed to start relay service")?;
    tracing::info!(
        target = "ask_relay::service",
        callback_port = service.callback_port(),
        port_dir = %service.port_dir().display(),
        "ask-continue relay ready on stdio"
    );

    McpServer::new(service)
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}

fn resolve_config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => default_config_path().context("could not determine home directory"),
    }
}

fn run_install(config: Option<PathBuf>) -> Result<()> {
    let path = resolve_config_path(config)?;
    let entry = ServerEntry::for_current_exe().context("failed to locate current executable")?;
    let report = install_server(&path, &entry)
        .with_context(|| format!("failed to update {}", path.display()))?;

    if report.skipped > 0 {
        println!("ask-continue already configured in {}", path.display());
    } else {
        println!("ask-continue configured in {}", path.display());
        if let Some(backup) = &report.backup {
            println!("previous config saved to {}", backup.display());
        }
        println!("restart the editor to load the new MCP server");
    }
    Ok(())
}

fn run_uninstall(config: Option<PathBuf>) -> Result<()> {
    let path = resolve_config_path(config)?;
    let removed = uninstall_server(&path)
        .with_context(|| format!("failed to update {}", path.display()))?;

    if removed {
        println!("ask-continue removed from {}", path.display());
    } else {
        println!("ask-continue was not configured in {}", path.display());
    }
    Ok(())
}
