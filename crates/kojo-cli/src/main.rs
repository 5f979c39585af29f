//! Kojo CLI
//!
//! Host process that lets mobile browsers drive interactive terminal
//! programs running on this workstation.

mod commands;
mod daemon;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::error;

#[derive(Parser)]
#[command(name = "kojo")]
#[command(author, version, about = "Kojo - drive terminal sessions from your phone", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// List known sessions
    Sessions,

    /// Diagnose environment and tool availability
    Doctor,
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon
    Start,
    /// Stop the daemon
    Stop,
    /// Restart the daemon
    Restart,
    /// Check daemon status
    Status,
    /// View daemon logs
    Logs {
        /// Follow logs
        #[arg(short, long)]
        follow: bool,
    },
    /// Internal command to run the daemon process
    #[clap(hide = true)]
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The daemon process sets up its own file logger.
    let is_daemon_run = matches!(
        cli.command,
        Commands::Daemon {
            action: DaemonAction::Run
        }
    );

    if !is_daemon_run {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(if cli.verbose {
                "kojo_cli=debug,kojo_sessions=debug,kojo_core=debug"
            } else {
                "kojo_cli=info"
            })
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let result = match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start => commands::daemon::start().await,
            DaemonAction::Stop => commands::daemon::stop().await,
            DaemonAction::Restart => commands::daemon::restart().await,
            DaemonAction::Status => commands::daemon::status().await,
            DaemonAction::Logs { follow } => commands::daemon::logs(follow).await,
            DaemonAction::Run => commands::daemon::run().await,
        },
        Commands::Sessions => commands::sessions::run().await,
        Commands::Doctor => commands::doctor::run().await,
    };

    if let Err(ref e) = result {
        error!("Command failed: {}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    result
}
