//! crank: run shell commands and handlers when the system changes.
//!
//! # Usage
//!
//! ```text
//! crank [--config <path>] start [--debug]
//! crank stop | status [--json]
//! crank [--config <path>] check [--json]
//! crank list-events
//! crank post <source> <key> [--info <json> | --user-info <json>]
//! crank [--config <path>] install | uninstall
//! crank logs [--lines N] [--stderr-only]
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    check::CheckArgs,
    daemon::{LogsArgs, StartArgs, StatusArgs},
    events::PostArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "crank",
    version,
    about = "Run commands and handlers in response to system events",
    long_about = None,
)]
struct Cli {
    /// Configuration file (default: ~/.crank/crank.yaml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground.
    Start(StartArgs),

    /// Ask the running daemon to shut down.
    Stop,

    /// Show the running daemon's subscriptions and counters.
    Status(StatusArgs),

    /// Validate the configuration and list what it subscribes to.
    Check(CheckArgs),

    /// List event sources and the standard workspace notifications.
    ListEvents,

    /// Inject an event into the running daemon.
    Post(PostArgs),

    /// Install and bootstrap the launchd agent.
    Install,

    /// Boot out and remove the launchd agent.
    Uninstall,

    /// Print recent daemon log lines.
    Logs(LogsArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config;
    match cli.command {
        Commands::Start(args) => commands::daemon::start(config, args),
        Commands::Stop => commands::daemon::stop(),
        Commands::Status(args) => commands::daemon::status(args),
        Commands::Check(args) => args.run(config),
        Commands::ListEvents => commands::events::list_events(),
        Commands::Post(args) => args.run(),
        Commands::Install => commands::daemon::install(config),
        Commands::Uninstall => commands::daemon::uninstall(),
        Commands::Logs(args) => commands::daemon::logs(args),
    }
}
