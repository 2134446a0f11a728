//! `crank start|stop|status|install|uninstall|logs`: daemon lifecycle and
//! launchd management.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use crank_core::config::{load_or_init_at, LoadOutcome};
use crank_daemon::paths::{socket_path, stderr_log_path, stdout_log_path};
use crank_daemon::{
    install_launchd, request_status, request_stop, start_blocking, uninstall_launchd,
    DaemonError, DaemonOptions,
};
use crank_dispatch::Subscription;

use super::{config_path, home_dir};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    pub debug: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit the raw status JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only the stderr log file.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn start(config: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let home = home_dir()?;
    let config_path = config_path(config)?;

    match load_or_init_at(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?
    {
        LoadOutcome::Loaded(_) => {}
        LoadOutcome::Created(path) => bail!(
            "no configuration found; wrote an example to {}. Edit it and run `crank start` again",
            path.display()
        ),
    }

    start_blocking(DaemonOptions {
        home,
        config_path,
        debug: args.debug,
    })
    .context("daemon exited with error")
}

pub fn stop() -> Result<()> {
    let home = home_dir()?;
    match request_stop(&home) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

#[derive(Tabled)]
struct SubscriptionRow {
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "key")]
    key: String,
    #[tabled(rename = "handler")]
    handler: String,
    #[tabled(rename = "armed")]
    armed: u32,
}

impl From<Subscription> for SubscriptionRow {
    fn from(s: Subscription) -> Self {
        Self {
            source: s.source.section().to_string(),
            key: s.key.to_string(),
            handler: s.handler,
            armed: s.armed,
        }
    }
}

/// The parts of the status payload rendered as text.
#[derive(Deserialize)]
struct StatusView {
    pid: u32,
    config: String,
    stats: serde_json::Value,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

pub(crate) fn print_subscriptions(subscriptions: Vec<Subscription>) {
    if subscriptions.is_empty() {
        println!("{}", "no subscriptions".bright_black());
        return;
    }
    let rows: Vec<SubscriptionRow> = subscriptions.into_iter().map(Into::into).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

pub fn status(args: StatusArgs) -> Result<()> {
    let home = home_dir()?;
    let status = match request_status(&home) {
        Ok(status) => status,
        Err(DaemonError::DaemonNotRunning { .. }) => {
            if args.json {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            } else {
                println!("{} crankd is not running", "■".red().bold());
            }
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to query daemon status"),
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("failed to render daemon status JSON")?
        );
        return Ok(());
    }

    let view: StatusView =
        serde_json::from_value(status).context("daemon returned an unexpected status")?;
    println!(
        "{} crankd running (pid {})",
        "■".green().bold(),
        view.pid
    );
    println!("  config: {}", view.config);
    println!(
        "  events: {}  handled: {}  unhandled: {}  failed: {}",
        view.stats["events"], view.stats["handled"], view.stats["unhandled"], view.stats["failed"]
    );
    print_subscriptions(view.subscriptions);
    Ok(())
}

pub fn install(config: Option<PathBuf>) -> Result<()> {
    let home = home_dir()?;
    let config_path = config_path(config)?;
    let binary = std::env::current_exe().context("could not locate the crank executable")?;
    let path = install_launchd(&home, &binary, &config_path)
        .context("failed to install launchd service")?;
    println!("installed launchd service: {}", path.display());
    Ok(())
}

pub fn uninstall() -> Result<()> {
    let home = home_dir()?;
    uninstall_launchd(&home).context("failed to uninstall launchd service")?;
    println!("uninstalled launchd service");
    Ok(())
}

pub fn logs(args: LogsArgs) -> Result<()> {
    let home = home_dir()?;
    if !args.stderr_only {
        print_tail(&stdout_log_path(&home), args.lines)
            .context("failed to read daemon stdout log")?;
    }
    print_tail(&stderr_log_path(&home), args.lines).context("failed to read daemon stderr log")
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
