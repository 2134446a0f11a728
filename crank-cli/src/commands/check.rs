//! `crank check`: resolve every handler without starting the daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use crank_core::config::load_at;
use crank_dispatch::{Catalog, Resolver, Router, ShellExecutor};

use super::config_path;
use super::daemon::print_subscriptions;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Emit the subscription table as JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckArgs {
    pub fn run(self, config: Option<PathBuf>) -> Result<()> {
        let path = config_path(config)?;
        let config =
            load_at(&path).with_context(|| format!("failed to load {}", path.display()))?;

        let mut resolver = Resolver::new(Catalog::with_builtins(), Arc::new(ShellExecutor));
        let router = Router::from_config(&config, &mut resolver)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(router.subscriptions())
                    .context("failed to render subscriptions JSON")?
            );
            return Ok(());
        }

        println!(
            "{} {} is valid ({} subscription(s), {} watch path(s))",
            "✓".green().bold(),
            path.display(),
            router.subscriptions().len(),
            router.watch_paths().len()
        );
        print_subscriptions(router.subscriptions().iter().cloned().collect());
        Ok(())
    }
}
