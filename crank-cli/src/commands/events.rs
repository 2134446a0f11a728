//! `crank list-events` and `crank post`.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{Map, Value};

use crank_core::types::STANDARD_WORKSPACE_NOTIFICATIONS;
use crank_core::{Payload, SourceKind};
use crank_daemon::request_post;
use crank_dispatch::RawEvent;

use super::home_dir;

pub fn list_events() -> Result<()> {
    println!("{}", "Event sources (config sections):".bold());
    for source in SourceKind::ALL {
        let mut notes = Vec::new();
        if source.supports_patterns() {
            notes.push("regexp: keys");
        }
        if source.supports_class() {
            notes.push("class handlers");
        }
        if notes.is_empty() {
            println!("  {}", source.section());
        } else {
            println!("  {} ({})", source.section(), notes.join(", "));
        }
    }

    println!();
    println!("{}", "Standard workspace notifications:".bold());
    for name in STANDARD_WORKSPACE_NOTIFICATIONS {
        println!("  {name}");
    }
    Ok(())
}

/// Arguments for `crank post`.
#[derive(Args, Debug)]
pub struct PostArgs {
    /// Event source, e.g. `dynamic_store` or `workspace`.
    pub source: SourceKind,

    /// Event key as the source would report it.
    pub key: String,

    /// Dynamic-store value, as JSON.
    #[arg(long, value_name = "JSON", conflicts_with = "user_info")]
    pub info: Option<String>,

    /// Notification user-info dictionary, as a JSON object.
    #[arg(long, value_name = "JSON")]
    pub user_info: Option<String>,
}

impl PostArgs {
    pub fn run(self) -> Result<()> {
        let payload = self.payload()?;
        let home = home_dir()?;
        let report = request_post(&home, RawEvent::new(self.source, self.key.as_str(), payload))
            .context("failed to post event to daemon")?;

        if report.suppressed {
            println!("{} repeated location fix suppressed", "■".bright_black().bold());
        } else if report.is_unhandled() {
            println!("{} no handler for {}", "■".yellow().bold(), self.key);
        } else {
            println!(
                "{} {} handler(s) invoked, {} failed",
                "■".green().bold(),
                report.matched,
                report.failed
            );
        }
        Ok(())
    }

    fn payload(&self) -> Result<Payload> {
        if let Some(info) = &self.info {
            let info: Value = serde_json::from_str(info).context("--info is not valid JSON")?;
            return Ok(Payload::Info { info });
        }
        if let Some(user_info) = &self.user_info {
            let value: Value =
                serde_json::from_str(user_info).context("--user-info is not valid JSON")?;
            let Value::Object(user_info) = value else {
                bail!("--user-info must be a JSON object");
            };
            return Ok(Payload::UserInfo { user_info });
        }
        Ok(Payload::None)
    }
}
