pub mod check;
pub mod daemon;
pub mod events;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crank_core::config::{default_config_path_at, expand_home};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// `--config`, with `~` expanded, or `~/.crank/crank.yaml`.
pub(crate) fn config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(expand_home(&path)),
        None => Ok(default_config_path_at(&home_dir()?)),
    }
}
