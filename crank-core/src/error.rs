//! Error types for crank-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EventKey, SourceKind};

/// Everything that makes a configuration unusable. All of these are fatal at
/// daemon startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load. Includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`, so `~/.crank/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The config file did not exist at the expected path.
    #[error("config not found at {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("{key}: handler must have a command, function, method, process or class")]
    NoHandlerMode { key: EventKey },

    #[error("{key}: handler has more than one of {modes}; exactly one is allowed")]
    ConflictingHandlerModes { key: EventKey, modes: String },

    #[error("{key}: class handlers are only supported for workspace and distributed notifications, not {section}")]
    ClassNotAllowed { key: EventKey, section: SourceKind },

    #[error("unable to create a callable object for '{name}': {reason}")]
    Unresolvable { name: String, reason: String },

    #[error("{key}: handler class {class} must define a {method} method")]
    MissingMethod {
        key: EventKey,
        class: String,
        method: String,
    },

    #[error("{key}: invalid regular expression: {reason}")]
    InvalidPattern { key: EventKey, reason: String },

    #[error("cannot watch {path}: path does not exist")]
    WatchPathMissing { path: PathBuf },
}
