//! Path watch multiplexer.
//!
//! Change streams report changes against a directory, not the exact file, so
//! every registration is stored under a canonical directory and delivery
//! fires every watch whose directory is a prefix of the changed directory.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crank_core::config::expand_home;
use crank_core::ConfigError;

use crate::error::{DispatchError, HandlerError};

/// Stream flags reported with a change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchFlags {
    /// The stream coalesced changes; the whole subtree must be rescanned.
    pub must_scan_subdirs: bool,
    /// Events were dropped because we were too slow.
    pub user_dropped: bool,
    /// Events were dropped in the kernel.
    pub kernel_dropped: bool,
}

impl WatchFlags {
    pub fn recursive(&self) -> bool {
        self.must_scan_subdirs || self.user_dropped || self.kernel_dropped
    }
}

/// A raw change reported by a filesystem stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
    pub path: PathBuf,
    pub flags: WatchFlags,
    /// Whether the stream reported `path` as a directory. `None` when it did
    /// not say, in which case the filesystem is consulted.
    pub is_dir: Option<bool>,
}

impl PathEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flags: WatchFlags::default(),
            is_dir: None,
        }
    }

    /// A change to the directory `path` itself.
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            is_dir: Some(true),
            ..Self::new(path)
        }
    }
}

/// What a watch callback sees.
#[derive(Debug, Clone, Copy)]
pub struct PathChange<'a> {
    /// The registered watch directory.
    pub watch: &'a Path,
    /// The directory the change was reported in.
    pub path: &'a Path,
    pub recursive: bool,
}

pub trait WatchCallback: Send {
    fn label(&self) -> &str;

    fn on_change(&mut self, change: &PathChange<'_>) -> Result<(), HandlerError>;
}

/// Counts from one delivery.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub invoked: usize,
    pub failed: usize,
}

/// Canonical directory → callbacks, in registration order.
#[derive(Default)]
pub struct WatchTable {
    watches: BTreeMap<PathBuf, Vec<Box<dyn WatchCallback>>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `path` for `callback`. Returns the directory actually watched:
    /// the canonical form of `path`, or of its parent when `path` is a file.
    pub fn register(
        &mut self,
        path: &Path,
        callback: Box<dyn WatchCallback>,
    ) -> Result<PathBuf, ConfigError> {
        let dir = watch_dir_for(path)?;
        tracing::debug!(path = %dir.display(), callback = callback.label(), "adding watch");
        self.watches.entry(dir.clone()).or_default().push(callback);
        Ok(dir)
    }

    /// Directories to hand to the change stream.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.watches.keys().cloned().collect()
    }

    pub fn callbacks_for(&self, dir: &Path) -> usize {
        self.watches.get(dir).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Run every callback registered under a prefix of the changed directory.
    pub fn deliver(&mut self, event: &PathEvent) -> Delivery {
        if event.flags.user_dropped {
            tracing::error!("we were too slow processing fs events and some events were dropped");
        }
        if event.flags.kernel_dropped {
            tracing::error!("the kernel was too slow processing fs events and some events were dropped");
        }
        let recursive = event.flags.recursive();
        let dir = self.changed_dir(event);

        let mut delivery = Delivery::default();
        for (watch, callbacks) in self
            .watches
            .iter_mut()
            .filter(|(watch, _)| dir.starts_with(watch))
        {
            tracing::debug!(
                watch = %watch.display(),
                path = %dir.display(),
                "processing {} callback(s)",
                callbacks.len(),
            );
            let change = PathChange {
                watch,
                path: &dir,
                recursive,
            };
            for callback in callbacks.iter_mut() {
                delivery.invoked += 1;
                if let Err(source) = callback.on_change(&change) {
                    delivery.failed += 1;
                    let err = DispatchError::Handler {
                        context: callback.label().to_string(),
                        source,
                    };
                    tracing::error!(error = %err, "fs event handler failed");
                }
            }
        }
        delivery
    }

    /// The directory a change is attributed to. A removed watch root no
    /// longer exists on disk but still counts as itself.
    fn changed_dir(&self, event: &PathEvent) -> PathBuf {
        let path = &event.path;
        let is_dir = event
            .is_dir
            .unwrap_or_else(|| path.is_dir() || self.watches.contains_key(path));
        if is_dir {
            return path.to_path_buf();
        }
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf())
    }
}

/// Canonical directory to watch for `path`.
pub fn watch_dir_for(path: &Path) -> Result<PathBuf, ConfigError> {
    let expanded = expand_home(path);
    let canonical = match std::fs::canonicalize(&expanded) {
        Ok(canonical) => canonical,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::WatchPathMissing { path: expanded })
        }
        Err(err) => return Err(ConfigError::Io(err)),
    };
    if canonical.is_dir() {
        return Ok(canonical);
    }
    Ok(canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(canonical))
}
