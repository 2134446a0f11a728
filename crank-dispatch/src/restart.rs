//! Restart-on-change for the daemon's own files.
//!
//! Change streams watch directories, so a [`RestartWatcher`] re-stats its file
//! on every event in that directory and only restarts when the modification
//! time actually moved.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crank_core::ConfigError;

use crate::error::HandlerError;
use crate::watch::{PathChange, WatchCallback, WatchTable};

/// Performs a full process restart.
pub trait Restarter: Send + Sync {
    /// Restart the process. A real implementation does not return on success.
    fn restart(&self, reason: &str);
}

/// Re-executes `program` with `args`, replacing the current process image.
#[derive(Debug, Clone)]
pub struct ExecRestarter {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecRestarter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl Restarter for ExecRestarter {
    fn restart(&self, reason: &str) {
        tracing::info!(reason, program = %self.program.display(), "restarting");
        let err = exec(&self.program, &self.args);
        tracing::error!(error = %err, program = %self.program.display(), "restart failed");
    }
}

#[cfg(unix)]
fn exec(program: &Path, args: &[OsString]) -> std::io::Error {
    use std::os::unix::process::CommandExt;
    std::process::Command::new(program).args(args).exec()
}

#[cfg(not(unix))]
fn exec(program: &Path, args: &[OsString]) -> std::io::Error {
    match std::process::Command::new(program).args(args).spawn() {
        Ok(_) => std::process::exit(0),
        Err(err) => err,
    }
}

/// Restarts the process once when `file`'s modification time changes.
pub struct RestartWatcher {
    file: PathBuf,
    original: SystemTime,
    reason: String,
    restarter: Arc<dyn Restarter>,
    fired: bool,
}

impl RestartWatcher {
    /// Snapshot `file`'s mtime. A missing file is replaced by its nearest
    /// existing ancestor.
    pub fn new(
        file: &Path,
        reason: impl Into<String>,
        restarter: Arc<dyn Restarter>,
    ) -> Result<Self, ConfigError> {
        let file = nearest_existing(file)?;
        let original = std::fs::metadata(&file)?.modified()?;
        Ok(Self {
            file,
            original,
            reason: reason.into(),
            restarter,
            fired: false,
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Re-stat the file and restart if it changed. Returns whether a restart
    /// was issued by this call.
    pub fn check(&mut self) -> bool {
        if self.fired {
            return false;
        }
        let reason = match std::fs::metadata(&self.file).and_then(|meta| meta.modified()) {
            Ok(modified) if modified == self.original => return false,
            Ok(_) => self.reason.clone(),
            Err(err) => format!("exception while checking {}: {err}", self.file.display()),
        };
        self.fired = true;
        self.restarter.restart(&reason);
        true
    }
}

impl WatchCallback for RestartWatcher {
    fn label(&self) -> &str {
        &self.reason
    }

    fn on_change(&mut self, _change: &PathChange<'_>) -> Result<(), HandlerError> {
        self.check();
        Ok(())
    }
}

/// Watch `file` and restart through `restarter` when it changes.
pub fn add_conditional_restart(
    table: &mut WatchTable,
    file: &Path,
    reason: impl Into<String>,
    restarter: Arc<dyn Restarter>,
) -> Result<PathBuf, ConfigError> {
    let watcher = RestartWatcher::new(file, reason, restarter)?;
    let file = watcher.file().to_path_buf();
    table.register(&file, Box::new(watcher))
}

fn nearest_existing(file: &Path) -> Result<PathBuf, ConfigError> {
    let mut current = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()?.join(file)
    };
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => {
                return Err(ConfigError::WatchPathMissing {
                    path: file.to_path_buf(),
                })
            }
        }
    }
    Ok(std::fs::canonicalize(&current)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::PathEvent;
    use filetime::FileTime;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingRestarter(Mutex<Vec<String>>);

    impl Restarter for CountingRestarter {
        fn restart(&self, reason: &str) {
            self.0.lock().expect("lock").push(reason.to_string());
        }
    }

    fn bump_mtime(path: &Path) {
        let meta = std::fs::metadata(path).expect("metadata");
        let mtime = FileTime::from_last_modification_time(&meta);
        let later = FileTime::from_unix_time(mtime.unix_seconds() + 10, mtime.nanoseconds());
        filetime::set_file_mtime(path, later).expect("set mtime");
    }

    #[test]
    fn unchanged_mtime_never_restarts() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("crank.yaml");
        std::fs::write(&file, "a").expect("write");
        let restarter = Arc::new(CountingRestarter::default());

        let mut watcher =
            RestartWatcher::new(&file, "config changed", restarter.clone()).expect("watcher");
        for _ in 0..5 {
            assert!(!watcher.check());
        }
        assert!(restarter.0.lock().expect("lock").is_empty());
    }

    #[test]
    fn changed_mtime_restarts_exactly_once() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("crank.yaml");
        std::fs::write(&file, "a").expect("write");
        let restarter = Arc::new(CountingRestarter::default());

        let mut table = WatchTable::new();
        add_conditional_restart(&mut table, &file, "config changed", restarter.clone())
            .expect("register");

        bump_mtime(&file);
        let canonical = std::fs::canonicalize(&file).expect("canonical");
        table.deliver(&PathEvent::new(canonical.clone()));
        table.deliver(&PathEvent::new(canonical));

        assert_eq!(*restarter.0.lock().expect("lock"), vec!["config changed".to_string()]);
    }

    #[test]
    fn vanished_file_restarts_with_error_reason() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("crank.yaml");
        std::fs::write(&file, "a").expect("write");
        let restarter = Arc::new(CountingRestarter::default());

        let mut watcher =
            RestartWatcher::new(&file, "config changed", restarter.clone()).expect("watcher");
        std::fs::remove_file(&file).expect("remove");

        assert!(watcher.check());
        let reasons = restarter.0.lock().expect("lock");
        assert!(reasons[0].starts_with("exception while checking"), "{reasons:?}");
    }

    #[test]
    fn missing_file_falls_back_to_existing_ancestor() {
        let dir = TempDir::new().expect("tempdir");
        let restarter = Arc::new(CountingRestarter::default());
        let watcher = RestartWatcher::new(
            &dir.path().join("not").join("there.yaml"),
            "config changed",
            restarter,
        )
        .expect("watcher");
        assert_eq!(
            watcher.file(),
            std::fs::canonicalize(dir.path()).expect("canonical")
        );
    }
}
