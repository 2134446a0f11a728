//! Size-based rotation of the daemon's launchd log files.
//!
//! The LaunchAgent points stdout and stderr at `crankd.log` and
//! `crankd-err.log`. Past the size limit a file is shifted to `<name>.1`,
//! older copies move up by one and the oldest is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Rotate once a log reaches 10 MiB.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated copies kept per log.
pub const MAX_ROTATED_FILES: usize = 5;

/// When and how deep to rotate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_LOG_BYTES,
            keep: MAX_ROTATED_FILES,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log` if it is at or over the limit. A missing log is not an
    /// error. Returns whether a rotation happened.
    pub fn rotate(&self, log: &Path) -> io::Result<bool> {
        let len = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if len < self.max_bytes || self.keep == 0 {
            return Ok(false);
        }

        remove_if_present(&rotated_path(log, self.keep))?;
        for n in (1..self.keep).rev() {
            let from = rotated_path(log, n);
            if from.exists() {
                fs::rename(&from, rotated_path(log, n + 1))?;
            }
        }
        fs::rename(log, rotated_path(log, 1))?;

        // Fresh empty file for `crank logs` to follow.
        fs::File::create(log)?;
        Ok(true)
    }
}

/// Rotate both daemon logs under `home`. Failures are logged and do not stop
/// the other log from being checked.
pub fn rotate_logs(home: &Path) {
    let policy = RotationPolicy::default();
    for log in [
        crate::paths::stdout_log_path(home),
        crate::paths::stderr_log_path(home),
    ] {
        match policy.rotate(&log) {
            Ok(true) => tracing::info!(path = %log.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log.display(), error = %err, "log rotation failed"),
        }
    }
}

/// `crankd.log` → `crankd.log.<n>`
fn rotated_path(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL: RotationPolicy = RotationPolicy {
        max_bytes: 16,
        keep: 3,
    };

    fn write(path: &Path, contents: &str) {
        fs::write(path, contents).expect("write log");
    }

    #[test]
    fn small_or_missing_logs_are_left_alone() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("crankd.log");
        assert!(!SMALL.rotate(&log).expect("missing"));

        write(&log, "short");
        assert!(!SMALL.rotate(&log).expect("small"));
        assert!(!rotated_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_moves_to_first_copy() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("crankd.log");
        write(&log, "0123456789abcdef-overflow");

        assert!(SMALL.rotate(&log).expect("rotate"));
        assert_eq!(fs::metadata(&log).expect("fresh log").len(), 0);
        assert_eq!(
            fs::read_to_string(rotated_path(&log, 1)).expect("copy"),
            "0123456789abcdef-overflow"
        );
    }

    #[test]
    fn copies_shift_and_oldest_is_dropped() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("crankd-err.log");

        for round in 1..=5 {
            write(&log, &format!("round {round} ............"));
            assert!(SMALL.rotate(&log).expect("rotate"));
        }

        assert!(fs::read_to_string(rotated_path(&log, 1))
            .expect("newest")
            .starts_with("round 5"));
        assert!(fs::read_to_string(rotated_path(&log, 3))
            .expect("oldest kept")
            .starts_with("round 3"));
        assert!(!rotated_path(&log, 4).exists());
    }

    #[test]
    fn default_policy_matches_launchd_limits() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.max_bytes, 10 * 1024 * 1024);
        assert_eq!(policy.keep, 5);
        assert_eq!(
            rotated_path(Path::new("/tmp/crankd.log"), 2),
            PathBuf::from("/tmp/crankd.log.2")
        );
    }
}
