use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DAEMON_LABEL: &str = "dev.crank.daemon";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

pub const DAEMON_STDOUT_LOG: &str = "crankd.log";
pub const DAEMON_STDERR_LOG: &str = "crankd-err.log";
pub const DAEMON_SOCKET: &str = "crank.sock";

pub fn crank_root(home: &Path) -> PathBuf {
    crank_core::config::crank_root_at(home)
}

pub fn run_dir(home: &Path) -> PathBuf {
    crank_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    crank_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    crank_root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}

/// Files and directories the daemon writes to while running.
pub fn runtime_paths(home: &Path) -> Vec<PathBuf> {
    vec![
        logs_dir(home),
        run_dir(home),
        socket_path(home),
        crank_core::config::journal_path_at(home),
    ]
}

pub fn launch_agents_dir(home: &Path) -> PathBuf {
    home.join("Library").join("LaunchAgents")
}

pub fn launchd_plist_path(home: &Path) -> PathBuf {
    launch_agents_dir(home).join(format!("{DAEMON_LABEL}.plist"))
}
