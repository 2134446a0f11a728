//! Shell-command handlers.
//!
//! Commands run through `/bin/sh -c` with a minimal environment describing
//! the event. Execution sits behind [`CommandExecutor`] so the router can be
//! driven without spawning processes.

use std::process::ExitStatus;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crank_core::Payload;

use crate::error::HandlerError;
use crate::invocation::Invocation;

pub const SHELL: &str = "/bin/sh";

/// A fully prepared command, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub context: String,
    pub command: String,
    /// The complete child environment; nothing else is inherited.
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn for_invocation(command: &str, invocation: &Invocation) -> Self {
        Self {
            context: invocation.context.clone(),
            command: command.to_string(),
            env: child_env(invocation),
        }
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Runs shell commands for handlers.
pub trait CommandExecutor: Send + Sync {
    /// Start `command`. Must not wait for the child when running inside the
    /// daemon's runtime.
    fn execute(&self, command: ShellCommand) -> Result<(), HandlerError>;
}

/// Spawns commands with `/bin/sh -c`.
///
/// Inside a tokio runtime the child is awaited on a spawned task so dispatch
/// never waits on it. Outside a runtime (e.g. one-shot CLI use) the call
/// blocks until the child exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellExecutor;

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: ShellCommand) -> Result<(), HandlerError> {
        tracing::info!(context = %command.context, command = %command.command, "executing");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut child = tokio::process::Command::new(SHELL)
                    .arg("-c")
                    .arg(&command.command)
                    .env_clear()
                    .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .spawn()
                    .map_err(|err| {
                        HandlerError::new(format!(
                            "got an error when executing {}: {err}",
                            command.command
                        ))
                    })?;
                handle.spawn(async move {
                    match child.wait().await {
                        Ok(status) => log_exit(&command.command, status),
                        Err(err) => tracing::error!(
                            command = %command.command,
                            error = %err,
                            "failed waiting for command",
                        ),
                    }
                });
                Ok(())
            }
            Err(_) => {
                let status = std::process::Command::new(SHELL)
                    .arg("-c")
                    .arg(&command.command)
                    .env_clear()
                    .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .status()
                    .map_err(|err| {
                        HandlerError::new(format!(
                            "got an error when executing {}: {err}",
                            command.command
                        ))
                    })?;
                log_exit(&command.command, status);
                Ok(())
            }
        }
    }
}

fn log_exit(command: &str, status: ExitStatus) {
    match status.code() {
        Some(0) => tracing::debug!(command, "`{command}` returned 0"),
        Some(code) => tracing::error!(command, code, "`{command}` returned {code}"),
        None => match terminating_signal(status) {
            Some(signal) => {
                tracing::error!(command, signal, "`{command}` was terminated by signal {signal}")
            }
            None => tracing::error!(command, "`{command}` exited abnormally"),
        },
    }
}

#[cfg(unix)]
fn terminating_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Environment for a shell handler: `PATH`, `CRANK_CONTEXT`, `CRANK_KEY`,
/// `CRANK_INFO`, and the payload's fields under shell-style names.
pub fn child_env(invocation: &Invocation) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(path) = std::env::var_os("PATH") {
        env.push(("PATH".to_string(), path.to_string_lossy().into_owned()));
    }
    env.push(("CRANK_CONTEXT".to_string(), invocation.context.clone()));
    if !invocation.key.as_str().is_empty() {
        env.push(("CRANK_KEY".to_string(), invocation.key.to_string()));
    }
    if let Some(info) = invocation.payload.info() {
        if !info.is_null() {
            env.push(("CRANK_INFO".to_string(), value_to_env(info)));
        }
    }

    let fields: Option<Map<String, Value>> = match &invocation.payload {
        Payload::UserInfo { user_info } => Some(user_info.clone()),
        Payload::Service(service) => object_fields(serde_json::to_value(service).ok()),
        Payload::Location(location) => object_fields(serde_json::to_value(location).ok()),
        Payload::Path {
            path, recursive, ..
        } => {
            env.push(("CRANK_PATH".to_string(), path.display().to_string()));
            env.push(("CRANK_RECURSIVE".to_string(), recursive.to_string()));
            None
        }
        Payload::Info { .. } | Payload::None => None,
    };
    for (name, value) in fields.into_iter().flatten() {
        let name = create_env_name(&name);
        if !name.is_empty() {
            env.push((name, value_to_env(&value)));
        }
    }
    env
}

fn object_fields(value: Option<Value>) -> Option<Map<String, Value>> {
    match value {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn value_to_env(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Converts a camel-case or punctuated name into a shell variable name.
///
/// `NSApplicationBundleIdentifier` becomes `NSAPPLICATION_BUNDLE_IDENTIFIER`.
pub fn create_env_name(name: &str) -> String {
    static CAMEL: OnceLock<Regex> = OnceLock::new();
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    static RUNS: OnceLock<Regex> = OnceLock::new();

    let camel = CAMEL.get_or_init(|| Regex::new(r"([a-z])([A-Z])").expect("valid regex"));
    let non_word = NON_WORD.get_or_init(|| Regex::new(r"\W+").expect("valid regex"));
    let runs = RUNS.get_or_init(|| Regex::new(r"_{2,}").expect("valid regex"));

    let name = camel.replace_all(name, "${1}_${2}");
    let name = non_word.replace_all(&name, "_");
    let name = runs.replace_all(&name, "_");
    name.to_uppercase().trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crank_core::{EventKey, HandlerSpec, LocationInfo, SourceKind};
    use rstest::rstest;
    use serde_json::json;

    fn invocation(payload: Payload) -> Invocation {
        Invocation {
            context: "workspace notification NSWorkspaceDidLaunchApplicationNotification".into(),
            source: SourceKind::Workspace,
            key: EventKey::from("NSWorkspaceDidLaunchApplicationNotification"),
            spec: HandlerSpec::command("true"),
            payload,
            pattern: None,
        }
    }

    #[rstest]
    #[case("NSApplicationBundleIdentifier", "NSAPPLICATION_BUNDLE_IDENTIFIER")]
    #[case(
        "NSApplicationBundleIdentifier-1234$foobar!",
        "NSAPPLICATION_BUNDLE_IDENTIFIER_1234_FOOBAR"
    )]
    #[case("host_name", "HOST_NAME")]
    #[case("__weird__", "WEIRD")]
    #[case("!!!", "")]
    fn env_names(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(create_env_name(input), expected);
    }

    #[test]
    fn user_info_becomes_environment() {
        let mut user_info = Map::new();
        user_info.insert("NSApplicationName".into(), json!("Mail"));
        user_info.insert("NSApplicationProcessIdentifier".into(), json!(412));
        let command = ShellCommand::for_invocation("true", &invocation(Payload::UserInfo { user_info }));

        assert_eq!(command.env_var("NSAPPLICATION_NAME"), Some("Mail"));
        assert_eq!(command.env_var("NSAPPLICATION_PROCESS_IDENTIFIER"), Some("412"));
        assert_eq!(
            command.env_var("CRANK_KEY"),
            Some("NSWorkspaceDidLaunchApplicationNotification")
        );
        assert!(command.env_var("CRANK_INFO").is_none());
    }

    #[test]
    fn info_is_exported_as_crank_info() {
        let command = ShellCommand::for_invocation(
            "true",
            &invocation(Payload::Info {
                info: json!("192.168.1.10"),
            }),
        );
        assert_eq!(command.env_var("CRANK_INFO"), Some("192.168.1.10"));
    }

    #[test]
    fn location_fields_are_exported() {
        let command = ShellCommand::for_invocation(
            "true",
            &invocation(Payload::Location(LocationInfo {
                latitude: 52.5,
                longitude: 13.4,
                horizontal_accuracy: 10.0,
            })),
        );
        assert_eq!(command.env_var("LATITUDE"), Some("52.5"));
        assert_eq!(command.env_var("HORIZONTAL_ACCURACY"), Some("10.0"));
    }

    #[cfg(unix)]
    #[test]
    fn executor_runs_command_outside_runtime() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let marker = dir.path().join("ran");
        let command = ShellCommand {
            context: "test".into(),
            command: format!("echo \"$CRANK_KEY\" > '{}'", marker.display()),
            env: vec![("CRANK_KEY".into(), "State:/Network/Global/IPv4".into())],
        };
        ShellExecutor.execute(command).expect("execute");
        let written = std::fs::read_to_string(&marker).expect("marker written");
        assert_eq!(written.trim(), "State:/Network/Global/IPv4");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executor_does_not_wait_inside_runtime() {
        let started = std::time::Instant::now();
        let command = ShellCommand {
            context: "test".into(),
            command: "sleep 2".into(),
            env: Vec::new(),
        };
        ShellExecutor.execute(command).expect("execute");
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }
}
