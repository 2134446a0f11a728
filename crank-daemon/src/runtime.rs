use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::event::{CreateKind, RemoveKind};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, oneshot};

use crank_core::config;
use crank_dispatch::restart::add_conditional_restart;
use crank_dispatch::{
    Catalog, DispatchReport, ExecRestarter, PathEvent, RawEvent, Resolver, Restarter, Router,
    ShellExecutor, WatchFlags,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{crank_root, logs_dir, run_dir, runtime_paths, socket_path, HEARTBEAT_INTERVAL};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// How the daemon was started. Also the arguments a restart re-executes with.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub debug: bool,
}

impl DaemonOptions {
    /// Normalized arguments for re-executing the daemon: absolute config
    /// path, debug flag preserved.
    pub fn restart_args(&self) -> Vec<OsString> {
        let config_path = if self.config_path.is_absolute() {
            self.config_path.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.config_path))
                .unwrap_or_else(|_| self.config_path.clone())
        };
        let mut args: Vec<OsString> = vec![
            "start".into(),
            "--config".into(),
            config_path.into_os_string(),
        ];
        if self.debug {
            args.push("--debug".into());
        }
        args
    }
}

/// Everything that reaches the dispatcher, in arrival order.
enum FeedEvent {
    Raw {
        event: RawEvent,
        respond_to: Option<oneshot::Sender<DispatchReport>>,
    },
    Path(PathEvent),
    Status {
        respond_to: oneshot::Sender<Value>,
    },
}

/// Running totals reported by `status`.
#[derive(Debug, Default, Clone, Copy, Serialize)]
struct DispatchStats {
    events: u64,
    handled: u64,
    unhandled: u64,
    failed: u64,
    suppressed: u64,
    rearmed: u64,
}

impl DispatchStats {
    fn record(&mut self, report: &DispatchReport) {
        self.events += 1;
        self.failed += report.failed as u64;
        self.rearmed += report.rearmed as u64;
        if report.suppressed {
            self.suppressed += 1;
        } else if report.is_unhandled() {
            self.unhandled += 1;
        } else {
            self.handled += 1;
        }
    }
}

#[derive(Debug, Clone)]
struct StatusInfo {
    home: PathBuf,
    config_path: PathBuf,
    started_at_unix: u64,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(options: DaemonOptions) -> Result<(), DaemonError> {
    init_tracing(options.debug);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(options))
}

/// Build the router from the config file and run the daemon until shutdown.
pub async fn run(options: DaemonOptions) -> Result<(), DaemonError> {
    let home = options.home.clone();
    ensure_runtime_dirs(&home)?;

    let config = config::load_at(&options.config_path)?;
    let mut resolver = Resolver::new(Catalog::with_builtins(), Arc::new(ShellExecutor));
    let mut router = Router::from_config(&config, &mut resolver)?;

    let program = std::env::current_exe().map_err(|e| io_err("current executable", e))?;
    let restarter: Arc<dyn Restarter> =
        Arc::new(ExecRestarter::new(program.clone(), options.restart_args()));
    add_conditional_restart(
        router.watches_mut(),
        &options.config_path,
        "configuration file changed",
        Arc::clone(&restarter),
    )?;
    add_conditional_restart(
        router.watches_mut(),
        &program,
        "crank executable changed",
        Arc::clone(&restarter),
    )?;

    let path_feed = PathFeed::new(&home, router.watch_paths());
    let info = StatusInfo {
        home: home.clone(),
        config_path: options.config_path.clone(),
        started_at_unix: unix_seconds_now(),
    };

    let (feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(256);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let dispatcher_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = dispatcher_task(router, info, feed_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let feed_tx = feed_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(path_feed, feed_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let feed_tx = feed_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(home, feed_tx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let restarter = Arc::clone(&restarter);
        tokio::spawn(async move { signal_task(restarter, shutdown).await })
    };
    drop(feed_tx);

    let (dispatcher_result, watcher_result, socket_result, rotation_result, signal_result) = tokio::join!(
        dispatcher_handle,
        watcher_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("dispatcher", dispatcher_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("crankd stopped");
    Ok(())
}

/// Owns the router; every event is dispatched here, one at a time.
async fn dispatcher_task(
    mut router: Router,
    info: StatusInfo,
    mut feed_rx: mpsc::Receiver<FeedEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut stats = DispatchStats::default();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        subscriptions = router.subscriptions().len(),
        "crankd ready; listening for events",
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = heartbeat.tick() => tracing::debug!("heartbeat"),
            feed = feed_rx.recv() => {
                let Some(feed) = feed else { break };
                match feed {
                    FeedEvent::Raw { event, respond_to } => {
                        let report = router.dispatch(&event);
                        stats.record(&report);
                        if let Some(respond_to) = respond_to {
                            let _ = respond_to.send(report);
                        }
                    }
                    FeedEvent::Path(event) => {
                        let report = router.dispatch_path(&event);
                        stats.record(&report);
                    }
                    FeedEvent::Status { respond_to } => {
                        let _ = respond_to.send(status_payload(&info, &router, &stats));
                    }
                }
                for (source, key) in router.take_resubscriptions() {
                    tracing::info!(source = %source, key = %key, "re-subscribed");
                }
            }
        }
    }
    Ok(())
}

async fn watcher_task(
    path_feed: PathFeed,
    feed_tx: mpsc::Sender<FeedEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    for path in &path_feed.roots {
        watcher.watch(path, RecursiveMode::Recursive)?;
        tracing::debug!(path = %path.display(), "watching directory");
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                for path_event in path_feed.path_events(&event) {
                    if feed_tx.send(FeedEvent::Path(path_event)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    Ok(())
}

/// Turns notify events into router path events.
struct PathFeed {
    /// Watched roots. A rescan that names no path covers all of them.
    roots: Vec<PathBuf>,
    /// Daemon-owned paths; writes there never reach the router.
    own: Vec<PathBuf>,
}

impl PathFeed {
    fn new(home: &Path, roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            own: own_paths(home),
        }
    }

    /// Change-stream events for one notify event. Access events are not changes.
    fn path_events(&self, event: &Event) -> Vec<PathEvent> {
        if matches!(event.kind, EventKind::Access(_)) {
            return Vec::new();
        }
        if event.paths.is_empty() {
            if !event.need_rescan() {
                return Vec::new();
            }
            // Queue overflow: the backend lost events and cannot say where.
            tracing::error!(
                roots = self.roots.len(),
                "file system events were dropped; rescanning every watch",
            );
            return self
                .roots
                .iter()
                .map(|root| PathEvent {
                    flags: WatchFlags {
                        must_scan_subdirs: true,
                        kernel_dropped: true,
                        ..WatchFlags::default()
                    },
                    ..PathEvent::dir(root.clone())
                })
                .collect();
        }

        let flags = WatchFlags {
            must_scan_subdirs: event.need_rescan(),
            ..WatchFlags::default()
        };
        let is_dir = reported_dir(&event.kind);
        event
            .paths
            .iter()
            .filter(|path| !self.is_own(path))
            .map(|path| PathEvent {
                path: path.clone(),
                flags,
                is_dir,
            })
            .collect()
    }

    fn is_own(&self, path: &Path) -> bool {
        self.own.iter().any(|own| path.starts_with(own))
    }
}

/// Whether notify said the path is a directory.
fn reported_dir(kind: &EventKind) -> Option<bool> {
    match kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => Some(true),
        EventKind::Create(CreateKind::File) | EventKind::Remove(RemoveKind::File) => Some(false),
        _ => None,
    }
}

/// [`runtime_paths`] as configured and under the canonical crank root, which
/// is how notify reports them.
fn own_paths(home: &Path) -> Vec<PathBuf> {
    let root = crank_root(home);
    let canonical_root = fs::canonicalize(&root).ok();
    let mut paths = Vec::new();
    for path in runtime_paths(home) {
        if let (Some(canonical_root), Ok(relative)) = (&canonical_root, path.strip_prefix(&root)) {
            let canonical = canonical_root.join(relative);
            if canonical != path {
                paths.push(canonical);
            }
        }
        paths.push(path);
    }
    paths
}

async fn socket_server_task(
    home: PathBuf,
    feed_tx: mpsc::Sender<FeedEvent>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let feed_tx = feed_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(err) = serve_client(reader, writer, feed_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn serve_client<R, W>(
    reader: R,
    mut writer: W,
    feed_tx: mpsc::Sender<FeedEvent>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => {
                let (tx, rx) = oneshot::channel();
                send_feed(&feed_tx, FeedEvent::Status { respond_to: tx }).await?;
                let payload = rx
                    .await
                    .map_err(|_| DaemonError::ChannelClosed("status response"))?;
                DaemonResponse::ok(payload)
            }
            "post" => match request.event {
                Some(event) => {
                    let (tx, rx) = oneshot::channel();
                    send_feed(
                        &feed_tx,
                        FeedEvent::Raw {
                            event,
                            respond_to: Some(tx),
                        },
                    )
                    .await?;
                    let report = rx
                        .await
                        .map_err(|_| DaemonError::ChannelClosed("dispatch report"))?;
                    DaemonResponse::ok(json!(report))
                }
                None => DaemonResponse::error("post requires an event"),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn send_feed(feed_tx: &mpsc::Sender<FeedEvent>, feed: FeedEvent) -> Result<(), DaemonError> {
    feed_tx
        .send(feed)
        .await
        .map_err(|_| DaemonError::ChannelClosed("dispatch queue"))
}

fn status_payload(info: &StatusInfo, router: &Router, stats: &DispatchStats) -> Value {
    let watch_paths: Vec<String> = router
        .watch_paths()
        .iter()
        .map(|path| path.display().to_string())
        .collect();

    json!({
        "running": true,
        "pid": std::process::id(),
        "label": crate::paths::DAEMON_LABEL,
        "started_at_unix": info.started_at_unix,
        "config": info.config_path.display().to_string(),
        "socket": socket_path(&info.home).display().to_string(),
        "stats": stats,
        "watch_paths": watch_paths,
        "subscriptions": router.subscriptions(),
    })
}

/// ctrl-c stops the daemon; SIGHUP restarts it in place.
async fn signal_task(
    restarter: Arc<dyn Restarter>,
    shutdown: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).map_err(|e| io_err("SIGHUP handler", e))?;
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            _ = hangup.recv() => {
                restarter.restart("SIGHUP received");
            }
            signal = tokio::signal::ctrl_c() => {
                return match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        let _ = shutdown.send(());
                        Ok(())
                    }
                    Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                };
            }
        }
    }
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&home);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [run_dir(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber. `RUST_LOG` wins; otherwise `info`, or
/// `debug` when `debug` is set.
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
