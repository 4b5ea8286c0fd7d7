//! Subprocess supervision for stdio servers.
//!
//! The manager owns the OS processes; protocol channels merely borrow
//! their pipes. Disconnecting a stdio server therefore never stops its
//! process; only [`ProcessManager::stop`] and [`ProcessManager::remove`]
//! do.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};
use crate::recorder::Recorder;
use crate::types::config::{RestartPolicy, ServerConfig, TransportConfig};
use crate::types::process::{Lifecycle, ProcessState};
use crate::types::telemetry::{LogCategory, LogEntry, LogLevel};

/// How long a freshly spawned process must stay alive before it counts
/// as running. The protocol handshake that follows is the real readiness
/// check; this only catches immediate spawn-and-die failures.
pub const SPAWN_GRACE: Duration = Duration::from_millis(300);

/// Grace period between SIGTERM and SIGKILL on a non-forced stop.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay for the auto-restart backoff; doubles per consecutive
/// failure, capped at [`RESTART_BACKOFF_CAP`].
pub const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Captured stderr lines retained per server, newest last.
pub const OUTPUT_TAIL_LINES: usize = 100;

struct Entry {
    state: ProcessState,
    /// Signals the watcher to stop the child; the payload is the force
    /// flag.
    stop_tx: Option<mpsc::Sender<bool>>,
    /// Pipe handles parked here until a transport claims them.
    io: Option<(ChildStdin, ChildStdout)>,
    consecutive_failures: u32,
}

struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    recorder: Arc<Recorder>,
}

pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl ProcessManager {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                recorder,
            }),
        }
    }

    /// Make sure the server's subprocess is running, spawning it from a
    /// stopped or errored state. Returns the resulting state.
    pub async fn ensure_running(&self, config: &ServerConfig) -> Result<ProcessState> {
        let TransportConfig::Stdio { .. } = &config.transport else {
            return Err(Error::InvalidConfig(format!(
                "server {} is not a stdio server",
                config.id
            )));
        };

        {
            let entries = self.inner.entries.read().await;
            if let Some(entry) = entries.get(&config.id) {
                match entry.state.lifecycle {
                    Lifecycle::Running | Lifecycle::Starting => return Ok(entry.state.clone()),
                    Lifecycle::Stopping => {
                        return Err(Error::InvalidConfig(format!(
                            "server {} is stopping",
                            config.id
                        )))
                    }
                    Lifecycle::Stopped | Lifecycle::Error | Lifecycle::Restarting => {}
                }
            }
        }

        spawn_supervised(&self.inner, config).await?;

        // Catch processes that die immediately (bad command arguments,
        // missing runtime). The watcher flips the state to error.
        tokio::time::sleep(SPAWN_GRACE).await;

        let mut entries = self.inner.entries.write().await;
        let entry = entries
            .get_mut(&config.id)
            .ok_or_else(|| Error::ProcessSpawnFailed("process vanished during startup".into()))?;
        if entry.state.lifecycle == Lifecycle::Starting {
            entry.state.lifecycle = Lifecycle::Running;
            entry.consecutive_failures = 0;
            self.inner.recorder.log(
                LogEntry::new(LogLevel::Info, LogCategory::Mcp, "server process running")
                    .server(&config.id),
            );
        } else if entry.state.lifecycle == Lifecycle::Error {
            return Err(Error::ProcessSpawnFailed(
                entry
                    .state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "process exited during startup".into()),
            ));
        }
        Ok(entry.state.clone())
    }

    /// Stop the subprocess. `force` skips the graceful terminate.
    pub async fn stop(&self, server_id: &str, force: bool) -> Result<ProcessState> {
        let stop_tx = {
            let mut entries = self.inner.entries.write().await;
            let entry = entries
                .get_mut(server_id)
                .ok_or_else(|| Error::ProcessNotRunning(server_id.to_string()))?;
            if !entry.state.lifecycle.has_process() {
                return Err(Error::ProcessNotRunning(server_id.to_string()));
            }
            entry.state.lifecycle = Lifecycle::Stopping;
            entry
                .stop_tx
                .clone()
                .ok_or_else(|| Error::ProcessNotRunning(server_id.to_string()))?
        };

        let _ = stop_tx.send(force).await;
        wait_for_settle(&self.inner, server_id, Lifecycle::Stopped).await;

        let entries = self.inner.entries.read().await;
        Ok(entries
            .get(server_id)
            .map(|e| e.state.clone())
            .unwrap_or_else(|| ProcessState::new(server_id)))
    }

    /// Stop (gracefully) and start again. The restart counter increments
    /// unconditionally, including for manually triggered restarts.
    pub async fn restart(&self, config: &ServerConfig) -> Result<ProcessState> {
        if let Err(e) = self.stop(&config.id, false).await {
            tracing::debug!(server_id = %config.id, "restart: stop phase: {e}");
        }

        {
            let mut entries = self.inner.entries.write().await;
            if let Some(entry) = entries.get_mut(&config.id) {
                entry.state.lifecycle = Lifecycle::Restarting;
                entry.state.restart_count += 1;
            }
        }

        self.ensure_running(config).await
    }

    /// Claim the stdio pipes for a protocol channel. Each spawn produces
    /// exactly one pair; a second claim fails until the next (re)spawn.
    pub async fn take_io(&self, server_id: &str) -> Result<(ChildStdin, ChildStdout)> {
        let mut entries = self.inner.entries.write().await;
        let entry = entries
            .get_mut(server_id)
            .ok_or_else(|| Error::ProcessNotRunning(server_id.to_string()))?;
        if !entry.state.lifecycle.has_process() {
            return Err(Error::ProcessNotRunning(server_id.to_string()));
        }
        entry
            .io
            .take()
            .ok_or_else(|| Error::Transport("stdio pipes already claimed".into()))
    }

    pub async fn state(&self, server_id: &str) -> Option<ProcessState> {
        let entries = self.inner.entries.read().await;
        entries.get(server_id).map(|e| e.state.clone())
    }

    pub async fn list(&self) -> Vec<ProcessState> {
        let entries = self.inner.entries.read().await;
        entries.values().map(|e| e.state.clone()).collect()
    }

    /// Remove all trace of the server: kill if alive, drop state. Part
    /// of the configuration-removal cascade.
    pub async fn remove(&self, server_id: &str) {
        let stop_tx = {
            let entries = self.inner.entries.read().await;
            entries.get(server_id).and_then(|e| e.stop_tx.clone())
        };
        if let Some(tx) = stop_tx {
            let _ = tx.send(true).await;
            wait_for_settle(&self.inner, server_id, Lifecycle::Stopped).await;
        }
        let mut entries = self.inner.entries.write().await;
        entries.remove(server_id);
    }
}

/// Poll until the watcher has settled the entry into `target` (or error),
/// bounded by the shutdown timeout.
async fn wait_for_settle(inner: &Arc<Inner>, server_id: &str, target: Lifecycle) {
    let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT + Duration::from_secs(1);
    loop {
        {
            let entries = inner.entries.read().await;
            match entries.get(server_id) {
                Some(entry)
                    if entry.state.lifecycle == target
                        || entry.state.lifecycle == Lifecycle::Error =>
                {
                    return;
                }
                None => return,
                _ => {}
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Build and spawn the configured command, wire stderr capture and the
/// exit watcher, and record the `starting` state.
async fn spawn_supervised(inner: &Arc<Inner>, config: &ServerConfig) -> Result<()> {
    let TransportConfig::Stdio {
        command,
        args,
        env,
        cwd,
    } = &config.transport
    else {
        return Err(Error::InvalidConfig("not a stdio transport".into()));
    };

    // Bare commands are resolved against PATH up front so the error is
    // a spawn failure here, not a cryptic exec failure later.
    let program = if command.contains('/') || command.contains('\\') {
        std::path::PathBuf::from(command)
    } else {
        which::which(command)
            .map_err(|_| Error::ProcessSpawnFailed(format!("command '{command}' not found")))?
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    // Overlay on the parent environment; overlay wins on collision.
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::ProcessSpawnFailed(e.to_string()))?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::ProcessSpawnFailed("no stdin pipe".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::ProcessSpawnFailed("no stdout pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::ProcessSpawnFailed("no stderr pipe".into()))?;

    let (stop_tx, stop_rx) = mpsc::channel::<bool>(1);

    {
        let mut entries = inner.entries.write().await;
        let entry = entries
            .entry(config.id.clone())
            .or_insert_with(|| Entry {
                state: ProcessState::new(&config.id),
                stop_tx: None,
                io: None,
                consecutive_failures: 0,
            });
        entry.state.lifecycle = Lifecycle::Starting;
        entry.state.pid = pid;
        entry.state.started_at = Some(Utc::now());
        entry.state.stopped_at = None;
        entry.state.last_error = None;
        entry.stop_tx = Some(stop_tx);
        entry.io = Some((stdin, stdout));
    }

    inner.recorder.log(
        LogEntry::new(LogLevel::Info, LogCategory::Mcp, "spawning server process")
            .server(&config.id)
            .detail(serde_json::json!({ "pid": pid })),
    );

    spawn_stderr_capture(inner.clone(), config.id.clone(), stderr);
    spawn_watcher(
        inner.clone(),
        config.clone(),
        child,
        stop_rx,
        config.restart_policy.unwrap_or_default(),
    );
    Ok(())
}

fn spawn_stderr_capture(
    inner: Arc<Inner>,
    server_id: String,
    stderr: tokio::process::ChildStderr,
) {
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut entries = inner.entries.write().await;
            if let Some(entry) = entries.get_mut(&server_id) {
                if entry.state.output_tail.len() == OUTPUT_TAIL_LINES {
                    entry.state.output_tail.remove(0);
                }
                entry.state.output_tail.push(line);
            } else {
                break;
            }
        }
    });
}

/// Supervise one child: stop requests, unexpected exits, auto-restart.
fn spawn_watcher(
    inner: Arc<Inner>,
    config: ServerConfig,
    mut child: Child,
    mut stop_rx: mpsc::Receiver<bool>,
    policy: RestartPolicy,
) {
    let server_id = config.id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                force = stop_rx.recv() => {
                    let force = force.unwrap_or(true);
                    shutdown_child(&mut child, force).await;
                    let mut entries = inner.entries.write().await;
                    if let Some(entry) = entries.get_mut(&server_id) {
                        entry.state.lifecycle = Lifecycle::Stopped;
                        entry.state.pid = None;
                        entry.state.stopped_at = Some(Utc::now());
                        entry.io = None;
                        entry.stop_tx = None;
                    }
                    inner.recorder.log(
                        LogEntry::new(LogLevel::Info, LogCategory::Mcp, "server process stopped")
                            .server(&server_id),
                    );
                    return;
                }
                status = child.wait() => {
                    let detail = match status {
                        Ok(status) => format!("process exited unexpectedly: {status}"),
                        Err(e) => format!("failed to reap process: {e}"),
                    };
                    let failures = {
                        let mut entries = inner.entries.write().await;
                        let Some(entry) = entries.get_mut(&server_id) else { return };
                        entry.state.lifecycle = Lifecycle::Error;
                        entry.state.pid = None;
                        entry.state.stopped_at = Some(Utc::now());
                        entry.state.last_error = Some(detail.clone());
                        entry.state.restart_count += 1;
                        entry.consecutive_failures += 1;
                        entry.io = None;
                        entry.stop_tx = None;
                        entry.consecutive_failures
                    };
                    inner.recorder.log(
                        LogEntry::new(LogLevel::Error, LogCategory::Mcp, detail)
                            .server(&server_id),
                    );

                    if !policy.auto {
                        return;
                    }
                    if failures > policy.max_consecutive {
                        let err = Error::RestartLimitExceeded(server_id.clone());
                        let mut entries = inner.entries.write().await;
                        if let Some(entry) = entries.get_mut(&server_id) {
                            entry.state.last_error = Some(err.to_string());
                        }
                        inner.recorder.log(
                            LogEntry::new(LogLevel::Error, LogCategory::Mcp, err.to_string())
                                .server(&server_id),
                        );
                        return;
                    }

                    // Exponential backoff between respawns to avoid a
                    // restart storm.
                    let shift = failures.saturating_sub(1).min(10);
                    let backoff =
                        (RESTART_BACKOFF_BASE * 2u32.pow(shift)).min(RESTART_BACKOFF_CAP);
                    tokio::time::sleep(backoff).await;

                    match spawn_supervised(&inner, &config).await {
                        Ok(()) => {
                            // A fresh watcher now owns the new child.
                            tokio::time::sleep(SPAWN_GRACE).await;
                            let mut entries = inner.entries.write().await;
                            if let Some(entry) = entries.get_mut(&server_id) {
                                if entry.state.lifecycle == Lifecycle::Starting {
                                    entry.state.lifecycle = Lifecycle::Running;
                                    // The limit is on consecutive failures;
                                    // a recovery starts the count over.
                                    entry.consecutive_failures = 0;
                                }
                            }
                            return;
                        }
                        Err(e) => {
                            let mut entries = inner.entries.write().await;
                            if let Some(entry) = entries.get_mut(&server_id) {
                                entry.state.last_error = Some(e.to_string());
                                entry.consecutive_failures += 1;
                            }
                            // No live child to watch; give up this task.
                            // The next ensure_running starts over.
                            return;
                        }
                    }
                }
            }
        }
    });
}

async fn shutdown_child(child: &mut Child, force: bool) {
    if force {
        let _ = child.kill().await;
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }

    let _ = child.kill().await;
}
