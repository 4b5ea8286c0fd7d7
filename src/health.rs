//! Periodic liveness probing with automatic reconnect.
//!
//! One watcher task per watched server. Probes only run while the
//! connection is established; consecutive failures past the threshold
//! trigger a bounded reconnect cycle with exponential backoff, after
//! which the server is left in its error state for a manual reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::recorder::Recorder;
use crate::types::config::ServerConfig;
use crate::types::connection::ConnectionStatus;
use crate::types::telemetry::{LogCategory, LogEntry, LogLevel, Metric};

pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const FAILURE_THRESHOLD: u32 = 3;
pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(20);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Tunable knobs, defaulting to the production constants.
#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub probe_interval: Duration,
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            probe_interval: PROBE_INTERVAL,
            failure_threshold: FAILURE_THRESHOLD,
            backoff_base: RECONNECT_BACKOFF_BASE,
            backoff_cap: RECONNECT_BACKOFF_CAP,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

type WatcherMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct HealthMonitor {
    connections: Arc<ConnectionManager>,
    recorder: Arc<Recorder>,
    options: HealthOptions,
    /// Shared with the watcher tasks so a watcher that gives up can
    /// deregister itself.
    watchers: WatcherMap,
}

impl HealthMonitor {
    pub fn new(connections: Arc<ConnectionManager>, recorder: Arc<Recorder>) -> Self {
        Self::with_options(connections, recorder, HealthOptions::default())
    }

    pub fn with_options(
        connections: Arc<ConnectionManager>,
        recorder: Arc<Recorder>,
        options: HealthOptions,
    ) -> Self {
        Self {
            connections,
            recorder,
            options,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start (or replace) the watcher for a server.
    pub async fn watch(&self, config: ServerConfig) {
        let cancel = CancellationToken::new();
        {
            let mut watchers = self.watchers.lock().await;
            if let Some(previous) = watchers.insert(config.id.clone(), cancel.clone()) {
                previous.cancel();
            }
        }
        let connections = self.connections.clone();
        let recorder = self.recorder.clone();
        let options = self.options.clone();
        let watchers = self.watchers.clone();
        tokio::spawn(async move {
            watch_loop(connections, recorder, options, config, cancel, watchers).await;
        });
    }

    /// Stop watching a server. Part of disconnect and the removal
    /// cascade.
    pub async fn unwatch(&self, server_id: &str) {
        let mut watchers = self.watchers.lock().await;
        if let Some(cancel) = watchers.remove(server_id) {
            cancel.cancel();
        }
    }

    /// Server ids currently under watch.
    pub async fn watched(&self) -> Vec<String> {
        let watchers = self.watchers.lock().await;
        watchers.keys().cloned().collect()
    }

    /// Reconnect immediately, skipping the probe cycle and its backoff.
    pub async fn manual_reconnect(&self, config: &ServerConfig) -> Result<()> {
        self.connections.reconnect(config).await?;
        Ok(())
    }
}

async fn watch_loop(
    connections: Arc<ConnectionManager>,
    recorder: Arc<Recorder>,
    options: HealthOptions,
    config: ServerConfig,
    cancel: CancellationToken,
    watchers: WatcherMap,
) {
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(options.probe_interval) => {}
        }

        let status = connections
            .state(&config.id)
            .await
            .map(|s| s.status);
        if status != Some(ConnectionStatus::Connected) {
            // Nothing to probe until something re-establishes the
            // channel.
            failures = 0;
            continue;
        }

        let started = Instant::now();
        let result = connections.ping(&config.id).await;
        recorder.metric(Metric {
            timestamp: Utc::now(),
            server_id: config.id.clone(),
            server_name: Some(config.name.clone()),
            operation: "ping".into(),
            duration_ms: started.elapsed().as_millis() as u64,
            success: result.is_ok(),
        });

        match result {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                recorder.log(
                    LogEntry::new(
                        LogLevel::Warn,
                        LogCategory::Connection,
                        format!("health probe failed ({failures}/{}): {e}", options.failure_threshold),
                    )
                    .server(&config.id),
                );
                if failures >= options.failure_threshold {
                    failures = 0;
                    let recovered =
                        reconnect_cycle(&connections, &recorder, &options, &config, &cancel).await;
                    if !recovered {
                        // Left in error state; a manual reconnect is the
                        // way back. Deregister so `watched` stays honest.
                        let mut watchers = watchers.lock().await;
                        // `watch` replaces our token under this same
                        // lock, so uncancelled means the entry is ours.
                        if !cancel.is_cancelled() {
                            watchers.remove(&config.id);
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Bounded reconnect attempts with exponential backoff. Returns whether
/// the connection was re-established.
async fn reconnect_cycle(
    connections: &ConnectionManager,
    recorder: &Recorder,
    options: &HealthOptions,
    config: &ServerConfig,
    cancel: &CancellationToken,
) -> bool {
    for attempt in 1..=options.max_reconnect_attempts {
        let shift = attempt.saturating_sub(1).min(10);
        let backoff = (options.backoff_base * 2u32.pow(shift)).min(options.backoff_cap);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(backoff) => {}
        }

        match connections.reconnect(config).await {
            Ok(_) => {
                recorder.log(
                    LogEntry::new(
                        LogLevel::Info,
                        LogCategory::Connection,
                        format!("reconnected after {attempt} attempt(s)"),
                    )
                    .server(&config.id),
                );
                return true;
            }
            Err(e) => {
                recorder.log(
                    LogEntry::new(
                        LogLevel::Warn,
                        LogCategory::Connection,
                        format!(
                            "reconnect attempt {attempt}/{} failed: {e}",
                            options.max_reconnect_attempts
                        ),
                    )
                    .server(&config.id),
                );
            }
        }
    }
    recorder.log(
        LogEntry::new(
            LogLevel::Error,
            LogCategory::Connection,
            "reconnect attempts exhausted",
        )
        .server(&config.id),
    );
    false
}
