//! Connection state machine: one protocol session per configured server.
//!
//! Transitions are guarded so concurrent connect calls cannot double up,
//! and every status change is broadcast to subscribers and recorded.
//! Disconnecting tears down the protocol channel only; a stdio server's
//! subprocess stays under the process manager's control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::process::ProcessManager;
use crate::protocol::Session;
use crate::recorder::Recorder;
use crate::transport::{
    build_headers, HttpTransport, SseTransport, StdioTransport, Transport, HANDSHAKE_TIMEOUT,
};
use crate::types::config::{ServerConfig, TransportConfig};
use crate::types::connection::{
    ConnectionEvent, ConnectionState, ConnectionStatus, PromptTemplate, ResourceDefinition,
    ToolDefinition,
};
use crate::types::telemetry::{CapturedError, LogCategory, LogEntry, LogLevel, Metric};

const EVENT_CAPACITY: usize = 64;

struct ConnEntry {
    state: ConnectionState,
    session: Option<Arc<Session>>,
    transport: Option<Box<dyn Transport>>,
    /// Serializes tool invocations per server.
    invoke_lock: Arc<Mutex<()>>,
}

impl ConnEntry {
    fn new(server_id: &str) -> Self {
        Self {
            state: ConnectionState::new(server_id),
            session: None,
            transport: None,
            invoke_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Everything established for a server by a successful handshake.
struct Established {
    transport: Box<dyn Transport>,
    session: Arc<Session>,
    tools: Vec<ToolDefinition>,
    resources: Vec<ResourceDefinition>,
    prompts: Vec<PromptTemplate>,
}

pub struct ConnectionManager {
    entries: RwLock<HashMap<String, ConnEntry>>,
    process: Arc<ProcessManager>,
    auth: Arc<Authenticator>,
    recorder: Arc<Recorder>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        process: Arc<ProcessManager>,
        auth: Arc<Authenticator>,
        recorder: Arc<Recorder>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            process,
            auth,
            recorder,
            events,
        }
    }

    /// Subscribe to status-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Connect to a server: open its transport, run the handshake, fetch
    /// the capability inventories once.
    ///
    /// Rejects while a connect is already in flight or established.
    pub async fn connect(&self, config: &ServerConfig) -> Result<ConnectionState> {
        if !config.enabled {
            return Err(Error::InvalidConfig(format!(
                "server {} is disabled",
                config.id
            )));
        }
        self.begin(&config.id, ConnectionStatus::Connecting).await?;
        self.emit(&config.id, ConnectionStatus::Connecting, None);

        match self.establish(config).await {
            Ok(established) => self.commit(config, established).await,
            Err(e) => {
                self.mark_error(&config.id, &e).await;
                Err(e)
            }
        }
    }

    /// Re-establish a connection after the health monitor declared it
    /// unhealthy. Unlike a fresh connect, the accumulated error count is
    /// preserved across the transition.
    pub async fn reconnect(&self, config: &ServerConfig) -> Result<ConnectionState> {
        let teardown = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(&config.id)
                .ok_or_else(|| Error::ServerNotFound(config.id.clone()))?;
            if entry.state.status == ConnectionStatus::Reconnecting {
                return Err(Error::AlreadyConnecting(config.id.clone()));
            }
            entry.state.status = ConnectionStatus::Reconnecting;
            entry.state.connected_at = None;
            entry.state.clear_inventory();
            (entry.session.take(), entry.transport.take())
        };
        close_channel(teardown).await;
        self.emit(&config.id, ConnectionStatus::Reconnecting, None);
        self.recorder.log(
            LogEntry::new(LogLevel::Info, LogCategory::Connection, "reconnecting")
                .server(&config.id),
        );

        match self.establish(config).await {
            Ok(established) => self.commit(config, established).await,
            Err(e) => {
                self.mark_error(&config.id, &e).await;
                Err(e)
            }
        }
    }

    /// Tear down the protocol channel. Stdio subprocesses keep running;
    /// stopping them is the process manager's call.
    pub async fn disconnect(&self, server_id: &str) -> Result<ConnectionState> {
        let (teardown, state) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(server_id)
                .ok_or_else(|| Error::NotConnected(server_id.to_string()))?;
            let teardown = (entry.session.take(), entry.transport.take());
            entry.state.status = ConnectionStatus::Disconnected;
            entry.state.connected_at = None;
            entry.state.clear_inventory();
            (teardown, entry.state.clone())
        };
        close_channel(teardown).await;

        self.emit(server_id, ConnectionStatus::Disconnected, None);
        self.recorder.log(
            LogEntry::new(LogLevel::Info, LogCategory::Connection, "disconnected")
                .server(server_id),
        );
        Ok(state)
    }

    /// Invoke a tool on a connected server. Calls to the same server are
    /// serialized; calls to different servers run concurrently.
    pub async fn invoke(&self, server_id: &str, tool: &str, arguments: Value) -> Result<Value> {
        let (session, invoke_lock) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(server_id)
                .ok_or_else(|| Error::NotConnected(server_id.to_string()))?;
            if entry.state.status != ConnectionStatus::Connected {
                return Err(Error::NotConnected(server_id.to_string()));
            }
            let session = entry
                .session
                .clone()
                .ok_or_else(|| Error::NotConnected(server_id.to_string()))?;
            (session, entry.invoke_lock.clone())
        };

        let _guard = invoke_lock.lock().await;
        let started = Instant::now();
        let result = session.call_tool(tool, arguments).await;
        self.recorder.metric(Metric {
            timestamp: Utc::now(),
            server_id: server_id.to_string(),
            server_name: None,
            operation: format!("tools/call {tool}"),
            duration_ms: started.elapsed().as_millis() as u64,
            success: result.is_ok(),
        });

        if let Err(e) = &result {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(server_id) {
                entry.state.error_count += 1;
                entry.state.last_error = Some(e.to_string());
            }
        }
        result
    }

    /// Liveness probe on the established session, for the health monitor.
    pub async fn ping(&self, server_id: &str) -> Result<()> {
        let session = {
            let entries = self.entries.read().await;
            entries
                .get(server_id)
                .filter(|e| e.state.status == ConnectionStatus::Connected)
                .and_then(|e| e.session.clone())
                .ok_or_else(|| Error::NotConnected(server_id.to_string()))?
        };
        session.ping().await
    }

    pub async fn state(&self, server_id: &str) -> Option<ConnectionState> {
        let entries = self.entries.read().await;
        entries.get(server_id).map(|e| e.state.clone())
    }

    pub async fn list(&self) -> Vec<ConnectionState> {
        let entries = self.entries.read().await;
        entries.values().map(|e| e.state.clone()).collect()
    }

    /// Reset the error counter and last error for a server.
    pub async fn clear_errors(&self, server_id: &str) -> Result<ConnectionState> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(server_id)
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;
        entry.state.error_count = 0;
        entry.state.last_error = None;
        Ok(entry.state.clone())
    }

    /// Drop all connection state for a server. Part of the removal
    /// cascade.
    pub async fn remove(&self, server_id: &str) {
        let teardown = {
            let mut entries = self.entries.write().await;
            entries
                .remove(server_id)
                .map(|mut e| (e.session.take(), e.transport.take()))
        };
        if let Some(teardown) = teardown {
            close_channel(teardown).await;
        }
    }

    /// Guarded entry into a connecting state.
    async fn begin(&self, server_id: &str, status: ConnectionStatus) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(server_id.to_string())
            .or_insert_with(|| ConnEntry::new(server_id));
        match entry.state.status {
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                return Err(Error::AlreadyConnecting(server_id.to_string()));
            }
            ConnectionStatus::Connected => {
                return Err(Error::AlreadyConnected(server_id.to_string()));
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
        }
        entry.state.status = status;
        entry.state.last_error = None;
        Ok(())
    }

    /// Open the transport and run the handshake plus the single
    /// inventory fetch.
    async fn establish(&self, config: &ServerConfig) -> Result<Established> {
        let mut transport = self.open_transport(config).await?;
        let (rx, writer) = transport.connect().await?;
        let session = Arc::new(Session::start(rx, writer));

        tokio::time::timeout(HANDSHAKE_TIMEOUT, session.initialize())
            .await
            .map_err(|_| Error::Timeout(HANDSHAKE_TIMEOUT))??;

        // One fetch per connect. A server that does not implement one of
        // the list methods simply has an empty inventory for it.
        let tools = session.list_tools().await.unwrap_or_else(|e| {
            tracing::debug!(server_id = %config.id, "tools/list failed: {e}");
            Vec::new()
        });
        let resources = session.list_resources().await.unwrap_or_else(|e| {
            tracing::debug!(server_id = %config.id, "resources/list failed: {e}");
            Vec::new()
        });
        let prompts = session.list_prompts().await.unwrap_or_else(|e| {
            tracing::debug!(server_id = %config.id, "prompts/list failed: {e}");
            Vec::new()
        });

        Ok(Established {
            transport,
            session,
            tools,
            resources,
            prompts,
        })
    }

    async fn open_transport(&self, config: &ServerConfig) -> Result<Box<dyn Transport>> {
        match &config.transport {
            TransportConfig::Stdio { .. } => {
                self.process.ensure_running(config).await?;
                let (stdin, stdout) = match self.process.take_io(&config.id).await {
                    Ok(io) => io,
                    // The pipes of this spawn went to a previous channel;
                    // only a fresh spawn produces new ones.
                    Err(Error::Transport(_)) => {
                        self.process.restart(config).await?;
                        self.process.take_io(&config.id).await?
                    }
                    Err(e) => return Err(e),
                };
                Ok(Box::new(StdioTransport::new(stdin, stdout)))
            }
            TransportConfig::Sse {
                url,
                headers,
                sse_endpoint,
                post_endpoint,
            } => {
                let bearer = self.bearer_for(config).await?;
                let headers = build_headers(headers.as_ref(), bearer.as_deref())?;
                Ok(Box::new(SseTransport::new(
                    sse_endpoint.clone().unwrap_or_else(|| url.clone()),
                    post_endpoint.clone().unwrap_or_else(|| url.clone()),
                    headers,
                )))
            }
            TransportConfig::Http {
                url,
                method,
                headers,
                timeout_secs,
            } => {
                let bearer = self.bearer_for(config).await?;
                let headers = build_headers(headers.as_ref(), bearer.as_deref())?;
                Ok(Box::new(HttpTransport::new(
                    url.clone(),
                    *method,
                    headers,
                    Duration::from_secs(*timeout_secs),
                )))
            }
        }
    }

    /// Bearer token for a server configured with OAuth. Fails fast before
    /// opening the transport when the token is missing or unrecoverably
    /// expired.
    async fn bearer_for(&self, config: &ServerConfig) -> Result<Option<String>> {
        if config.oauth.is_none() {
            return Ok(None);
        }
        let token = self.auth.valid_token(&config.id).await?;
        Ok(Some(token.access_token))
    }

    async fn commit(&self, config: &ServerConfig, established: Established) -> Result<ConnectionState> {
        // The entry may have been removed (or externally torn down)
        // while the handshake was in flight. Committing would resurrect
        // it, so the fresh channel is discarded instead.
        let outcome = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&config.id) {
                Some(entry)
                    if matches!(
                        entry.state.status,
                        ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
                    ) =>
                {
                    entry.transport = Some(established.transport);
                    entry.session = Some(established.session);
                    entry.state.status = ConnectionStatus::Connected;
                    entry.state.connected_at = Some(Utc::now());
                    entry.state.tools = established.tools;
                    entry.state.resources = established.resources;
                    entry.state.prompts = established.prompts;
                    Ok(entry.state.clone())
                }
                _ => Err(established),
            }
        };

        let state = match outcome {
            Ok(state) => state,
            Err(established) => {
                close_channel((Some(established.session), Some(established.transport))).await;
                return Err(Error::ServerNotFound(config.id.clone()));
            }
        };

        self.emit(&config.id, ConnectionStatus::Connected, None);
        self.recorder.log(
            LogEntry::new(LogLevel::Info, LogCategory::Connection, "connected")
                .server(&config.id)
                .detail(serde_json::json!({
                    "tools": state.tools.len(),
                    "resources": state.resources.len(),
                    "prompts": state.prompts.len(),
                })),
        );
        Ok(state)
    }

    async fn mark_error(&self, server_id: &str, error: &Error) {
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(server_id) {
                entry.state.status = ConnectionStatus::Error;
                entry.state.connected_at = None;
                entry.state.last_error = Some(error.to_string());
                entry.state.error_count += 1;
                entry.state.clear_inventory();
                entry.session = None;
                entry.transport = None;
            }
        }
        self.emit(server_id, ConnectionStatus::Error, Some(error.to_string()));
        self.recorder.log(
            LogEntry::new(
                LogLevel::Error,
                LogCategory::Connection,
                "connection failed",
            )
            .server(server_id)
            .captured(CapturedError {
                name: error_name(error).to_string(),
                message: error.to_string(),
                stack: None,
            }),
        );
    }

    fn emit(&self, server_id: &str, status: ConnectionStatus, error: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(ConnectionEvent {
            server_id: server_id.to_string(),
            status,
            error,
        });
    }
}

/// Stable short name for an error, for the captured-error log field.
fn error_name(error: &Error) -> &'static str {
    match error {
        Error::ProcessSpawnFailed(_) => "spawn-failed",
        Error::Timeout(_) => "timeout",
        Error::Rpc { .. } => "rpc",
        Error::ChannelClosed => "channel-closed",
        Error::AuthenticationRequired(_)
        | Error::AuthStateMismatch
        | Error::AuthExchangeFailed(_) => "auth",
        Error::Transport(_) => "transport",
        _ => "other",
    }
}

async fn close_channel(teardown: (Option<Arc<Session>>, Option<Box<dyn Transport>>)) {
    let (session, transport) = teardown;
    if let Some(session) = session {
        session.close();
    }
    if let Some(mut transport) = transport {
        if let Err(e) = transport.close().await {
            tracing::debug!("transport close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::config::OAuthConfig;
    use std::collections::HashMap as StdHashMap;

    fn manager() -> ConnectionManager {
        let recorder = Arc::new(Recorder::new());
        let storage: Arc<dyn crate::storage::Storage> = Arc::new(MemoryStorage::new());
        ConnectionManager::new(
            Arc::new(ProcessManager::new(recorder.clone())),
            Arc::new(Authenticator::new(storage, recorder.clone())),
            recorder,
        )
    }

    fn stdio_config(id: &str, command: &str) -> ServerConfig {
        let mut config = ServerConfig::new(
            id,
            TransportConfig::Stdio {
                command: command.into(),
                args: vec![],
                env: StdHashMap::new(),
                cwd: None,
            },
        );
        config.id = id.to_string();
        config
    }

    #[tokio::test]
    async fn failed_connect_marks_error_and_counts() {
        let mgr = manager();
        let config = stdio_config("c1", "definitely-not-a-real-binary-xyz");

        let err = mgr.connect(&config).await.unwrap_err();
        assert!(matches!(err, Error::ProcessSpawnFailed(_)));

        let state = mgr.state("c1").await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.error_count, 1);
        assert!(state.last_error.is_some());
        assert!(state.tools.is_empty());
    }

    #[tokio::test]
    async fn failed_connects_accumulate_until_cleared() {
        let mgr = manager();
        let config = stdio_config("c2", "definitely-not-a-real-binary-xyz");

        let _ = mgr.connect(&config).await;
        let _ = mgr.connect(&config).await;
        assert_eq!(mgr.state("c2").await.unwrap().error_count, 2);

        let state = mgr.clear_errors("c2").await.unwrap();
        assert_eq!(state.error_count, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn disabled_server_is_rejected() {
        let mgr = manager();
        let mut config = stdio_config("c3", "cat");
        config.enabled = false;

        let err = mgr.connect(&config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(mgr.state("c3").await.is_none(), "no entry for rejected connect");
    }

    #[tokio::test]
    async fn invoke_requires_connection() {
        let mgr = manager();
        let err = mgr
            .invoke("nope", "tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn disconnect_unknown_server_fails() {
        let mgr = manager();
        let err = mgr.disconnect("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn oauth_server_without_token_fails_before_transport() {
        let mgr = manager();
        let mut config = ServerConfig::new(
            "c4",
            TransportConfig::Http {
                url: "https://example.com/mcp".into(),
                method: Default::default(),
                headers: None,
                timeout_secs: 30,
            },
        );
        config.id = "c4".into();
        config.oauth = Some(OAuthConfig {
            client_id: "x".into(),
            authorize_url: "https://auth.example.com/authorize".into(),
            token_url: "https://auth.example.com/token".into(),
            redirect_uri: "http://127.0.0.1:1/cb".into(),
            scopes: vec![],
        });

        let err = mgr.connect(&config).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationRequired(_)));
        assert_eq!(
            mgr.state("c4").await.unwrap().status,
            ConnectionStatus::Error
        );
    }

    #[tokio::test]
    async fn events_trace_the_failed_connect() {
        let mgr = manager();
        let mut events = mgr.subscribe();
        let config = stdio_config("c5", "definitely-not-a-real-binary-xyz");

        let _ = mgr.connect(&config).await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.status, ConnectionStatus::Connecting);
        let second = events.recv().await.unwrap();
        assert_eq!(second.status, ConnectionStatus::Error);
        assert!(second.error.is_some());
    }

    // `cat` echoes every request frame back with its own id and no
    // "error" member, which the session accepts as a successful reply.
    // That makes it a minimal stand-in server for the connected path.
    #[tokio::test]
    async fn connect_with_echo_server_reaches_connected() {
        let mgr = manager();
        let config = stdio_config("e1", "cat");

        let state = mgr.connect(&config).await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert!(state.connected_at.is_some());
        assert!(state.tools.is_empty(), "echo server advertises nothing");

        mgr.remove("e1").await;
    }

    #[tokio::test]
    async fn second_connect_is_rejected_while_connected() {
        let mgr = manager();
        let config = stdio_config("e2", "cat");

        mgr.connect(&config).await.unwrap();
        let err = mgr.connect(&config).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected(_)));

        mgr.remove("e2").await;
    }

    #[tokio::test]
    async fn disconnect_leaves_subprocess_running() {
        let recorder = Arc::new(Recorder::new());
        let process = Arc::new(ProcessManager::new(recorder.clone()));
        let storage: Arc<dyn crate::storage::Storage> = Arc::new(MemoryStorage::new());
        let mgr = ConnectionManager::new(
            process.clone(),
            Arc::new(Authenticator::new(storage, recorder.clone())),
            recorder,
        );
        let config = stdio_config("e3", "cat");

        mgr.connect(&config).await.unwrap();
        let state = mgr.disconnect("e3").await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.tools.is_empty());

        let proc_state = process.state("e3").await.unwrap();
        assert_eq!(
            proc_state.lifecycle,
            crate::types::process::Lifecycle::Running,
            "channel teardown must not stop the process"
        );

        process.remove("e3").await;
    }

    #[tokio::test]
    async fn invoke_round_trips_through_echo_server() {
        let mgr = manager();
        let config = stdio_config("e4", "cat");
        mgr.connect(&config).await.unwrap();

        // The echoed frame carries no "result", so the value is null;
        // what matters is that the call completes without error.
        let value = mgr
            .invoke("e4", "do_thing", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert!(value.is_null());

        mgr.remove("e4").await;
    }

    #[tokio::test]
    async fn reconnect_preserves_error_count() {
        let mgr = manager();
        let config = stdio_config("e5", "cat");
        mgr.connect(&config).await.unwrap();

        // Seed some accumulated errors.
        {
            let mut entries = mgr.entries.write().await;
            entries.get_mut("e5").unwrap().state.error_count = 3;
        }

        let state = mgr.reconnect(&config).await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.error_count, 3, "reconnect must not reset the count");

        mgr.remove("e5").await;
    }

    #[tokio::test]
    async fn reconnect_requires_existing_entry() {
        let mgr = manager();
        let config = stdio_config("c6", "cat");
        let err = mgr.reconnect(&config).await.unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn remove_during_handshake_does_not_resurrect_entry() {
        let recorder = Arc::new(Recorder::new());
        let process = Arc::new(ProcessManager::new(recorder.clone()));
        let storage: Arc<dyn crate::storage::Storage> = Arc::new(MemoryStorage::new());
        let mgr = Arc::new(ConnectionManager::new(
            process.clone(),
            Arc::new(Authenticator::new(storage, recorder.clone())),
            recorder,
        ));

        // The shell buffers stdin until `exec cat`, so the handshake
        // stays in flight long enough to race a removal against it.
        let mut config = stdio_config("e6", "sh");
        if let TransportConfig::Stdio { args, .. } = &mut config.transport {
            *args = vec!["-c".into(), "sleep 0.7; exec cat".into()];
        }

        let task = {
            let mgr = mgr.clone();
            let config = config.clone();
            tokio::spawn(async move { mgr.connect(&config).await })
        };
        tokio::time::sleep(Duration::from_millis(450)).await;
        mgr.remove("e6").await;

        let result = task.await.unwrap();
        assert!(
            matches!(result, Err(Error::ServerNotFound(_))),
            "connect after removal must fail, got {result:?}"
        );
        assert!(
            mgr.state("e6").await.is_none(),
            "removal must stick even with a connect in flight"
        );

        process.remove("e6").await;
    }

    #[tokio::test]
    async fn remove_drops_connection_state() {
        let mgr = manager();
        let config = stdio_config("c7", "definitely-not-a-real-binary-xyz");
        let _ = mgr.connect(&config).await;
        assert!(mgr.state("c7").await.is_some());

        mgr.remove("c7").await;
        assert!(mgr.state("c7").await.is_none());
    }
}
