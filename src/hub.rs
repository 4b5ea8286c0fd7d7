//! The hub: server registry plus a typed surface over every subsystem.
//!
//! The host application constructs one [`Hub`] with its storage backend
//! and drives everything through it. The registry is the single source
//! of truth for configurations; connection, process, auth and health
//! state are keyed by the immutable server id.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::auth::Authenticator;
use crate::config::{self, BatchOutcome, ConfigFormat, MergeOutcome, ParseOutcome};
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, HealthOptions};
use crate::process::ProcessManager;
use crate::recorder::Recorder;
use crate::storage::{self, keys, Storage};
use crate::types::config::{OAuthConfig, ServerConfig};
use crate::types::connection::{ConnectionEvent, ConnectionState};
use crate::types::oauth::{AuthorizationRequest, CallbackParams, OAuthToken};
use crate::types::process::ProcessState;
use crate::types::telemetry::{LogEntry, LogFilter, Metric, ServerStats};

pub struct Hub {
    storage: Arc<dyn Storage>,
    recorder: Arc<Recorder>,
    process: Arc<ProcessManager>,
    auth: Arc<Authenticator>,
    connections: Arc<ConnectionManager>,
    health: Arc<HealthMonitor>,
    servers: RwLock<Vec<ServerConfig>>,
}

impl Hub {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_health_options(storage, HealthOptions::default())
    }

    pub fn with_health_options(storage: Arc<dyn Storage>, options: HealthOptions) -> Self {
        let recorder = Arc::new(Recorder::new());
        let process = Arc::new(ProcessManager::new(recorder.clone()));
        let auth = Arc::new(Authenticator::new(storage.clone(), recorder.clone()));
        let connections = Arc::new(ConnectionManager::new(
            process.clone(),
            auth.clone(),
            recorder.clone(),
        ));
        let health = Arc::new(HealthMonitor::with_options(
            connections.clone(),
            recorder.clone(),
            options,
        ));
        let servers: Vec<ServerConfig> = storage::load_or_default(&*storage, keys::SERVERS);
        Self {
            storage,
            recorder,
            process,
            auth,
            connections,
            health,
            servers: RwLock::new(servers),
        }
    }

    // ----- registry -----

    /// Register a server. The configuration is validated (clamping where
    /// the rules say so) and persisted.
    pub async fn add_server(&self, mut config: ServerConfig) -> Result<ServerConfig> {
        config.validate()?;
        let mut servers = self.servers.write().await;
        if servers.iter().any(|s| s.id == config.id) {
            return Err(Error::InvalidConfig(format!(
                "server id {} already registered",
                config.id
            )));
        }
        servers.push(config.clone());
        storage::store(&*self.storage, keys::SERVERS, &*servers);
        Ok(config)
    }

    /// Replace a server's configuration in place. The id is immutable;
    /// `updated_at` advances monotonically.
    pub async fn update_server(&self, mut config: ServerConfig) -> Result<ServerConfig> {
        config.validate()?;
        let mut servers = self.servers.write().await;
        let slot = servers
            .iter_mut()
            .find(|s| s.id == config.id)
            .ok_or_else(|| Error::ServerNotFound(config.id.clone()))?;
        config.created_at = slot.created_at;
        config.updated_at = slot.updated_at;
        config.touch();
        *slot = config.clone();
        storage::store(&*self.storage, keys::SERVERS, &*servers);
        Ok(config)
    }

    /// Remove a server and cascade: its watcher, connection, subprocess
    /// and tokens all go with it.
    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        {
            let mut servers = self.servers.write().await;
            let before = servers.len();
            servers.retain(|s| s.id != server_id);
            if servers.len() == before {
                return Err(Error::ServerNotFound(server_id.to_string()));
            }
            storage::store(&*self.storage, keys::SERVERS, &*servers);
        }
        self.health.unwatch(server_id).await;
        self.connections.remove(server_id).await;
        self.process.remove(server_id).await;
        self.auth.revoke(server_id).await;
        self.push_history(server_id, "removed");
        Ok(())
    }

    pub async fn server(&self, server_id: &str) -> Result<ServerConfig> {
        let servers = self.servers.read().await;
        servers
            .iter()
            .find(|s| s.id == server_id)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))
    }

    pub async fn list_servers(&self) -> Vec<ServerConfig> {
        self.servers.read().await.clone()
    }

    // ----- connections -----

    pub async fn connect(&self, server_id: &str) -> Result<ConnectionState> {
        let config = self.server(server_id).await?;
        let state = self.connections.connect(&config).await?;
        self.health.watch(config).await;
        self.push_history(server_id, "connected");
        Ok(state)
    }

    pub async fn disconnect(&self, server_id: &str) -> Result<ConnectionState> {
        self.health.unwatch(server_id).await;
        let state = self.connections.disconnect(server_id).await?;
        self.push_history(server_id, "disconnected");
        Ok(state)
    }

    /// Operator-requested reconnect; no backoff. Re-arms the health
    /// watcher, which may have deregistered after giving up.
    pub async fn reconnect(&self, server_id: &str) -> Result<ConnectionState> {
        let config = self.server(server_id).await?;
        self.health.manual_reconnect(&config).await?;
        self.health.watch(config).await;
        self.connections
            .state(server_id)
            .await
            .ok_or_else(|| Error::NotConnected(server_id.to_string()))
    }

    pub async fn invoke_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value> {
        self.connections.invoke(server_id, tool, arguments).await
    }

    pub async fn connection_state(&self, server_id: &str) -> Option<ConnectionState> {
        self.connections.state(server_id).await
    }

    pub async fn list_connections(&self) -> Vec<ConnectionState> {
        self.connections.list().await
    }

    pub async fn clear_connection_errors(&self, server_id: &str) -> Result<ConnectionState> {
        self.connections.clear_errors(server_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    // ----- processes -----

    pub async fn start_process(&self, server_id: &str) -> Result<ProcessState> {
        let config = self.server(server_id).await?;
        self.process.ensure_running(&config).await
    }

    pub async fn stop_process(&self, server_id: &str, force: bool) -> Result<ProcessState> {
        self.process.stop(server_id, force).await
    }

    pub async fn restart_process(&self, server_id: &str) -> Result<ProcessState> {
        let config = self.server(server_id).await?;
        self.process.restart(&config).await
    }

    pub async fn process_state(&self, server_id: &str) -> Option<ProcessState> {
        self.process.state(server_id).await
    }

    pub async fn list_processes(&self) -> Vec<ProcessState> {
        self.process.list().await
    }

    // ----- oauth -----

    /// Begin the authorization flow for a server configured with OAuth.
    pub async fn start_oauth_flow(&self, server_id: &str) -> Result<AuthorizationRequest> {
        let config = self.server(server_id).await?;
        let oauth: &OAuthConfig = config.oauth.as_ref().ok_or_else(|| {
            Error::InvalidConfig(format!("server {server_id} has no OAuth configuration"))
        })?;
        self.auth.start_flow(server_id, oauth).await
    }

    pub async fn complete_oauth_flow(&self, params: CallbackParams) -> Result<OAuthToken> {
        self.auth.complete_flow(params).await
    }

    pub async fn refresh_token(&self, server_id: &str) -> Result<OAuthToken> {
        self.auth.refresh(server_id).await
    }

    pub async fn oauth_token(&self, server_id: &str) -> Option<OAuthToken> {
        self.auth.token(server_id).await
    }

    pub async fn revoke_token(&self, server_id: &str) {
        self.auth.revoke(server_id).await;
    }

    // ----- configuration import/export -----

    pub fn parse_config(&self, content: &str) -> Result<ParseOutcome> {
        config::parse(content)
    }

    pub fn parse_config_files(&self, files: &[(String, String)]) -> Result<BatchOutcome> {
        config::parse_files(files)
    }

    /// Merge imported servers into the registry. Existing entries win;
    /// the merge is idempotent.
    pub async fn import_servers(&self, incoming: Vec<ServerConfig>) -> Result<MergeOutcome> {
        let mut incoming = incoming;
        for server in &mut incoming {
            server.validate()?;
        }
        let mut servers = self.servers.write().await;
        let outcome = config::merge(servers.clone(), incoming);
        *servers = outcome.merged.clone();
        storage::store(&*self.storage, keys::SERVERS, &*servers);
        Ok(outcome)
    }

    pub async fn export_config(&self, format: ConfigFormat) -> Result<String> {
        let servers = self.servers.read().await;
        config::export(&servers, format)
    }

    // ----- telemetry -----

    pub fn record_log(&self, entry: LogEntry) {
        self.recorder.log(entry);
    }

    pub fn record_metric(&self, metric: Metric) {
        self.recorder.metric(metric);
    }

    pub fn query_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.recorder.query(filter)
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.recorder.metrics()
    }

    pub fn server_stats(&self) -> Vec<ServerStats> {
        self.recorder.aggregate()
    }

    pub fn clear_telemetry(&self) {
        self.recorder.clear();
    }

    pub fn export_telemetry(&self) -> String {
        self.recorder.export()
    }

    /// Snapshot the debug log and metrics into storage under
    /// [`keys::LOGS`].
    pub fn persist_telemetry(&self) {
        self.storage.set(keys::LOGS, self.recorder.export());
    }

    /// The persisted connection history, oldest first.
    pub fn connection_history(&self) -> Vec<Value> {
        storage::load_or_default(&*self.storage, keys::CONNECTION_HISTORY)
    }

    // ----- shutdown -----

    /// Tear everything down: watchers, channels, subprocesses. The
    /// registry and tokens stay persisted for the next start.
    pub async fn shutdown(&self) {
        // Final process snapshot, so the next start can show what was
        // running when the app closed.
        let processes = self.process.list().await;
        storage::store(&*self.storage, keys::PROCESSES, &processes);
        self.persist_telemetry();

        let ids: Vec<String> = {
            let servers = self.servers.read().await;
            servers.iter().map(|s| s.id.clone()).collect()
        };
        for id in ids {
            self.health.unwatch(&id).await;
            self.connections.remove(&id).await;
            self.process.remove(&id).await;
        }
    }

    fn push_history(&self, server_id: &str, event: &str) {
        storage::push_history(
            &*self.storage,
            serde_json::json!({
                "serverId": server_id,
                "event": event,
                "timestamp": Utc::now(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthOptions;
    use crate::storage::MemoryStorage;
    use crate::types::config::TransportConfig;
    use crate::types::connection::ConnectionStatus;
    use crate::types::process::Lifecycle;
    use std::collections::HashMap;
    use std::time::Duration;

    fn hub_on(storage: Arc<dyn Storage>) -> Hub {
        Hub::with_health_options(
            storage,
            HealthOptions {
                probe_interval: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    fn hub() -> Hub {
        hub_on(Arc::new(MemoryStorage::new()))
    }

    fn stdio_config(name: &str, command: &str) -> ServerConfig {
        ServerConfig::new(
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    #[tokio::test]
    async fn registry_persists_across_instances() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let id = {
            let hub = hub_on(storage.clone());
            let added = hub.add_server(stdio_config("echo", "cat")).await.unwrap();
            added.id
        };

        let hub = hub_on(storage);
        let servers = hub.list_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, id);
        assert_eq!(servers[0].name, "echo");
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let hub = hub();
        let config = stdio_config("a", "cat");
        hub.add_server(config.clone()).await.unwrap();
        let err = hub.add_server(config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn update_advances_updated_at() {
        let hub = hub();
        let added = hub.add_server(stdio_config("a", "cat")).await.unwrap();

        let mut changed = added.clone();
        changed.description = Some("echo server".into());
        let updated = hub.update_server(changed).await.unwrap();
        assert!(updated.updated_at > added.updated_at);
        assert_eq!(updated.created_at, added.created_at);
    }

    #[tokio::test]
    async fn connect_unknown_server_fails() {
        let hub = hub();
        let err = hub.connect("missing").await.unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn connect_invoke_disconnect_round_trip() {
        let hub = hub();
        let added = hub.add_server(stdio_config("echo", "cat")).await.unwrap();

        let state = hub.connect(&added.id).await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(hub.health.watched().await, vec![added.id.clone()]);

        let value = hub
            .invoke_tool(&added.id, "noop", serde_json::json!({}))
            .await
            .unwrap();
        assert!(value.is_null());

        let state = hub.disconnect(&added.id).await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(hub.health.watched().await.is_empty());
        // Channel teardown leaves the process alive.
        assert_eq!(
            hub.process_state(&added.id).await.unwrap().lifecycle,
            Lifecycle::Running
        );

        let history = hub.connection_history();
        let events: Vec<_> = history.iter().map(|e| e["event"].clone()).collect();
        assert!(events.contains(&serde_json::json!("connected")));
        assert!(events.contains(&serde_json::json!("disconnected")));

        hub.remove_server(&added.id).await.unwrap();
    }

    #[tokio::test]
    async fn manual_reconnect_rearms_health_watcher() {
        let hub = hub();
        let added = hub.add_server(stdio_config("echo", "cat")).await.unwrap();
        hub.connect(&added.id).await.unwrap();

        // Simulate a watcher that gave up after exhausting its
        // reconnect attempts.
        hub.health.unwatch(&added.id).await;
        assert!(hub.health.watched().await.is_empty());

        let state = hub.reconnect(&added.id).await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(hub.health.watched().await, vec![added.id.clone()]);

        hub.remove_server(&added.id).await.unwrap();
    }

    #[tokio::test]
    async fn remove_server_cascades_everywhere() {
        let hub = hub();
        let added = hub.add_server(stdio_config("echo", "cat")).await.unwrap();
        hub.connect(&added.id).await.unwrap();

        hub.remove_server(&added.id).await.unwrap();
        assert!(hub.list_servers().await.is_empty());
        assert!(hub.connection_state(&added.id).await.is_none());
        assert!(hub.process_state(&added.id).await.is_none());
        assert!(hub.health.watched().await.is_empty());
        assert!(hub.oauth_token(&added.id).await.is_none());
    }

    #[tokio::test]
    async fn import_is_idempotent() {
        let hub = hub();
        let content = r#"{
            "mcpServers": {
                "filesystem": {"command": "npx", "args": ["server-fs"]},
                "remote": {"url": "https://mcp.example.com/sse"}
            }
        }"#;
        let parsed = hub.parse_config(content).unwrap();
        assert_eq!(parsed.servers.len(), 2);

        let first = hub.import_servers(parsed.servers.clone()).await.unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(first.skipped, 0);

        // Re-parsing yields fresh ids, but the dedup key is identity by
        // (name, transport, defining field), so nothing is added twice.
        let reparsed = hub.parse_config(content).unwrap();
        let second = hub.import_servers(reparsed.servers).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(hub.list_servers().await.len(), 2);
    }

    #[tokio::test]
    async fn export_round_trips_through_parse() {
        let hub = hub();
        hub.add_server(stdio_config("fs", "npx")).await.unwrap();

        let exported = hub.export_config(ConfigFormat::ClaudeDesktop).await.unwrap();
        let parsed = hub.parse_config(&exported).unwrap();
        assert_eq!(parsed.format, ConfigFormat::ClaudeDesktop);
        assert_eq!(parsed.servers.len(), 1);
        assert_eq!(parsed.servers[0].name, "fs");
    }

    #[tokio::test]
    async fn oauth_flow_requires_configuration() {
        let hub = hub();
        let added = hub.add_server(stdio_config("a", "cat")).await.unwrap();
        let err = hub.start_oauth_flow(&added.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_everything_but_keeps_registry() {
        let hub = hub();
        let added = hub.add_server(stdio_config("echo", "cat")).await.unwrap();
        hub.connect(&added.id).await.unwrap();

        hub.shutdown().await;
        assert!(hub.connection_state(&added.id).await.is_none());
        assert!(hub.process_state(&added.id).await.is_none());
        assert_eq!(hub.list_servers().await.len(), 1);
    }
}
