//! End-to-end scenarios against the public hub surface.
//!
//! Stdio servers in these tests are plain `cat`: every JSON-RPC request
//! is echoed back with its own id and no error member, which the session
//! treats as a successful (empty) reply. That covers the full connect,
//! probe and invoke paths without a real MCP server binary.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use mcp_hub_core::config::ConfigFormat;
use mcp_hub_core::health::HealthOptions;
use mcp_hub_core::storage::{MemoryStorage, Storage};
use mcp_hub_core::types::{
    ConnectionStatus, Lifecycle, LogFilter, ServerConfig, TransportConfig,
};
use mcp_hub_core::{Error, Hub};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_hub(storage: Arc<dyn Storage>) -> Hub {
    Hub::with_health_options(
        storage,
        HealthOptions {
            probe_interval: Duration::from_millis(40),
            failure_threshold: 2,
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(50),
            max_reconnect_attempts: 3,
        },
    )
}

fn echo_server(name: &str) -> ServerConfig {
    ServerConfig::new(
        name,
        TransportConfig::Stdio {
            command: "cat".into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        },
    )
}

#[tokio::test]
async fn full_lifecycle_against_echo_server() {
    init_tracing();
    let hub = fast_hub(Arc::new(MemoryStorage::new()));
    let server = hub.add_server(echo_server("echo")).await.unwrap();

    let state = hub.connect(&server.id).await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert!(state.connected_at.is_some());

    // Second connect is refused while established.
    let err = hub.connect(&server.id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyConnected(_)));

    let reply = hub
        .invoke_tool(&server.id, "anything", serde_json::json!({"k": "v"}))
        .await
        .unwrap();
    assert!(reply.is_null());

    // Disconnect tears down the channel but not the process.
    let state = hub.disconnect(&server.id).await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(
        hub.process_state(&server.id).await.unwrap().lifecycle,
        Lifecycle::Running
    );

    // Reconnecting after a disconnect restarts the process to obtain
    // fresh pipes.
    let state = hub.connect(&server.id).await.unwrap();
    assert_eq!(state.status, ConnectionStatus::Connected);

    hub.remove_server(&server.id).await.unwrap();
    assert!(hub.process_state(&server.id).await.is_none());
    assert!(hub.connection_state(&server.id).await.is_none());
}

#[tokio::test]
async fn killed_process_is_reconnected_by_health_monitor() {
    init_tracing();
    let hub = fast_hub(Arc::new(MemoryStorage::new()));
    let server = hub.add_server(echo_server("flaky")).await.unwrap();
    hub.connect(&server.id).await.unwrap();

    // Pull the process out from under the connection.
    hub.stop_process(&server.id, true).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(state) = hub.connection_state(&server.id).await {
            if state.status == ConnectionStatus::Connected && state.connected_at.is_some() {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "health monitor did not recover the connection"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The recovery left a trace in the debug log.
    let logs = hub.query_logs(&LogFilter {
        text: Some("reconnect".into()),
        ..Default::default()
    });
    assert!(!logs.is_empty());

    hub.remove_server(&server.id).await.unwrap();
}

#[tokio::test]
async fn import_from_files_and_export_round_trip() {
    init_tracing();
    let hub = fast_hub(Arc::new(MemoryStorage::new()));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("claude_desktop_config.json");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(
        br#"{
            "mcpServers": {
                "filesystem": {"command": "npx", "args": ["server-fs", "/tmp"]},
                "remote": {"url": "https://mcp.example.com/sse"}
            }
        }"#,
    )
    .unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let batch = hub
        .parse_config_files(&[(path.display().to_string(), content)])
        .unwrap();
    assert_eq!(batch.total_servers, 2);

    let servers: Vec<ServerConfig> = batch
        .files
        .into_iter()
        .filter_map(|f| f.outcome)
        .flat_map(|o| o.servers)
        .collect();
    let provenance = servers[0].provenance.as_ref().unwrap();
    assert!(provenance.source_path.is_some());

    let outcome = hub.import_servers(servers).await.unwrap();
    assert_eq!(outcome.added, 2);

    let exported = hub.export_config(ConfigFormat::ClaudeDesktop).await.unwrap();
    let parsed = hub.parse_config(&exported).unwrap();
    assert_eq!(parsed.servers.len(), 2);
}

#[tokio::test]
async fn registry_survives_restart_with_same_storage() {
    init_tracing();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    let id = {
        let hub = fast_hub(storage.clone());
        let server = hub.add_server(echo_server("persistent")).await.unwrap();
        hub.connect(&server.id).await.unwrap();
        hub.shutdown().await;
        server.id
    };

    let hub = fast_hub(storage);
    let servers = hub.list_servers().await;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, id);
    // Shutdown tore down the runtime state; nothing reconnects on its own.
    assert!(hub.connection_state(&id).await.is_none());
}
