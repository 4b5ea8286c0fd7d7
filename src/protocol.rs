//! JSON-RPC session over a connected transport.
//!
//! Routes incoming frames to pending request futures by id; frames that
//! are not responses (server notifications) are logged and dropped, as
//! nothing in this core consumes them yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::TransportWriter;
use crate::types::connection::{PromptTemplate, ResourceDefinition, ToolDefinition};

/// Bound on any single request round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MCP protocol revision spoken during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct Session {
    writer: TransportWriter,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl Session {
    /// Take ownership of a freshly connected transport channel and start
    /// the frame router.
    pub fn start(rx: mpsc::Receiver<Result<Value>>, writer: TransportWriter) -> Self {
        let session = Self {
            writer,
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            request_timeout: REQUEST_TIMEOUT,
        };
        session.spawn_router(rx);
        session
    }

    fn spawn_router(&self, mut rx: mpsc::Receiver<Result<Value>>) {
        let pending = self.pending.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = rx.recv() => {
                        match frame {
                            Some(Ok(value)) => route_frame(&pending, value).await,
                            Some(Err(e)) => {
                                tracing::debug!("transport error, failing pending requests: {e}");
                                fail_all_pending(&pending).await;
                            }
                            None => {
                                // The transport is gone; anything pending
                                // and anything issued later must fail.
                                fail_all_pending(&pending).await;
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Issue a request and wait for the matching response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.cancel.is_cancelled() {
            return Err(Error::ChannelClosed);
        }
        let id = generate_request_id();
        let mut frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if !params.is_null() {
            frame["params"] = params;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        if let Err(e) = self.writer.write(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                return Err(Error::ChannelClosed);
            }
            outcome = tokio::time::timeout(self.request_timeout, rx) => match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => return Err(Error::ChannelClosed),
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    return Err(Error::Timeout(self.request_timeout));
                }
            }
        };

        if let Some(error) = response.get("error") {
            return Err(Error::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let mut frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if !params.is_null() {
            frame["params"] = params;
        }
        self.writer.write(frame).await
    }

    /// The MCP handshake: `initialize` followed by the initialized
    /// notification. Returns the server's reported info.
    pub async fn initialize(&self) -> Result<Value> {
        let result = self
            .request(
                "initialize",
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-hub-core",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        self.notify("notifications/initialized", Value::Null).await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.request("tools/list", Value::Null).await?;
        parse_list(result, "tools")
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>> {
        let result = self.request("resources/list", Value::Null).await?;
        parse_list(result, "resources")
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptTemplate>> {
        let result = self.request("prompts/list", Value::Null).await?;
        parse_list(result, "prompts")
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.request(
            "tools/call",
            serde_json::json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    /// Lightweight liveness probe.
    pub async fn ping(&self) -> Result<()> {
        self.request("ping", Value::Null).await.map(|_| ())
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn route_frame(pending: &Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>, frame: Value) {
    let id = match frame.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            // A notification or request from the server; nothing here
            // consumes those.
            let method = frame.get("method").and_then(Value::as_str).unwrap_or("?");
            tracing::debug!(method, "ignoring server-initiated frame");
            return;
        }
    };

    let mut pending = pending.lock().await;
    if let Some(tx) = pending.remove(&id) {
        let _ = tx.send(frame);
    } else {
        tracing::warn!(id, "response for unknown request");
    }
}

async fn fail_all_pending(pending: &Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>) {
    let mut pending = pending.lock().await;
    // Dropping the senders wakes every waiter with ChannelClosed.
    pending.clear();
}

fn parse_list<T: serde::de::DeserializeOwned>(result: Value, key: &str) -> Result<Vec<T>> {
    match result.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(Error::Json))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

fn generate_request_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let suffix: u64 = rng.random();
    format!("req_{suffix:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportWriter;

    /// Wire a session to hand-rolled channels so tests can act as the
    /// remote server.
    fn test_session() -> (
        Session,
        mpsc::Sender<Result<Value>>,
        mpsc::Receiver<Value>,
    ) {
        let (in_tx, in_rx) = mpsc::channel::<Result<Value>>(16);
        let (out_tx, out_rx) = mpsc::channel::<Value>(16);
        let session = Session::start(in_rx, TransportWriter::new(out_tx));
        (session, in_tx, out_rx)
    }

    #[tokio::test]
    async fn request_correlates_response_by_id() {
        let (session, in_tx, mut out_rx) = test_session();

        let handle = tokio::spawn(async move {
            let frame = out_rx.recv().await.unwrap();
            let id = frame["id"].clone();
            in_tx
                .send(Ok(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"ok": true}
                })))
                .await
                .unwrap();
        });

        let result = session.request("tools/list", Value::Null).await.unwrap();
        assert_eq!(result["ok"], true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        let (session, in_tx, mut out_rx) = test_session();

        tokio::spawn(async move {
            let frame = out_rx.recv().await.unwrap();
            let id = frame["id"].clone();
            in_tx
                .send(Ok(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "method not found"}
                })))
                .await
                .unwrap();
        });

        let err = session.request("nope", Value::Null).await.unwrap_err();
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_transport_fails_pending() {
        let (session, in_tx, mut out_rx) = test_session();

        tokio::spawn(async move {
            let _ = out_rx.recv().await;
            drop(in_tx);
        });

        let err = session.request("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }

    #[tokio::test]
    async fn list_tools_parses_inventory() {
        let (session, in_tx, mut out_rx) = test_session();

        tokio::spawn(async move {
            let frame = out_rx.recv().await.unwrap();
            assert_eq!(frame["method"], "tools/list");
            let id = frame["id"].clone();
            in_tx
                .send(Ok(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "tools": [
                            {"name": "read_file", "description": "Read a file"},
                            {"name": "write_file"}
                        ]
                    }
                })))
                .await
                .unwrap();
        });

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read_file");
        assert!(tools[1].description.is_none());
    }
}
