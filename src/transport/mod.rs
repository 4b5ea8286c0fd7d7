//! Protocol channels over the three supported transports.
//!
//! Every transport yields the same channel pair on connect: a receiver of
//! incoming JSON frames and a clonable [`TransportWriter`] for outgoing
//! ones. The connection manager and protocol session are transport
//! agnostic beyond construction.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Bound on the initial transport handshake (stream open, first frame).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Channel depth for both directions.
pub(crate) const CHANNEL_CAPACITY: usize = 256;

/// A clonable handle for writing JSON frames to the transport.
#[derive(Clone)]
pub struct TransportWriter {
    tx: mpsc::Sender<Value>,
}

impl TransportWriter {
    pub fn new(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }

    /// Write a JSON frame. Fails with [`Error::ChannelClosed`] once the
    /// transport is torn down.
    pub async fn write(&self, frame: Value) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| Error::ChannelClosed)
    }
}

/// A bidirectional JSON frame channel to a tool-provider server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. Returns a receiver for incoming frames and a
    /// writer for outgoing ones.
    async fn connect(&mut self) -> Result<(mpsc::Receiver<Result<Value>>, TransportWriter)>;

    /// Tear the channel down and cancel its tasks.
    async fn close(&mut self) -> Result<()>;

    /// Whether the channel is currently open.
    fn is_ready(&self) -> bool;
}

/// Build a reqwest header map from configured headers plus an optional
/// bearer token. Invalid header names/values are a configuration error.
pub(crate) fn build_headers(
    headers: Option<&HashMap<String, String>>,
    bearer: Option<&str>,
) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    if let Some(headers) = headers {
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidConfig(format!("bad header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidConfig(format!("bad header value: {e}")))?;
            map.insert(name, value);
        }
    }
    if let Some(token) = bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::InvalidConfig(format!("bad bearer token: {e}")))?;
        map.insert(AUTHORIZATION, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_headers_with_bearer() {
        let mut custom = HashMap::new();
        custom.insert("X-Api-Key".to_string(), "abc".to_string());
        let map = build_headers(Some(&custom), Some("tok123")).unwrap();
        assert_eq!(map.get("x-api-key").unwrap(), "abc");
        assert_eq!(map.get(AUTHORIZATION).unwrap(), "Bearer tok123");
    }

    #[test]
    fn build_headers_rejects_bad_name() {
        let mut custom = HashMap::new();
        custom.insert("bad header".to_string(), "v".to_string());
        assert!(matches!(
            build_headers(Some(&custom), None),
            Err(Error::InvalidConfig(_))
        ));
    }
}
