//! SSE transport: a long-lived `text/event-stream` GET for inbound
//! frames, with outbound frames POSTed to a companion endpoint.

use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{Transport, TransportWriter, CHANNEL_CAPACITY, HANDSHAKE_TIMEOUT};

pub struct SseTransport {
    stream_url: String,
    post_url: String,
    headers: HeaderMap,
    client: reqwest::Client,
    cancel: CancellationToken,
    ready: bool,
}

impl SseTransport {
    /// `stream_url`/`post_url` default to the configured endpoint URL
    /// unless the configuration overrides them separately.
    pub fn new(stream_url: String, post_url: String, headers: HeaderMap) -> Self {
        Self {
            stream_url,
            post_url,
            headers,
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            ready: false,
        }
    }
}

/// Incremental server-sent-events parser. Feed it chunks; it yields the
/// `data:` payload of each complete event.
pub(crate) struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            data_lines: Vec::new(),
        }
    }

    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Event boundary.
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
            // event:/id:/retry: fields and comments are ignored; frames
            // here are always JSON-RPC payloads in `data`.
        }
        events
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&mut self) -> Result<(mpsc::Receiver<Result<Value>>, TransportWriter)> {
        if self.ready {
            return Err(Error::Transport("SSE channel already open".into()));
        }

        let request = self
            .client
            .get(&self.stream_url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream");

        let response = tokio::time::timeout(HANDSHAKE_TIMEOUT, request.send())
            .await
            .map_err(|_| Error::Timeout(HANDSHAKE_TIMEOUT))??;
        let response = response
            .error_for_status()
            .map_err(|e| Error::Transport(format!("SSE stream rejected: {e}")))?;

        let (read_tx, read_rx) = mpsc::channel::<Result<Value>>(CHANNEL_CAPACITY);
        let (write_tx, mut write_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
        let cancel = self.cancel.clone();

        // Stream reader task.
        let reader_tx = read_tx.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                let text = String::from_utf8_lossy(&bytes);
                                for data in parser.feed(&text) {
                                    match serde_json::from_str::<Value>(&data) {
                                        Ok(value) => {
                                            if reader_tx.send(Ok(value)).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            tracing::warn!("non-JSON SSE event: {e}");
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                let _ = reader_tx
                                    .send(Err(Error::Transport(format!("SSE stream error: {e}"))))
                                    .await;
                                break;
                            }
                            None => {
                                let _ = reader_tx.send(Err(Error::ChannelClosed)).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        // POST writer task. Replies delivered in the POST response body
        // (streamable-HTTP style servers) are forwarded inbound too.
        let client = self.client.clone();
        let post_url = self.post_url.clone();
        let headers = self.headers.clone();
        let writer_cancel = cancel;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = write_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let result = client
                            .post(&post_url)
                            .headers(headers.clone())
                            .header(CONTENT_TYPE, "application/json")
                            .json(&frame)
                            .send()
                            .await;
                        match result {
                            Ok(response) => {
                                if !response.status().is_success() {
                                    let status = response.status();
                                    let _ = read_tx
                                        .send(Err(Error::Transport(format!(
                                            "POST rejected with {status}"
                                        ))))
                                        .await;
                                    continue;
                                }
                                if let Ok(body) = response.text().await {
                                    let trimmed = body.trim();
                                    if !trimmed.is_empty() {
                                        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                                            let _ = read_tx.send(Ok(value)).await;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = read_tx
                                    .send(Err(Error::Transport(format!("POST failed: {e}"))))
                                    .await;
                            }
                        }
                    }
                }
            }
        });

        self.ready = true;
        Ok((read_rx, TransportWriter::new(write_tx)))
    }

    async fn close(&mut self) -> Result<()> {
        self.ready = false;
        self.cancel.cancel();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
