//! Request/response HTTP transport: every outbound JSON-RPC frame is one
//! HTTP call and the response body is the inbound reply.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::config::HttpMethod;

use super::{Transport, TransportWriter, CHANNEL_CAPACITY};

pub struct HttpTransport {
    url: String,
    method: Method,
    headers: HeaderMap,
    timeout: Duration,
    client: reqwest::Client,
    cancel: CancellationToken,
    ready: bool,
}

impl HttpTransport {
    pub fn new(url: String, method: HttpMethod, headers: HeaderMap, timeout: Duration) -> Self {
        let method = match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        Self {
            url,
            method,
            headers,
            timeout,
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            ready: false,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(mpsc::Receiver<Result<Value>>, TransportWriter)> {
        if self.ready {
            return Err(Error::Transport("HTTP channel already open".into()));
        }

        let (read_tx, read_rx) = mpsc::channel::<Result<Value>>(CHANNEL_CAPACITY);
        let (write_tx, mut write_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);

        let client = self.client.clone();
        let url = self.url.clone();
        let method = self.method.clone();
        let headers = self.headers.clone();
        let timeout = self.timeout;
        let cancel = self.cancel.clone();

        // One round trip per outgoing frame; requests are processed in
        // order, which serializes calls on this channel by construction.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = write_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let request = client
                            .request(method.clone(), &url)
                            .headers(headers.clone())
                            .header(CONTENT_TYPE, "application/json")
                            .timeout(timeout)
                            .json(&frame);

                        let reply = match request.send().await {
                            Ok(response) => match response.error_for_status() {
                                Ok(response) => match response.json::<Value>().await {
                                    Ok(value) => Ok(value),
                                    Err(e) => {
                                        Err(Error::Transport(format!("bad response body: {e}")))
                                    }
                                },
                                Err(e) => Err(Error::Transport(format!("request rejected: {e}"))),
                            },
                            Err(e) if e.is_timeout() => Err(Error::Timeout(timeout)),
                            Err(e) => Err(Error::Transport(format!("request failed: {e}"))),
                        };

                        if read_tx.send(reply).await.is_err() {
                            break;
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

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
