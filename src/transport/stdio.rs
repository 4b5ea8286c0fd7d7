//! Stdio transport: newline-delimited JSON over the pipes of a
//! subprocess supervised by the process manager.
//!
//! The transport does not own the process. It borrows the stdin/stdout
//! handles handed over by the [`crate::process::ProcessManager`] and only
//! ever tears down its own reader/writer tasks; killing or restarting the
//! process is the manager's business.

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::{Transport, TransportWriter, CHANNEL_CAPACITY};

pub struct StdioTransport {
    io: Option<(ChildStdin, ChildStdout)>,
    cancel: CancellationToken,
    ready: bool,
}

impl StdioTransport {
    /// Wrap the pipe handles of an already-running subprocess.
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            io: Some((stdin, stdout)),
            cancel: CancellationToken::new(),
            ready: false,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self) -> Result<(mpsc::Receiver<Result<Value>>, TransportWriter)> {
        if self.ready {
            return Err(Error::Transport("stdio channel already open".into()));
        }
        let (mut stdin, stdout) = self
            .io
            .take()
            .ok_or_else(|| Error::Transport("stdio pipes already consumed".into()))?;

        let (read_tx, read_rx) = mpsc::channel::<Result<Value>>(CHANNEL_CAPACITY);
        let (write_tx, mut write_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);

        let cancel = self.cancel.clone();

        // Stdout reader task: one JSON frame per line.
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let line = line.trim();
                                if line.is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<Value>(line) {
                                    Ok(value) => {
                                        if read_tx.send(Ok(value)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(line, "non-JSON line from server: {e}");
                                    }
                                }
                            }
                            Ok(None) => {
                                let _ = read_tx.send(Err(Error::ChannelClosed)).await;
                                break;
                            }
                            Err(e) => {
                                let _ = read_tx.send(Err(Error::Io(e))).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Stdin writer task.
        let writer_cancel = cancel;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = write_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let mut data = match serde_json::to_string(&frame) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::error!("failed to serialize outgoing frame: {e}");
                                continue;
                            }
                        };
                        data.push('\n');
                        if let Err(e) = stdin.write_all(data.as_bytes()).await {
                            tracing::error!("failed to write to server stdin: {e}");
                            break;
                        }
                        if let Err(e) = stdin.flush().await {
                            tracing::error!("failed to flush server stdin: {e}");
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

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_cat() -> tokio::process::Child {
        tokio::process::Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .expect("spawn cat")
    }

    #[tokio::test]
    async fn echoes_json_frames() {
        let mut child = spawn_cat().await;
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StdioTransport::new(stdin, stdout);
        let (mut rx, writer) = transport.connect().await.unwrap();

        writer
            .write(serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame["method"], "ping");

        transport.close().await.unwrap();
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn second_connect_rejected() {
        let mut child = spawn_cat().await;
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StdioTransport::new(stdin, stdout);
        let _channel = transport.connect().await.unwrap();
        assert!(transport.connect().await.is_err());
        let _ = child.kill().await;
    }
}
