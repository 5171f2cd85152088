//! Transports carrying newline-delimited JSON-RPC messages.
//!
//! - [`ProcessTransport`]: NDJSON over the stdin/stdout of a spawned server
//! - [`ChannelTransport`]: In-process tokio mpsc channels (for testing)

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::McpError;

/// How long a server gets to exit after its stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Reads and writes JSON-RPC messages over some framing.
#[async_trait]
pub trait Transport: Send {
    /// Read the next message.
    ///
    /// Returns `Ok(None)` on EOF (the remote side closed the connection).
    async fn read_message(&mut self) -> Result<Option<String>, McpError>;

    /// Write one message, framing and flushing it.
    async fn write_message(&mut self, message: &str) -> Result<(), McpError>;

    /// Gracefully close the transport.
    async fn close(&mut self) -> Result<(), McpError>;
}

// ---------------------------------------------------------------------------
// ProcessTransport
// ---------------------------------------------------------------------------

/// Transport to an MCP server running as a child process.
///
/// The child is killed if the transport is dropped without [`Transport::close`].
/// Its stderr is forwarded to the log at debug level.
pub struct ProcessTransport {
    stdin: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
    child: Child,
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("pid", &self.child.id())
            .finish()
    }
}

impl ProcessTransport {
    /// Spawn `command` and connect to its stdio.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::TransportError {
                message: format!("Failed to spawn {}: {}", command, e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::TransportError {
            message: "Failed to capture child stdin".into(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::TransportError {
                message: "Failed to capture child stdout".into(),
            })?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{}", line);
                }
            });
        }

        debug!(server, command, pid = ?child.id(), "Spawned MCP server");
        Ok(Self {
            stdin: Some(stdin),
            reader: BufReader::new(stdout),
            child,
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn read_message(&mut self) -> Result<Option<String>, McpError> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    async fn write_message(&mut self, message: &str) -> Result<(), McpError> {
        let stdin = self.stdin.as_mut().ok_or(McpError::ConnectionClosed)?;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().await?;
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(?status, "MCP server exited");
            }
            Err(_) => {
                warn!(pid = ?self.child.id(), "MCP server did not exit, killing it");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// In-process transport backed by tokio mpsc channels.
pub struct ChannelTransport {
    receiver: mpsc::Receiver<String>,
    sender: mpsc::Sender<String>,
}

impl ChannelTransport {
    pub fn new(receiver: mpsc::Receiver<String>, sender: mpsc::Sender<String>) -> Self {
        Self { receiver, sender }
    }

    /// Create a linked pair; what one side writes the other reads.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);
        (
            ChannelTransport::new(rx_a, tx_b),
            ChannelTransport::new(rx_b, tx_a),
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn read_message(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.receiver.recv().await)
    }

    async fn write_message(&mut self, message: &str) -> Result<(), McpError> {
        self.sender
            .send(message.to_string())
            .await
            .map_err(|e| McpError::TransportError {
                message: format!("channel send failed: {e}"),
            })
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.receiver.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_roundtrip() {
        let (mut client, mut server) = ChannelTransport::pair(4);
        client
            .write_message(r#"{"jsonrpc":"2.0","method":"initialize","id":1}"#)
            .await
            .unwrap();
        assert_eq!(
            server.read_message().await.unwrap().as_deref(),
            Some(r#"{"jsonrpc":"2.0","method":"initialize","id":1}"#)
        );
        server
            .write_message(r#"{"jsonrpc":"2.0","result":{},"id":1}"#)
            .await
            .unwrap();
        assert!(client.read_message().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_channel_transport_eof_and_closed_peer() {
        let (mut client, server) = ChannelTransport::pair(4);
        drop(server);
        assert_eq!(client.read_message().await.unwrap(), None);
        let err = client.write_message("{}").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let err = ProcessTransport::spawn(
            "ghost",
            "ragline-definitely-not-a-real-binary",
            &[],
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_transport_echoes_through_cat() {
        let mut transport = ProcessTransport::spawn("cat", "cat", &[], &HashMap::new()).unwrap();
        transport.write_message(r#"{"id":1}"#).await.unwrap();
        assert_eq!(
            transport.read_message().await.unwrap().as_deref(),
            Some(r#"{"id":1}"#)
        );
        transport.close().await.unwrap();
        assert!(transport.write_message("{}").await.is_err());
    }
}
