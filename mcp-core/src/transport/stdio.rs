//! Stdio transport implementation for local MCP communication.
//!
//! Frames messages as newline-delimited JSON over a pair of byte streams,
//! one message per line. Two constructors cover the common cases:
//!
//! - [`StdioTransport::new`] spawns a child process and wires its
//!   stdin/stdout, logging stderr lines as they arrive
//! - [`StdioTransport::from_streams`] wraps any `AsyncRead`/`AsyncWrite`
//!   pair, which is how in-memory wire pairs are built for tests
//!
//! Unparseable lines are logged and skipped; a parseable envelope that still
//! carries an id is answered with a JSON-RPC parse error so the peer's
//! pending request does not hang.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{StdioConfig, Transport, TransportHooks};
use crate::error::{CodecError, McpError, McpResult, TransportError};
use crate::messages::{JsonRpcError, JsonRpcErrorResponse, JsonRpcMessage, RequestId};

const TRANSPORT_TYPE: &str = "stdio";

/// Outbound queue depth; `send` suspends when the writer falls behind.
const OUTBOUND_BUFFER: usize = 64;

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

enum Medium {
    /// Spawn a child process on start
    Process(StdioConfig),
    /// Use the given byte streams directly
    Streams(BoxedReader, BoxedWriter),
    /// Consumed by `start()`
    Taken,
}

/// Newline-delimited JSON transport over byte streams.
pub struct StdioTransport {
    medium: Medium,
    hooks: TransportHooks,
    outbound: Option<mpsc::Sender<String>>,
    child: Option<Child>,
    started: bool,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Create a transport that will spawn the configured child process.
    pub fn new(config: StdioConfig) -> Self {
        Self {
            medium: Medium::Process(config),
            hooks: TransportHooks::new(),
            outbound: None,
            child: None,
            started: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a transport over an arbitrary byte-stream pair.
    pub fn from_streams(
        reader: impl AsyncRead + Send + Sync + Unpin + 'static,
        writer: impl AsyncWrite + Send + Sync + Unpin + 'static,
    ) -> Self {
        Self {
            medium: Medium::Streams(Box::new(reader), Box::new(writer)),
            hooks: TransportHooks::new(),
            outbound: None,
            child: None,
            started: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_process(config: &StdioConfig) -> McpResult<(Child, BoxedReader, BoxedWriter)> {
        tracing::debug!("spawning process: {} {:?}", config.command, config.args);

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            command.current_dir(working_dir);
        }
        for (key, value) in &config.environment {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: format!("failed to spawn process: {e}"),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: "failed to capture stdin".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: "failed to capture stdout".to_string(),
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!("mcp process stderr: {}", line.trim());
                    }
                }
            });
        }

        Ok((child, Box::new(stdout), Box::new(stdin)))
    }

    /// Try to salvage a reply for a malformed inbound line.
    ///
    /// A line that parses as JSON and still carries a usable id gets a
    /// parse-error response; anything else is only logged.
    fn error_reply_for(line: &str, error: &CodecError) -> Option<JsonRpcMessage> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let id: RequestId = serde_json::from_value(value.get("id")?.clone()).ok()?;
        let rpc_error = match error {
            CodecError::Json { .. } => JsonRpcError::parse_error(),
            other => JsonRpcError::invalid_request(other.to_string()),
        };
        Some(JsonRpcMessage::Error(JsonRpcErrorResponse::new(
            id, rpc_error,
        )))
    }

    async fn kill_process(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::debug!("terminating child process (pid: {:?})", child.id());

            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill child process: {}", e);
            }

            match timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("child process exited with status: {status}"),
                Ok(Err(e)) => tracing::warn!("error waiting for child process: {e}"),
                Err(_) => tracing::warn!("child process did not exit within timeout"),
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn transport_type(&self) -> &'static str {
        TRANSPORT_TYPE
    }

    async fn start(&mut self) -> McpResult<()> {
        if self.started {
            return Err(TransportError::AlreadyStarted {
                transport_type: TRANSPORT_TYPE.to_string(),
            }
            .into());
        }

        let (reader, writer) = match std::mem::replace(&mut self.medium, Medium::Taken) {
            Medium::Process(config) => {
                let (child, reader, writer) = Self::spawn_process(&config)?;
                self.child = Some(child);
                (reader, writer)
            }
            Medium::Streams(reader, writer) => (reader, writer),
            Medium::Taken => {
                return Err(TransportError::AlreadyStarted {
                    transport_type: TRANSPORT_TYPE.to_string(),
                }
                .into())
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        self.outbound = Some(outbound_tx.clone());

        // Writer task: drains the outbound queue onto the byte stream.
        let mut writer = writer;
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::error!("failed to write outbound line: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    tracing::error!("failed to flush outbound line: {}", e);
                    break;
                }
            }
            tracing::debug!("stdio writer task finished");
        });

        // Reader task: one JSON message per line, delivered in order.
        let hooks = self.hooks.clone();
        let closed = self.closed.clone();
        let reply_tx = outbound_tx;
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::from_wire(trimmed) {
                            Ok(message) => hooks.dispatch_message(message),
                            Err(e) => {
                                tracing::warn!("skipping malformed line: {} ({})", e, trimmed);
                                if let Some(reply) = Self::error_reply_for(trimmed, &e) {
                                    if let Ok(wire) = reply.to_wire() {
                                        let _ = reply_tx.send(format!("{wire}\n")).await;
                                    }
                                }
                                hooks.dispatch_error(McpError::Codec(e));
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("stdio stream closed (EOF)");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("error reading stdio stream: {}", e);
                        break;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            hooks.dispatch_close();
        });

        self.started = true;
        tracing::info!("stdio transport started");
        Ok(())
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                transport_type: TRANSPORT_TYPE.to_string(),
            }
            .into());
        }

        let sender = self
            .outbound
            .as_ref()
            .ok_or_else(|| TransportError::NotStarted {
                transport_type: TRANSPORT_TYPE.to_string(),
            })?;

        let line = format!("{}\n", message.to_wire()?);
        sender
            .send(line)
            .await
            .map_err(|_| TransportError::Closed {
                transport_type: TRANSPORT_TYPE.to_string(),
            })?;
        Ok(())
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("closing stdio transport");

        // Dropping the sender ends the writer task once the queue drains.
        self.outbound = None;
        self.kill_process().await;
        self.hooks.dispatch_close();
        Ok(())
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}
