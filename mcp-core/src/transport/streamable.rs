//! Streamable HTTP transport implementation: client half.
//!
//! One URL carries the whole conversation:
//!
//! - **POST** submits a single JSON-RPC message. The server answers `202`
//!   (nothing to return), `application/json` (one reply), or
//!   `text/event-stream` (replies streamed until the correlated response).
//! - **GET** opens a resumable standalone stream for server-initiated
//!   messages; reconnects send `Last-Event-ID` and the server replays what
//!   it still retains.
//! - **DELETE** terminates the session.
//!
//! The server assigns a session id on the initialize response via the
//! `Mcp-Session-Id` header; the client echoes it on every subsequent
//! request. Replay gaps on resume are surfaced through the error hook and
//! never kill the session by themselves; the embedding session decides.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AuthConfig, StreamableHttpConfig, Transport, TransportHooks};
use crate::error::{McpError, McpResult, TransportError};
use crate::messages::JsonRpcMessage;

const TRANSPORT_TYPE: &str = "streamable-http";

/// Session id header assigned by the server on the initialize response.
const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Resumption header naming the last event sequence the client has seen.
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Client transport for the Streamable HTTP protocol.
pub struct StreamableHttpTransport {
    config: StreamableHttpConfig,
    http: Client,
    hooks: TransportHooks,
    session_id: Arc<RwLock<Option<String>>>,
    last_event_id: Arc<RwLock<Option<u64>>>,
    standalone_open: Arc<AtomicBool>,
    standalone_task: Arc<RwLock<Option<JoinHandle<()>>>>,
    shutdown: CancellationToken,
    started: bool,
    closed: Arc<AtomicBool>,
}

impl StreamableHttpTransport {
    /// Create a new Streamable HTTP transport from its configuration.
    pub fn new(config: StreamableHttpConfig) -> McpResult<Self> {
        config.validate()?;
        let http = Client::builder()
            .build()
            .map_err(|e| TransportError::InvalidConfig {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            config,
            http,
            hooks: TransportHooks::new(),
            session_id: Arc::new(RwLock::new(None)),
            last_event_id: Arc::new(RwLock::new(None)),
            standalone_open: Arc::new(AtomicBool::new(false)),
            standalone_task: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
            started: false,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The session id assigned by the server, once known.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    fn apply_headers(
        mut builder: reqwest::RequestBuilder,
        config: &StreamableHttpConfig,
    ) -> reqwest::RequestBuilder {
        for (key, value) in &config.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        match &config.auth {
            Some(AuthConfig::Bearer { token }) => {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
            Some(AuthConfig::Basic { username, password }) => {
                builder = builder.basic_auth(username, Some(password));
            }
            Some(AuthConfig::Header { name, value }) => {
                builder = builder.header(name.as_str(), value.as_str());
            }
            None => {}
        }
        builder
    }

    async fn capture_session_id(headers: &HeaderMap, slot: &Arc<RwLock<Option<String>>>) {
        let Some(value) = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        else {
            return;
        };
        let mut guard = slot.write().await;
        if guard.is_none() {
            tracing::info!("session established with id {value}");
            *guard = Some(value);
        }
    }

    /// Drain one SSE body, delivering each event's message in order.
    ///
    /// `last_event_id` is set for the standalone GET stream, where event
    /// ids feed the resumption cursor, overlapping replay is deduplicated,
    /// and gaps are detected.
    async fn drain_event_stream(
        body: reqwest::Response,
        hooks: TransportHooks,
        last_event_id: Option<Arc<RwLock<Option<u64>>>>,
        shutdown: CancellationToken,
    ) {
        let mut events = body.bytes_stream().eventsource();
        loop {
            let next = tokio::select! {
                next = events.next() => next,
                _ = shutdown.cancelled() => break,
            };
            let Some(next) = next else { break };

            match next {
                Ok(event) => {
                    if let Some(tracker) = &last_event_id {
                        if let Ok(sequence) = event.id.parse::<u64>() {
                            let mut guard = tracker.write().await;
                            if let Some(previous) = *guard {
                                // Replay may overlap what was already seen;
                                // deliver each sequence exactly once.
                                if sequence <= previous {
                                    tracing::debug!("skipping replayed event {sequence}");
                                    continue;
                                }
                                if sequence > previous + 1 {
                                    hooks.dispatch_error(
                                        TransportError::StreamGap {
                                            expected: previous + 1,
                                            received: sequence,
                                        }
                                        .into(),
                                    );
                                }
                            }
                            *guard = Some(sequence);
                        }
                    }

                    if event.data.is_empty() {
                        continue;
                    }
                    match JsonRpcMessage::from_wire(&event.data) {
                        Ok(message) => hooks.dispatch_message(message),
                        Err(e) => {
                            tracing::warn!("skipping malformed stream event: {}", e);
                            hooks.dispatch_error(McpError::Codec(e));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("event stream error: {}", e);
                    break;
                }
            }
        }
    }

    /// Open (or reopen) the standalone GET stream for server-initiated
    /// messages. Reconnects with `Last-Event-ID` until the transport closes
    /// or the attempt budget runs out.
    async fn spawn_standalone_stream(&self) {
        if self.standalone_open.swap(true, Ordering::SeqCst) {
            return;
        }

        let http = self.http.clone();
        let config = self.config.clone();
        let hooks = self.hooks.clone();
        let session_id = self.session_id.clone();
        let last_event_id = self.last_event_id.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut attempts: u32 = 0;
            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                let Some(session) = session_id.read().await.clone() else {
                    break;
                };

                let mut request = Self::apply_headers(http.get(config.url.clone()), &config)
                    .header("Accept", "text/event-stream")
                    .header(SESSION_ID_HEADER, session.as_str());
                if let Some(cursor) = *last_event_id.read().await {
                    request = request.header(LAST_EVENT_ID_HEADER, cursor.to_string());
                }

                match request.send().await {
                    Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                        tracing::debug!("server does not offer a standalone stream");
                        break;
                    }
                    Ok(response) if response.status().is_success() => {
                        attempts = 0;
                        Self::drain_event_stream(
                            response,
                            hooks.clone(),
                            Some(last_event_id.clone()),
                            shutdown.clone(),
                        )
                        .await;
                    }
                    Ok(response) => {
                        hooks.dispatch_error(
                            TransportError::HttpStatus {
                                status_code: response.status().as_u16(),
                                reason: "standalone stream rejected".to_string(),
                            }
                            .into(),
                        );
                    }
                    Err(e) => {
                        tracing::warn!("standalone stream connect failed: {}", e);
                    }
                }

                attempts += 1;
                if attempts > config.max_reconnect_attempts {
                    hooks.dispatch_error(
                        TransportError::SseError {
                            reason: "standalone stream reconnect budget exhausted".to_string(),
                        }
                        .into(),
                    );
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        *self.standalone_task.write().await = Some(task);
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
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
        self.started = true;
        tracing::info!("streamable HTTP transport ready against {}", self.config.url);
        Ok(())
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                transport_type: TRANSPORT_TYPE.to_string(),
            }
            .into());
        }
        if !self.started {
            return Err(TransportError::NotStarted {
                transport_type: TRANSPORT_TYPE.to_string(),
            }
            .into());
        }

        let body = message.to_wire()?;
        let mut request = Self::apply_headers(self.http.post(self.config.url.clone()), &self.config)
            .header(CONTENT_TYPE, "application/json")
            .header("Accept", "application/json, text/event-stream")
            .timeout(self.config.request_timeout)
            .body(body);

        // The initialize request is the one message sent before a session id
        // exists; everything after echoes it.
        if let Some(session) = self.session_id.read().await.clone() {
            request = request.header(SESSION_ID_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: e.to_string(),
            })?;

        let had_session = self.session_id.read().await.is_some();
        Self::capture_session_id(response.headers(), &self.session_id).await;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            // The server no longer knows our session; it expired or was
            // terminated from the other side.
            if let Some(session) = self.session_id.read().await.clone() {
                return Err(TransportError::UnknownSession {
                    session_id: session,
                }
                .into());
            }
        }
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status_code: status.as_u16(),
                reason,
            }
            .into());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Replies stream in the background until the server finishes
            // this request's stream; send() itself is done.
            let hooks = self.hooks.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::drain_event_stream(response, hooks, None, shutdown).await;
            });
        } else if content_type.starts_with("application/json") {
            let text = response
                .text()
                .await
                .map_err(|e| TransportError::SendFailed {
                    transport_type: TRANSPORT_TYPE.to_string(),
                    reason: format!("failed to read response body: {e}"),
                })?;
            match JsonRpcMessage::from_wire(&text) {
                Ok(reply) => self.hooks.dispatch_message(reply),
                Err(e) => {
                    tracing::warn!("malformed JSON reply: {}", e);
                    self.hooks.dispatch_error(McpError::Codec(e));
                }
            }
        } else {
            tracing::debug!("response with unexpected content type: {content_type}");
        }

        // First sight of a session id means initialization answered; open
        // the standalone stream for server-initiated traffic.
        if !had_session
            && self.config.open_standalone_stream
            && self.session_id.read().await.is_some()
        {
            self.spawn_standalone_stream().await;
        }

        Ok(())
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("closing streamable HTTP transport");
        self.shutdown.cancel();

        if let Some(task) = self.standalone_task.write().await.take() {
            task.abort();
        }

        // Best-effort session termination; the server reaps it anyway.
        if let Some(session) = self.session_id.read().await.clone() {
            let request = Self::apply_headers(self.http.delete(self.config.url.clone()), &self.config)
                .header(SESSION_ID_HEADER, session);
            if let Err(e) = request.send().await {
                tracing::debug!("session DELETE failed: {}", e);
            }
        }

        self.hooks.dispatch_close();
        Ok(())
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::JsonRpcNotification;

    fn config(url: &str) -> StreamableHttpConfig {
        StreamableHttpConfig::new(url.parse().unwrap())
    }

    #[test]
    fn test_transport_creation() {
        let transport = StreamableHttpTransport::new(config("http://localhost:3000/mcp")).unwrap();
        assert_eq!(transport.transport_type(), "streamable-http");
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let mut transport =
            StreamableHttpTransport::new(config("http://localhost:3000/mcp")).unwrap();
        let result = transport
            .send(JsonRpcMessage::Notification(
                JsonRpcNotification::without_params("x"),
            ))
            .await;
        assert!(matches!(
            result,
            Err(McpError::Transport(TransportError::NotStarted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut transport =
            StreamableHttpTransport::new(config("http://localhost:3000/mcp")).unwrap();
        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(McpError::Transport(TransportError::AlreadyStarted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let mut transport =
            StreamableHttpTransport::new(config("http://localhost:3000/mcp")).unwrap();
        transport.start().await.unwrap();
        transport.close().await.unwrap();

        let result = transport
            .send(JsonRpcMessage::Notification(
                JsonRpcNotification::without_params("x"),
            ))
            .await;
        assert!(matches!(
            result,
            Err(McpError::Transport(TransportError::Closed { .. }))
        ));
    }
}
