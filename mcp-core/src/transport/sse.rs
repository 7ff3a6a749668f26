//! SSE transport implementation: client half of the HTTP+SSE pair.
//!
//! The inbound path is a single long-lived `text/event-stream` response.
//! Its first event is `event: endpoint` whose data is the URL of the POST
//! back-channel (relative to the stream URL, carrying an opaque `sessionId`
//! query parameter). Every later `event: message` carries one JSON-RPC
//! message. The outbound path is HTTP POST of JSON bodies to the advertised
//! endpoint.
//!
//! A failed POST surfaces the error to the sender but leaves the stream
//! alive; only the stream ending (peer disconnect, network failure, or
//! explicit close) terminates the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use url::Url;

use super::{AuthConfig, SseConfig, Transport, TransportHooks};
use crate::error::{McpError, McpResult, TransportError};
use crate::messages::JsonRpcMessage;

const TRANSPORT_TYPE: &str = "sse";

/// Event type advertising the POST back-channel URL.
const ENDPOINT_EVENT: &str = "endpoint";
/// Event type carrying a JSON-RPC message.
const MESSAGE_EVENT: &str = "message";

/// Client transport for the SSE pair: inbound event stream + outbound POST.
pub struct SseTransport {
    config: SseConfig,
    http: Client,
    hooks: TransportHooks,
    endpoint: Arc<RwLock<Option<Url>>>,
    stream_task: Option<JoinHandle<()>>,
    started: bool,
    closed: Arc<AtomicBool>,
}

impl SseTransport {
    /// Create a new SSE transport from its configuration.
    pub fn new(config: SseConfig) -> McpResult<Self> {
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
            endpoint: Arc::new(RwLock::new(None)),
            stream_task: None,
            started: false,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The POST endpoint advertised by the stream, once discovered.
    pub async fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().await.clone()
    }

    fn apply_headers(
        mut builder: reqwest::RequestBuilder,
        headers: &std::collections::HashMap<String, String>,
        auth: &Option<AuthConfig>,
    ) -> reqwest::RequestBuilder {
        for (key, value) in headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        match auth {
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
}

#[async_trait]
impl Transport for SseTransport {
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

        tracing::info!("opening SSE stream at {}", self.config.sse_url);

        let request = Self::apply_headers(
            self.http.get(self.config.sse_url.clone()),
            &self.config.headers,
            &self.config.auth,
        )
        .header("Accept", "text/event-stream");

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: format!("failed to open event stream: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(TransportError::HttpStatus {
                status_code: response.status().as_u16(),
                reason: "event stream request rejected".to_string(),
            }
            .into());
        }

        let mut events = response.bytes_stream().eventsource();

        // The first event names the POST back-channel; nothing can be sent
        // before it arrives.
        let endpoint_url = loop {
            let event = tokio::time::timeout(self.config.request_timeout, events.next())
                .await
                .map_err(|_| TransportError::ConnectionFailed {
                    transport_type: TRANSPORT_TYPE.to_string(),
                    reason: "timed out waiting for endpoint event".to_string(),
                })?
                .ok_or_else(|| TransportError::ConnectionFailed {
                    transport_type: TRANSPORT_TYPE.to_string(),
                    reason: "event stream ended before endpoint event".to_string(),
                })?
                .map_err(|e| TransportError::SseError {
                    reason: format!("event stream failed: {e}"),
                })?;

            if event.event == ENDPOINT_EVENT {
                let resolved = self.config.sse_url.join(event.data.trim()).map_err(|e| {
                    TransportError::SseError {
                        reason: format!("invalid endpoint URL '{}': {e}", event.data.trim()),
                    }
                })?;
                break resolved;
            }
            tracing::debug!("ignoring pre-endpoint event: {}", event.event);
        };

        tracing::info!("SSE endpoint advertised: {endpoint_url}");
        *self.endpoint.write().await = Some(endpoint_url);

        let hooks = self.hooks.clone();
        let closed = self.closed.clone();
        let task = tokio::spawn(async move {
            while let Some(next) = events.next().await {
                match next {
                    Ok(event) => match event.event.as_str() {
                        MESSAGE_EVENT => match JsonRpcMessage::from_wire(&event.data) {
                            Ok(message) => hooks.dispatch_message(message),
                            Err(e) => {
                                tracing::warn!("skipping malformed SSE message: {}", e);
                                hooks.dispatch_error(McpError::Codec(e));
                            }
                        },
                        ENDPOINT_EVENT => {
                            tracing::debug!("ignoring repeated endpoint event");
                        }
                        other => {
                            tracing::debug!("ignoring SSE event type: {}", other);
                        }
                    },
                    Err(e) => {
                        tracing::warn!("SSE stream error: {}", e);
                        hooks.dispatch_error(
                            TransportError::SseError {
                                reason: e.to_string(),
                            }
                            .into(),
                        );
                        break;
                    }
                }
            }
            tracing::info!("SSE stream ended");
            closed.store(true, Ordering::SeqCst);
            hooks.dispatch_close();
        });

        self.stream_task = Some(task);
        self.started = true;
        Ok(())
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                transport_type: TRANSPORT_TYPE.to_string(),
            }
            .into());
        }

        let endpoint =
            self.endpoint
                .read()
                .await
                .clone()
                .ok_or_else(|| TransportError::NotStarted {
                    transport_type: TRANSPORT_TYPE.to_string(),
                })?;

        let body = message.to_wire()?;
        let request = Self::apply_headers(
            self.http.post(endpoint),
            &self.config.headers,
            &self.config.auth,
        )
        .header(CONTENT_TYPE, "application/json")
        .timeout(self.config.request_timeout)
        .body(body);

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: e.to_string(),
            })?;

        // A rejected POST fails this send only; the inbound stream stays up.
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let reason = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status_code: status,
                reason,
            }
            .into());
        }

        Ok(())
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("closing SSE transport");

        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.hooks.dispatch_close();
        Ok(())
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
    }
}
