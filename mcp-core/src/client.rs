//! MCP client session.
//!
//! The [`McpClient`] drives the initiating half of the handshake and then
//! exposes the protocol engine's request/notify surface:
//!
//! 1. Start the transport
//! 2. Send `initialize { protocolVersion, capabilities, clientInfo }`
//! 3. Await the `InitializeResult` and verify the server picked a version
//!    this client supports (otherwise close with a version-mismatch error)
//! 4. Send `notifications/initialized` and mark the session ready
//!
//! Server-to-client requests (sampling, elicitation, roots listing) are
//! served by handlers registered through [`McpClientBuilder`] before the
//! connection opens.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{McpError, McpResult, ProtocolError};
use crate::messages::{
    methods, ClientCapabilities, Implementation, InitializeRequest, InitializeResult,
    InitializedNotification, ProtocolVersion, ServerCapabilities,
};
use crate::protocol::{
    request_handler, CapabilitySet, EngineOptions, NotificationHandler, ProtocolEngine,
    RequestHandler, RequestOptions, SessionRole, SessionState, TransportErrorHandler,
};
use crate::transport::Transport;

/// Configuration options for MCP client behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for individual requests (default: 60 seconds)
    pub request_timeout: Duration,

    /// Timeout for the initialization handshake (default: 10 seconds)
    pub init_timeout: Duration,

    /// Bound on concurrently served inbound requests (None = unbounded)
    pub max_concurrent_requests: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: crate::protocol::DEFAULT_REQUEST_TIMEOUT,
            init_timeout: Duration::from_secs(10),
            max_concurrent_requests: None,
        }
    }
}

/// Information about the connected MCP server, captured at handshake time.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Server implementation details
    pub implementation: Implementation,
    /// Negotiated protocol version
    pub protocol_version: ProtocolVersion,
    /// Server capabilities
    pub capabilities: ServerCapabilities,
    /// Optional usage instructions from the server
    pub instructions: Option<String>,
}

/// High-level MCP client session.
///
/// Created through [`McpClient::connect`] or [`McpClientBuilder`]; by the
/// time either returns, the handshake has completed and the session is
/// ready.
pub struct McpClient {
    engine: ProtocolEngine,
    server_info: ServerInfo,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server_info", &self.server_info)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Connect over a transport with default configuration and no
    /// client-served handlers.
    pub async fn connect(
        transport: Box<dyn Transport>,
        client_info: Implementation,
    ) -> McpResult<Self> {
        McpClientBuilder::new(client_info).connect(transport).await
    }

    /// Information the server reported during the handshake.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.engine.state()
    }

    /// Whether the session is ready for requests.
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Send a request and await its result.
    ///
    /// Methods gated by a server capability the peer did not advertise fail
    /// locally without sending anything.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.request_with_options(method, params, RequestOptions::default())
            .await
    }

    /// Send a request with per-request options (timeout, progress observer,
    /// cancellation handle).
    pub async fn request_with_options(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        if !self.is_ready() {
            return Err(ProtocolError::NotInitialized {
                reason: format!("client session is {}", self.state()),
            }
            .into());
        }
        self.engine.request(method, params, options).await
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.engine.notify(method, params).await
    }

    /// Resolves when the session ends (either side closed, or the transport
    /// failed).
    pub async fn closed(&self) {
        self.engine.closed().await
    }

    /// Close the session and its transport. Pending requests fail with a
    /// transport-closed error.
    pub async fn close(&self) {
        self.engine.close().await;
    }
}

/// Builder wiring up client identity, capabilities, and handlers for
/// server-initiated traffic before the connection opens.
pub struct McpClientBuilder {
    client_info: Implementation,
    capabilities: ClientCapabilities,
    config: ClientConfig,
    request_handlers: Vec<(String, Arc<dyn RequestHandler>)>,
    notification_handlers: Vec<(String, Arc<dyn NotificationHandler>)>,
    error_handlers: Vec<TransportErrorHandler>,
}

impl McpClientBuilder {
    /// Start a builder for a client identifying as `client_info`.
    pub fn new(client_info: Implementation) -> Self {
        Self {
            client_info,
            capabilities: ClientCapabilities::default(),
            config: ClientConfig::default(),
            request_handlers: Vec::new(),
            notification_handlers: Vec::new(),
            error_handlers: Vec::new(),
        }
    }

    /// Set the capabilities advertised to the server.
    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the client configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve a server-initiated request method (sampling, elicitation, ...).
    pub fn request_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        self.request_handlers.push((method.into(), handler));
        self
    }

    /// Observe a server-sent notification method.
    pub fn notification_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        self.notification_handlers.push((method.into(), handler));
        self
    }

    /// Observe non-fatal transport faults, such as a replay gap on a
    /// resumed stream. The session stays up; the observer decides.
    pub fn error_handler(mut self, handler: TransportErrorHandler) -> Self {
        self.error_handlers.push(handler);
        self
    }

    /// Open the transport, perform the handshake, and return the ready
    /// session.
    pub async fn connect(self, transport: Box<dyn Transport>) -> McpResult<McpClient> {
        let engine = ProtocolEngine::new(
            transport,
            SessionRole::Client,
            EngineOptions {
                default_request_timeout: self.config.request_timeout,
                max_concurrent_requests: self.config.max_concurrent_requests,
                ..Default::default()
            },
        )
        .await?;

        engine.set_own_capabilities(CapabilitySet::from(&self.capabilities));
        engine.set_request_handler(
            methods::PING,
            request_handler(|_ctx, _params| async move { Ok(Value::Object(Default::default())) }),
        );
        for (method, handler) in self.request_handlers {
            engine.set_request_handler(method, handler);
        }
        for (method, handler) in self.notification_handlers {
            engine.add_notification_handler(method, handler);
        }
        for handler in self.error_handlers {
            engine.add_error_handler(handler);
        }

        engine.open().await?;
        engine.set_state(SessionState::Initializing);

        tracing::info!("initializing MCP session as {}", self.client_info.name);
        let request = InitializeRequest::new(
            ProtocolVersion::latest(),
            self.capabilities.clone(),
            self.client_info.clone(),
        );
        let result = engine
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&request)?),
                RequestOptions::with_timeout(self.config.init_timeout),
            )
            .await;
        let result = match result {
            Ok(value) => value,
            Err(e) => {
                engine.close().await;
                return Err(e);
            }
        };

        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            McpError::Protocol(ProtocolError::InitializationFailed {
                reason: format!("malformed initialize result: {e}"),
            })
        })?;

        // The server may counter with a version we do not speak; that ends
        // the session on our side.
        if !init.protocol_version.is_supported() {
            engine.close().await;
            return Err(ProtocolError::VersionMismatch {
                requested: init.protocol_version.to_string(),
                supported: ProtocolVersion::supported_versions()
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            }
            .into());
        }

        engine.set_peer_capabilities(CapabilitySet::from(&init.capabilities));
        engine
            .notify(
                methods::INITIALIZED,
                Some(serde_json::to_value(InitializedNotification::new())?),
            )
            .await?;
        engine.set_state(SessionState::Ready);

        tracing::info!(
            "MCP session ready: {} {} ({})",
            init.server_info.name,
            init.server_info.version,
            init.protocol_version
        );

        Ok(McpClient {
            engine,
            server_info: ServerInfo {
                implementation: init.server_info,
                protocol_version: init.protocol_version,
                capabilities: init.capabilities,
                instructions: init.instructions,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.init_timeout, Duration::from_secs(10));
        assert!(config.max_concurrent_requests.is_none());
    }

    #[test]
    fn test_builder_accumulates_handlers() {
        let builder = McpClientBuilder::new(Implementation::new("c", "1"))
            .request_handler(
                "sampling/createMessage",
                request_handler(|_, _| async move { Ok(Value::Null) }),
            )
            .capabilities(ClientCapabilities {
                sampling: Some(Default::default()),
                ..Default::default()
            });

        assert_eq!(builder.request_handlers.len(), 1);
        assert!(builder.capabilities.sampling.is_some());
    }
}
