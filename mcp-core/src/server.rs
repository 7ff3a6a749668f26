//! MCP server session.
//!
//! [`McpServer`] is the reusable blueprint: identity, capabilities, and the
//! handler registry. Each accepted transport becomes a [`ServerSession`]:
//!
//! 1. Start the transport and await `initialize` (anything else is answered
//!    with a server-not-initialized error)
//! 2. Negotiate the protocol version: accept the first client proposal we
//!    recognize, otherwise answer with our newest and let the client decide
//! 3. Record the client's capabilities and reply with `InitializeResult`
//! 4. Hold non-initialize requests that arrive before
//!    `notifications/initialized`, then drain them in arrival order once the
//!    session is ready

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{McpError, McpResult, ProtocolError, TransportError};
use crate::messages::initialization::negotiate_version;
use crate::messages::{
    methods, ClientCapabilities, Implementation, InitializeRequest, InitializeResult,
    JsonRpcError, ProtocolVersion, ServerCapabilities,
};
use crate::protocol::{
    notification_handler, request_handler, CapabilitySet, EngineOptions, NotificationHandler,
    ProtocolEngine, RequestHandler, RequestOptions, SessionRole, SessionState,
    TransportErrorHandler,
};
use crate::transport::Transport;

/// Configuration options for MCP server behavior.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Timeout for server-initiated requests (default: 60 seconds)
    pub request_timeout: Duration,

    /// Bound on concurrently served inbound requests (None = unbounded)
    pub max_concurrent_requests: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: crate::protocol::DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_requests: None,
        }
    }
}

/// Information about the connected client, captured at handshake time.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client implementation details
    pub implementation: Implementation,
    /// Protocol version the session settled on
    pub protocol_version: ProtocolVersion,
    /// Client capabilities
    pub capabilities: ClientCapabilities,
}

/// Reusable server blueprint: identity, capabilities, handlers.
///
/// One [`McpServer`] can mint any number of sessions, one per accepted
/// transport.
#[derive(Clone)]
pub struct McpServer {
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    config: ServerConfig,
    request_handlers: Vec<(String, Arc<dyn RequestHandler>)>,
    notification_handlers: Vec<(String, Arc<dyn NotificationHandler>)>,
}

impl McpServer {
    /// Create a server blueprint.
    pub fn new(server_info: Implementation, capabilities: ServerCapabilities) -> Self {
        Self {
            server_info,
            capabilities,
            instructions: None,
            config: ServerConfig::default(),
            request_handlers: Vec::new(),
            notification_handlers: Vec::new(),
        }
    }

    /// Attach usage instructions included in every handshake reply.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Set the server configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve a request method on every session.
    pub fn request_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        self.request_handlers.push((method.into(), handler));
        self
    }

    /// Observe a notification method on every session.
    pub fn notification_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        self.notification_handlers.push((method.into(), handler));
        self
    }

    /// Accept one transport and run the server half of the handshake on it.
    ///
    /// Returns as soon as the transport is started; the handshake completes
    /// as the client's messages arrive. Await
    /// [`ServerSession::ready`] to observe completion.
    pub async fn create_session(&self, transport: Box<dyn Transport>) -> McpResult<ServerSession> {
        let engine = ProtocolEngine::new(
            transport,
            SessionRole::Server,
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
        for (method, handler) in &self.request_handlers {
            engine.set_request_handler(method.clone(), handler.clone());
        }
        for (method, handler) in &self.notification_handlers {
            engine.add_notification_handler(method.clone(), handler.clone());
        }

        let client_slot: Arc<RwLock<Option<ClientInfo>>> = Arc::new(RwLock::new(None));
        let ready = Arc::new(Notify::new());

        // Handshake request. Captures the engine weakly: the handler lives
        // inside the engine's own registry.
        {
            let weak = engine.downgrade();
            let server_info = self.server_info.clone();
            let capabilities = self.capabilities.clone();
            let instructions = self.instructions.clone();
            let client_slot = client_slot.clone();
            engine.set_request_handler(
                methods::INITIALIZE,
                request_handler(move |_ctx, params| {
                    let weak = weak.clone();
                    let server_info = server_info.clone();
                    let capabilities = capabilities.clone();
                    let instructions = instructions.clone();
                    let client_slot = client_slot.clone();
                    async move {
                        let engine = weak.upgrade().ok_or_else(|| {
                            McpError::Transport(TransportError::Closed {
                                transport_type: "session".to_string(),
                            })
                        })?;

                        let request: InitializeRequest = serde_json::from_value(
                            params.unwrap_or(Value::Null),
                        )
                        .map_err(|e| {
                            McpError::Rpc(JsonRpcError::invalid_params(format!(
                                "malformed initialize request: {e}"
                            )))
                        })?;

                        let version = negotiate_version(&request.protocol_version);
                        tracing::info!(
                            "client {} {} proposed {}, session will use {}",
                            request.client_info.name,
                            request.client_info.version,
                            request.protocol_version,
                            version
                        );

                        engine.set_peer_capabilities(CapabilitySet::from(&request.capabilities));
                        *client_slot.write().expect("client slot poisoned") = Some(ClientInfo {
                            implementation: request.client_info,
                            protocol_version: version.clone(),
                            capabilities: request.capabilities,
                        });
                        engine.set_state(SessionState::Initializing);

                        let mut result =
                            InitializeResult::new(version, capabilities, server_info);
                        result.instructions = instructions;
                        Ok(serde_json::to_value(result)?)
                    }
                }),
            );
        }

        // Handshake completion notification.
        {
            let weak = engine.downgrade();
            let ready = ready.clone();
            engine.add_notification_handler(
                methods::INITIALIZED,
                notification_handler(move |_method, _params| {
                    let weak = weak.clone();
                    let ready = ready.clone();
                    async move {
                        if let Some(engine) = weak.upgrade() {
                            match engine.state() {
                                SessionState::Initializing => {
                                    tracing::info!("MCP session ready");
                                    engine.set_state(SessionState::Ready);
                                    ready.notify_waiters();
                                }
                                state => tracing::warn!(
                                    "initialized notification in state {state} ignored"
                                ),
                            }
                        }
                        Ok(())
                    }
                }),
            );
        }

        engine.open().await?;

        Ok(ServerSession {
            engine,
            client: client_slot,
            ready_signal: ready,
        })
    }
}

/// One server-side session over one transport.
pub struct ServerSession {
    engine: ProtocolEngine,
    client: Arc<RwLock<Option<ClientInfo>>>,
    ready_signal: Arc<Notify>,
}

impl ServerSession {
    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.engine.state()
    }

    /// Information the client reported during the handshake, if it has
    /// happened yet.
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client.read().expect("client slot poisoned").clone()
    }

    /// Observe non-fatal transport faults on this session.
    pub fn add_error_handler(&self, handler: TransportErrorHandler) {
        self.engine.add_error_handler(handler);
    }

    /// Suspend until the handshake completes.
    pub async fn ready(&self) -> McpResult<()> {
        loop {
            if self.engine.state() == SessionState::Ready {
                return Ok(());
            }
            if self.engine.is_closed() {
                return Err(TransportError::Closed {
                    transport_type: "session".to_string(),
                }
                .into());
            }
            let notified = self.ready_signal.notified();
            if self.engine.state() == SessionState::Ready {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = self.engine.closed() => {}
            }
        }
    }

    /// Send a server-initiated request (sampling, elicitation, roots).
    ///
    /// Fails locally when the client did not advertise the capability the
    /// method needs.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.request_with_options(method, params, RequestOptions::default())
            .await
    }

    /// Send a server-initiated request with per-request options.
    pub async fn request_with_options(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        if self.engine.state() != SessionState::Ready {
            return Err(ProtocolError::NotInitialized {
                reason: format!("server session is {}", self.engine.state()),
            }
            .into());
        }
        self.engine.request(method, params, options).await
    }

    /// Send a fire-and-forget notification to the client.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.engine.notify(method, params).await
    }

    /// Resolves when the session ends.
    pub async fn closed(&self) {
        self.engine.closed().await
    }

    /// Close the session and its transport.
    pub async fn close(&self) {
        self.engine.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_blueprint_builders() {
        let server = McpServer::new(
            Implementation::new("server", "1.0"),
            ServerCapabilities {
                tools: Some(Default::default()),
                ..Default::default()
            },
        )
        .with_instructions("call the tools")
        .request_handler(
            "tools/call",
            request_handler(|_, _| async move { Ok(Value::Null) }),
        );

        assert_eq!(server.request_handlers.len(), 1);
        assert_eq!(server.instructions.as_deref(), Some("call the tools"));
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.max_concurrent_requests.is_none());
    }
}
