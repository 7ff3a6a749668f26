//! Server half of the SSE transport pair.
//!
//! The server exposes two routes. The stream route answers `GET` with a
//! long-lived `text/event-stream` whose first event is
//! `event: endpoint` carrying the POST back-channel URL (with an opaque
//! `sessionId` query parameter); every subsequent outbound JSON-RPC message
//! is emitted as `event: message`. The message route accepts `POST` bodies,
//! looks the session up, and forwards the parsed message to that session's
//! transport: `202` on accept, `400` on malformed bodies, `404` for unknown
//! sessions.
//!
//! A failed POST never tears down the SSE stream. When the stream itself
//! ends — client disconnect or transport close — the session is removed
//! from the map and later POSTs for its id answer `404`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;

use mcp_core::error::{McpResult, TransportError};
use mcp_core::messages::JsonRpcMessage;
use mcp_core::transport::{Transport, TransportHooks};

const TRANSPORT_TYPE: &str = "sse";

/// Outbound queue depth per SSE connection.
const OUTBOUND_BUFFER: usize = 64;

/// Configuration for the SSE server.
#[derive(Debug, Clone)]
pub struct SseServerConfig {
    /// Route serving the event stream
    pub sse_path: String,

    /// Route accepting message POSTs, advertised via the endpoint event
    pub message_path: String,

    /// Whether to attach a permissive CORS layer
    pub cors: bool,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            sse_path: "/sse".to_string(),
            message_path: "/messages".to_string(),
            cors: true,
        }
    }
}

struct SessionEntry {
    hooks: TransportHooks,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionEntry>>>;

struct ServerState {
    config: SseServerConfig,
    sessions: SessionMap,
    connections: mpsc::Sender<SseServerTransport>,
}

/// The SSE transport server: session map plus the axum routes around it.
pub struct SseServer {
    state: Arc<ServerState>,
}

impl SseServer {
    /// Create a server and the stream of transports it will mint, one per
    /// accepted SSE connection.
    pub fn new(config: SseServerConfig) -> (Self, mpsc::Receiver<SseServerTransport>) {
        let (connections_tx, connections_rx) = mpsc::channel(16);
        let server = Self {
            state: Arc::new(ServerState {
                config,
                sessions: Arc::new(Mutex::new(HashMap::new())),
                connections: connections_tx,
            }),
        };
        (server, connections_rx)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().expect("session map poisoned").len()
    }

    /// The axum router serving the stream and message routes.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route(&self.state.config.sse_path, get(sse_stream_handler))
            .route(&self.state.config.message_path, post(message_handler))
            .with_state(self.state.clone());

        if self.state.config.cors {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Bind and serve on the given address.
    pub async fn serve(self, addr: &str) -> McpResult<SseServerHandle> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: format!("failed to bind {addr}: {e}"),
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed {
                transport_type: TRANSPORT_TYPE.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("SSE server listening on {local_addr}");
        let router = self.router();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("SSE server failed: {e}");
            }
        });

        Ok(SseServerHandle { local_addr, task })
    }
}

/// Running SSE server: bound address plus the serving task.
pub struct SseServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SseServerHandle {
    /// The address the server actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Query parameters of the message POST route.
#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn sse_stream_handler(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (outbound_tx, outbound_rx) = mpsc::channel::<JsonRpcMessage>(OUTBOUND_BUFFER);

    let transport = SseServerTransport {
        session_id: session_id.clone(),
        hooks: TransportHooks::new(),
        outbound: Some(outbound_tx),
        sessions: state.sessions.clone(),
        started: false,
        closed: Arc::new(AtomicBool::new(false)),
    };

    state.sessions.lock().expect("session map poisoned").insert(
        session_id.clone(),
        SessionEntry {
            hooks: transport.hooks.clone(),
        },
    );
    tracing::info!("SSE session {session_id} connected");

    // Cleanup runs when the response stream drops, whatever the cause:
    // client disconnect, server shutdown, or transport close.
    let guard = SessionGuard {
        session_id: session_id.clone(),
        sessions: state.sessions.clone(),
        hooks: transport.hooks.clone(),
        closed: transport.closed.clone(),
    };

    if state.connections.try_send(transport).is_err() {
        tracing::error!("connection queue full, dropping SSE session {session_id}");
    }

    let endpoint = format!(
        "{}?sessionId={}",
        state.config.message_path, session_id
    );
    let endpoint_event = futures::stream::once(async move {
        Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint))
    });

    let messages = ReceiverStream::new(outbound_rx).map(move |message| {
        let _guard = &guard;
        let data = message.to_wire().unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().event("message").data(data))
    });

    Sse::new(endpoint_event.chain(messages)).keep_alive(KeepAlive::default())
}

async fn message_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> (StatusCode, String) {
    let Some(session_id) = query.session_id else {
        return (
            StatusCode::BAD_REQUEST,
            "missing sessionId query parameter".to_string(),
        );
    };

    let hooks = {
        let sessions = state.sessions.lock().expect("session map poisoned");
        sessions.get(&session_id).map(|entry| entry.hooks.clone())
    };
    let Some(hooks) = hooks else {
        return (
            StatusCode::NOT_FOUND,
            format!("unknown session: {session_id}"),
        );
    };

    match JsonRpcMessage::from_wire(&body) {
        Ok(message) => {
            hooks.dispatch_message(message);
            (StatusCode::ACCEPTED, String::new())
        }
        Err(e) => {
            tracing::warn!("malformed POST body for session {session_id}: {e}");
            (StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

struct SessionGuard {
    session_id: String,
    sessions: SessionMap,
    hooks: TransportHooks,
    closed: Arc<AtomicBool>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        tracing::info!("SSE session {} closed", self.session_id);
        self.closed.store(true, Ordering::SeqCst);
        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(&self.session_id);
        self.hooks.dispatch_close();
    }
}

/// Server-side transport for one SSE connection.
///
/// `send` feeds the connection's event stream; inbound messages arrive via
/// the POST route and are delivered through the registered hooks.
pub struct SseServerTransport {
    session_id: String,
    hooks: TransportHooks,
    outbound: Option<mpsc::Sender<JsonRpcMessage>>,
    sessions: SessionMap,
    started: bool,
    closed: Arc<AtomicBool>,
}

impl SseServerTransport {
    /// The opaque session id minted for this connection.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl Transport for SseServerTransport {
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
        // Reading is done by the HTTP server; the POST route forwards into
        // the hooks directly.
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
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| TransportError::Closed {
                transport_type: TRANSPORT_TYPE.to_string(),
            })?;
        outbound
            .send(message)
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

        tracing::info!("closing SSE session {}", self.session_id);
        // Dropping the sender ends the response stream; its guard removes
        // the session from the map.
        self.outbound = None;
        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(&self.session_id);
        self.hooks.dispatch_close();
        Ok(())
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SseServerConfig::default();
        assert_eq!(config.sse_path, "/sse");
        assert_eq!(config.message_path, "/messages");
    }

    #[test]
    fn test_session_count_starts_empty() {
        let (server, _connections) = SseServer::new(SseServerConfig::default());
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_send_after_close_fails() {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::channel(4);
        let mut transport = SseServerTransport {
            session_id: "s1".to_string(),
            hooks: TransportHooks::new(),
            outbound: Some(tx),
            sessions,
            started: false,
            closed: Arc::new(AtomicBool::new(false)),
        };

        transport.start().await.unwrap();
        transport.close().await.unwrap();

        let result = transport
            .send(JsonRpcMessage::Notification(
                mcp_core::messages::JsonRpcNotification::without_params("x"),
            ))
            .await;
        assert!(result.is_err());
    }
}
