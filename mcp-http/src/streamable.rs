//! Server half of the Streamable HTTP transport.
//!
//! A single route serves the whole protocol:
//!
//! - **POST** submits one JSON-RPC message. The `initialize` request mints
//!   the session and is answered with `application/json` plus the assigned
//!   `Mcp-Session-Id` header. Later requests are answered with a
//!   `text/event-stream` that carries the correlated response (and any
//!   progress for that request) and then ends. Notifications and responses
//!   are acknowledged with `202`.
//! - **GET** opens the session's standalone stream for server-initiated
//!   messages. Every event carries a per-stream sequence in its `id:`
//!   field; reconnects send `Last-Event-ID` and the server replays the
//!   retained events with a higher sequence before continuing live.
//! - **DELETE** terminates the session (`204`).
//!
//! Retention is bounded: each session keeps the last
//! [`StreamableHttpServerConfig::replay_buffer`] standalone events. A
//! resume that asks for older history gets what is retained; the client
//! notices the sequence jump and surfaces it through its error hook.
//!
//! A message is sent on exactly one stream: the POST stream that owns its
//! request id while that request is in flight, the standalone stream
//! otherwise. Responses whose POST stream is already gone fall back to the
//! standalone stream so they survive a dropped connection.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;

use mcp_core::error::{McpResult, TransportError};
use mcp_core::messages::progress::extract_progress_token;
use mcp_core::messages::{
    methods, CancelledNotification, JsonRpcMessage, ProgressToken, RequestId,
};
use mcp_core::transport::{Transport, TransportHooks};

const TRANSPORT_TYPE: &str = "streamable-http";

/// Session id header assigned on the initialize response.
const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Resumption header naming the last event sequence the client saw.
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Queue depth per response stream.
const STREAM_BUFFER: usize = 64;

/// Configuration for the Streamable HTTP server.
#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// The single MCP route
    pub path: String,

    /// Standalone-stream events retained per session for replay
    pub replay_buffer: usize,

    /// How long an initialize POST waits for the session's reply
    pub initialize_timeout: Duration,

    /// Whether to attach a permissive CORS layer
    pub cors: bool,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            path: "/mcp".to_string(),
            replay_buffer: 256,
            initialize_timeout: Duration::from_secs(30),
            cors: true,
        }
    }
}

#[derive(Clone)]
struct StreamEvent {
    seq: u64,
    data: String,
}

struct PostRoute {
    tx: mpsc::Sender<StreamEvent>,
    seq: Arc<AtomicU64>,
    token: Option<ProgressToken>,
}

#[derive(Default)]
struct RouteTable {
    by_id: HashMap<RequestId, PostRoute>,
    by_token: HashMap<ProgressToken, (mpsc::Sender<StreamEvent>, Arc<AtomicU64>)>,
}

#[derive(Default)]
struct Standalone {
    live: Option<mpsc::Sender<StreamEvent>>,
    store: VecDeque<StreamEvent>,
    next_seq: u64,
}

struct SessionShared {
    session_id: String,
    hooks: TransportHooks,
    routes: Mutex<RouteTable>,
    standalone: Mutex<Standalone>,
    replay_buffer: usize,
    closed: AtomicBool,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<SessionShared>>>>;

struct ServerState {
    config: StreamableHttpServerConfig,
    sessions: SessionMap,
    connections: mpsc::Sender<StreamableServerTransport>,
}

/// The Streamable HTTP transport server.
pub struct StreamableHttpServer {
    state: Arc<ServerState>,
}

impl StreamableHttpServer {
    /// Create a server and the stream of transports it will mint, one per
    /// initialized session.
    pub fn new(
        config: StreamableHttpServerConfig,
    ) -> (Self, mpsc::Receiver<StreamableServerTransport>) {
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

    /// The axum router serving the MCP route.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route(&self.state.config.path, any(mcp_handler))
            .with_state(self.state.clone());
        if self.state.config.cors {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Bind and serve on the given address.
    pub async fn serve(self, addr: &str) -> McpResult<StreamableHttpServerHandle> {
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

        tracing::info!("streamable HTTP server listening on {local_addr}");
        let router = self.router();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("streamable HTTP server failed: {e}");
            }
        });

        Ok(StreamableHttpServerHandle { local_addr, task })
    }
}

/// Running server: bound address plus the serving task.
pub struct StreamableHttpServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StreamableHttpServerHandle {
    /// The address the server actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn mcp_handler(
    State(state): State<Arc<ServerState>>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: String,
) -> Response {
    if method == axum::http::Method::POST {
        handle_post(state, headers, body).await
    } else if method == axum::http::Method::GET {
        handle_get(state, headers).await
    } else if method == axum::http::Method::DELETE {
        handle_delete(state, headers).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn handle_post(state: Arc<ServerState>, headers: HeaderMap, body: String) -> Response {
    let message = match JsonRpcMessage::from_wire(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("malformed POST body: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let session_header = header(&headers, SESSION_ID_HEADER);

    let Some(session_id) = session_header else {
        // The only message allowed before a session exists is initialize.
        if let JsonRpcMessage::Request(request) = &message {
            if request.method == methods::INITIALIZE {
                return handle_initialize(state, message).await;
            }
        }
        return (
            StatusCode::BAD_REQUEST,
            "missing Mcp-Session-Id header".to_string(),
        )
            .into_response();
    };

    let session = {
        let sessions = state.sessions.lock().expect("session map poisoned");
        sessions.get(&session_id).cloned()
    };
    let Some(session) = session else {
        return (
            StatusCode::NOT_FOUND,
            format!("unknown session: {session_id}"),
        )
            .into_response();
    };

    match message {
        JsonRpcMessage::Request(ref request) => {
            let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
            let seq = Arc::new(AtomicU64::new(1));
            let token = extract_progress_token(request.params.as_ref());
            {
                let mut routes = session.routes.lock().expect("route table poisoned");
                if let Some(token) = token.clone() {
                    routes.by_token.insert(token, (tx.clone(), seq.clone()));
                }
                routes.by_id.insert(
                    request.id.clone(),
                    PostRoute {
                        tx,
                        seq,
                        token,
                    },
                );
            }

            session.hooks.dispatch_message(message);

            let stream = ReceiverStream::new(rx).map(|event| {
                Ok::<Event, Infallible>(
                    Event::default().id(event.seq.to_string()).data(event.data),
                )
            });
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
        JsonRpcMessage::Notification(ref notification)
            if notification.method == methods::CANCELLED =>
        {
            // A cancelled request gets no reply; drop its POST stream so
            // the requester's connection ends instead of idling forever.
            if let Ok(Some(cancelled)) = notification
                .params
                .clone()
                .map(serde_json::from_value::<CancelledNotification>)
                .transpose()
            {
                let mut routes = session.routes.lock().expect("route table poisoned");
                if let Some(route) = routes.by_id.remove(&cancelled.request_id) {
                    if let Some(token) = &route.token {
                        routes.by_token.remove(token);
                    }
                }
            }
            session.hooks.dispatch_message(message);
            StatusCode::ACCEPTED.into_response()
        }
        _ => {
            session.hooks.dispatch_message(message);
            StatusCode::ACCEPTED.into_response()
        }
    }
}

async fn handle_initialize(state: Arc<ServerState>, message: JsonRpcMessage) -> Response {
    let JsonRpcMessage::Request(ref request) = message else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let session = Arc::new(SessionShared {
        session_id: session_id.clone(),
        hooks: TransportHooks::new(),
        routes: Mutex::new(RouteTable::default()),
        standalone: Mutex::new(Standalone {
            next_seq: 1,
            ..Default::default()
        }),
        replay_buffer: state.config.replay_buffer,
        closed: AtomicBool::new(false),
    });

    state
        .sessions
        .lock()
        .expect("session map poisoned")
        .insert(session_id.clone(), session.clone());
    tracing::info!("streamable HTTP session {session_id} created");

    let transport = StreamableServerTransport {
        session: session.clone(),
        sessions: state.sessions.clone(),
        started: false,
    };
    if state.connections.try_send(transport).is_err() {
        tracing::error!("connection queue full, dropping session {session_id}");
        state
            .sessions
            .lock()
            .expect("session map poisoned")
            .remove(&session_id);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    // Route the initialize reply back to this POST before dispatching.
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(4);
    {
        let mut routes = session.routes.lock().expect("route table poisoned");
        routes.by_id.insert(
            request.id.clone(),
            PostRoute {
                tx,
                seq: Arc::new(AtomicU64::new(1)),
                token: None,
            },
        );
    }
    session.hooks.dispatch_message(message);

    match tokio::time::timeout(state.config.initialize_timeout, rx.recv()).await {
        Ok(Some(event)) => (
            StatusCode::OK,
            AppendHeaders([
                ("content-type", "application/json".to_string()),
                (SESSION_ID_HEADER, session_id),
            ]),
            event.data,
        )
            .into_response(),
        _ => {
            tracing::error!("no initialize reply for session {session_id}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_get(state: Arc<ServerState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header(&headers, SESSION_ID_HEADER) else {
        return (
            StatusCode::BAD_REQUEST,
            "missing Mcp-Session-Id header".to_string(),
        )
            .into_response();
    };

    let session = {
        let sessions = state.sessions.lock().expect("session map poisoned");
        sessions.get(&session_id).cloned()
    };
    let Some(session) = session else {
        return (
            StatusCode::NOT_FOUND,
            format!("unknown session: {session_id}"),
        )
            .into_response();
    };

    let last_seen: Option<u64> =
        header(&headers, LAST_EVENT_ID_HEADER).and_then(|v| v.parse().ok());

    let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
    let replayed: Vec<StreamEvent> = {
        let mut standalone = session.standalone.lock().expect("standalone stream poisoned");
        // A fresh sender replaces any previous GET stream, so no message
        // is ever delivered on two of them.
        standalone.live = Some(tx);
        match last_seen {
            Some(cursor) => standalone
                .store
                .iter()
                .filter(|event| event.seq > cursor)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    };

    if let Some(cursor) = last_seen {
        tracing::debug!(
            "session {session_id} resuming after {cursor}, replaying {} events",
            replayed.len()
        );
    }

    let stream = futures::stream::iter(replayed)
        .chain(ReceiverStream::new(rx))
        .map(|event| {
            Ok::<Event, Infallible>(Event::default().id(event.seq.to_string()).data(event.data))
        });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_delete(state: Arc<ServerState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header(&headers, SESSION_ID_HEADER) else {
        return (
            StatusCode::BAD_REQUEST,
            "missing Mcp-Session-Id header".to_string(),
        )
            .into_response();
    };

    let session = {
        let mut sessions = state.sessions.lock().expect("session map poisoned");
        sessions.remove(&session_id)
    };
    let Some(session) = session else {
        return (
            StatusCode::NOT_FOUND,
            format!("unknown session: {session_id}"),
        )
            .into_response();
    };

    tracing::info!("session {session_id} terminated by client");
    session.closed.store(true, Ordering::SeqCst);
    session
        .standalone
        .lock()
        .expect("standalone stream poisoned")
        .live = None;
    session.hooks.dispatch_close();
    StatusCode::NO_CONTENT.into_response()
}

/// Server-side transport for one Streamable HTTP session.
pub struct StreamableServerTransport {
    session: Arc<SessionShared>,
    sessions: SessionMap,
    started: bool,
}

impl StreamableServerTransport {
    /// The session id assigned to this connection.
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Queue an event on the standalone stream, retaining it for replay.
    async fn send_standalone(&self, data: String) {
        let (event, live) = {
            let mut standalone = self
                .session
                .standalone
                .lock()
                .expect("standalone stream poisoned");
            let seq = standalone.next_seq;
            standalone.next_seq += 1;
            let event = StreamEvent { seq, data };
            standalone.store.push_back(event.clone());
            while standalone.store.len() > self.session.replay_buffer {
                standalone.store.pop_front();
            }
            (event, standalone.live.clone())
        };

        if let Some(live) = live {
            if live.send(event).await.is_err() {
                // Receiver gone: client dropped the GET stream. The store
                // keeps the event for replay on reconnect.
                let mut standalone = self
                    .session
                    .standalone
                    .lock()
                    .expect("standalone stream poisoned");
                standalone.live = None;
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableServerTransport {
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
        Ok(())
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.session.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                transport_type: TRANSPORT_TYPE.to_string(),
            }
            .into());
        }

        let data = message.to_wire()?;

        match &message {
            // Replies go to the POST stream that carried their request.
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                let id = match message.id() {
                    Some(id) => id.clone(),
                    None => {
                        return Err(TransportError::SendFailed {
                            transport_type: TRANSPORT_TYPE.to_string(),
                            reason: "reply without id".to_string(),
                        }
                        .into())
                    }
                };
                let route = {
                    let mut routes = self.session.routes.lock().expect("route table poisoned");
                    let route = routes.by_id.remove(&id);
                    if let Some(route) = &route {
                        if let Some(token) = &route.token {
                            routes.by_token.remove(token);
                        }
                    }
                    route
                };

                match route {
                    Some(route) => {
                        let seq = route.seq.fetch_add(1, Ordering::SeqCst);
                        if route.tx.send(StreamEvent { seq, data: data.clone() }).await.is_err() {
                            // POST stream already gone; keep the reply alive
                            // on the standalone stream.
                            self.send_standalone(data).await;
                        }
                    }
                    None => self.send_standalone(data).await,
                }
            }
            // Progress rides the stream of the request it belongs to.
            JsonRpcMessage::Notification(notification)
                if notification.method == methods::PROGRESS =>
            {
                let route = extract_progress_token(notification.params.as_ref()).and_then(|token| {
                    let routes = self.session.routes.lock().expect("route table poisoned");
                    routes.by_token.get(&token).cloned()
                });
                match route {
                    Some((tx, seq)) => {
                        let seq = seq.fetch_add(1, Ordering::SeqCst);
                        if tx.send(StreamEvent { seq, data: data.clone() }).await.is_err() {
                            self.send_standalone(data).await;
                        }
                    }
                    None => self.send_standalone(data).await,
                }
            }
            _ => self.send_standalone(data).await,
        }

        Ok(())
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.session.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("closing streamable HTTP session {}", self.session.session_id);
        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(&self.session.session_id);
        {
            let mut routes = self.session.routes.lock().expect("route table poisoned");
            routes.by_id.clear();
            routes.by_token.clear();
        }
        self.session
            .standalone
            .lock()
            .expect("standalone stream poisoned")
            .live = None;
        self.session.hooks.dispatch_close();
        Ok(())
    }

    fn hooks(&self) -> &TransportHooks {
        &self.session.hooks
    }
}
