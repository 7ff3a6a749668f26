//! Protocol engine: the session-agnostic middle layer between transports
//! and the client/server sessions.
//!
//! The engine owns exactly one transport and the pending-request table. It
//! provides:
//!
//! - **Correlation**: outbound requests get monotonically increasing integer
//!   ids starting at 0; each is registered in the pending table exactly once
//!   and removed exactly once (response, error, timeout, cancellation, or
//!   transport close). Replies with unknown ids are logged and dropped.
//! - **Progress**: a progress observer bound before send receives every
//!   `notifications/progress` carrying the request's token, in arrival
//!   order. Unknown tokens are dropped silently.
//! - **Cancellation**: both directions. Cancelling an outbound request sends
//!   `notifications/cancelled` best-effort and fails the local waiter.
//!   Receiving `notifications/cancelled` interrupts the matching inbound
//!   handler task and suppresses its reply.
//! - **Timeouts**: default 60 s, per-request override, optional
//!   reset-on-progress, optional absolute `max_total_timeout`.
//! - **Capability gates**: outbound requests against a peer that does not
//!   advertise the method's capability fail locally before any bytes are
//!   sent; inbound requests for capabilities this side does not advertise
//!   are answered with method-not-found.
//!
//! Inbound traffic is forwarded from the transport's reader task through a
//! bounded channel into the engine task; overflow closes the session rather
//! than buffering without limit.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, McpResult, ProtocolError, TransportError};
use crate::messages::progress::{attach_progress_token, extract_progress_token};
use crate::messages::{
    methods, CancelledNotification, ClientCapabilities, JsonRpcError, JsonRpcErrorResponse,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ProgressNotification,
    ProgressToken, RequestId, ServerCapabilities,
};
use crate::transport::Transport;

/// Default per-request timeout when neither the engine options nor the
/// request override one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Which end of the handshake this engine serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// The initiating side: sends `initialize`, receives the result.
    Client,
    /// The accepting side: receives `initialize`, answers it.
    Server,
}

/// Lifecycle of a session, shared between the engine gate and the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake traffic yet
    Uninitialized,
    /// Handshake request seen, completion notification pending
    Initializing,
    /// Handshake complete; normal dispatch
    Ready,
    /// Shutdown underway
    Closing,
    /// Session over; all pending requests failed
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Normalized view of a peer's advertised capability flags.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    flags: HashSet<String>,
}

impl CapabilitySet {
    /// Whether the given capability was advertised.
    pub fn supports(&self, capability: &str) -> bool {
        self.flags.contains(capability)
    }

    /// Whether no capabilities were recorded yet.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl From<&ServerCapabilities> for CapabilitySet {
    fn from(caps: &ServerCapabilities) -> Self {
        let mut flags = HashSet::new();
        if caps.tools.is_some() {
            flags.insert("tools".to_string());
        }
        if caps.prompts.is_some() {
            flags.insert("prompts".to_string());
        }
        if caps.resources.is_some() {
            flags.insert("resources".to_string());
        }
        if caps.logging.is_some() {
            flags.insert("logging".to_string());
        }
        if caps.completions.is_some() {
            flags.insert("completions".to_string());
        }
        Self { flags }
    }
}

impl From<&ClientCapabilities> for CapabilitySet {
    fn from(caps: &ClientCapabilities) -> Self {
        let mut flags = HashSet::new();
        if caps.sampling.is_some() {
            flags.insert("sampling".to_string());
        }
        if caps.roots.is_some() {
            flags.insert("roots".to_string());
        }
        if caps.elicitation.is_some() {
            flags.insert("elicitation".to_string());
        }
        Self { flags }
    }
}

/// Capability the responder must advertise for a method, keyed by the
/// method's namespace prefix. Handshake and runtime built-ins need none.
fn required_capability(method: &str) -> Option<&'static str> {
    let prefix = method.split('/').next().unwrap_or(method);
    match prefix {
        "tools" => Some("tools"),
        "prompts" => Some("prompts"),
        "resources" => Some("resources"),
        "logging" => Some("logging"),
        "completion" => Some("completions"),
        "sampling" => Some("sampling"),
        "roots" => Some("roots"),
        "elicitation" => Some("elicitation"),
        _ => None,
    }
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-request timeout applied when the request sets none
    pub default_request_timeout: Duration,

    /// Bound on concurrently executing inbound handlers (None = unbounded)
    pub max_concurrent_requests: Option<usize>,

    /// Depth of the transport-to-engine channel; overflow closes the session
    pub inbound_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_requests: None,
            inbound_buffer: 256,
        }
    }
}

/// Per-request options for [`ProtocolEngine::request`].
#[derive(Default)]
pub struct RequestOptions {
    /// Override of the engine's default timeout
    pub timeout: Option<Duration>,

    /// Push the deadline forward on every inbound progress notification
    pub reset_timeout_on_progress: bool,

    /// Absolute ceiling on the request's lifetime, progress or not
    pub max_total_timeout: Option<Duration>,

    /// Progress observer; its presence attaches a progress token to the
    /// outbound request
    pub progress: Option<mpsc::UnboundedSender<ProgressNotification>>,

    /// Cancellation handle for the caller
    pub cancellation: Option<CancellationToken>,
}

impl RequestOptions {
    /// Options with a specific timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    /// Attach a fresh progress channel, returning the receiving end.
    pub fn with_progress(mut self) -> (Self, mpsc::UnboundedReceiver<ProgressNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress = Some(tx);
        (self, rx)
    }

    /// Attach a cancellation handle.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Context handed to inbound request handlers.
///
/// Lets a handler emit progress for the current request without knowing the
/// token, and observe cooperative cancellation at its suspension points.
#[derive(Clone)]
pub struct RequestContext {
    /// Id of the request being served
    pub request_id: RequestId,
    /// Method being served
    pub method: String,
    progress_token: Option<ProgressToken>,
    cancellation: CancellationToken,
    engine: ProtocolEngine,
}

impl RequestContext {
    /// Whether the requester has abandoned this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the requester abandons this request.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Emit a progress update for the current request.
    ///
    /// A no-op when the requester attached no progress token.
    pub async fn send_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> McpResult<()> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let notification = ProgressNotification {
            progress_token: token.clone(),
            progress,
            total,
            message,
        };
        self.engine
            .notify(methods::PROGRESS, Some(serde_json::to_value(notification)?))
            .await
    }
}

/// Handler for one inbound request method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Serve one request; the returned value becomes the response result.
    async fn handle(&self, context: RequestContext, params: Option<Value>) -> McpResult<Value>;
}

/// Handler for inbound notifications.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Observe one notification. Failures are logged, never reported back.
    async fn handle(&self, method: &str, params: Option<Value>) -> McpResult<()>;
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<Value>> + Send + 'static,
{
    async fn handle(&self, context: RequestContext, params: Option<Value>) -> McpResult<Value> {
        (self.0)(context, params).await
    }
}

/// Wrap an async closure as a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<Value>> + Send + 'static,
{
    Arc::new(FnRequestHandler(f))
}

struct FnNotificationHandler<F>(F);

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<()>> + Send + 'static,
{
    async fn handle(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        (self.0)(method.to_string(), params).await
    }
}

/// Wrap an async closure as a [`NotificationHandler`].
pub fn notification_handler<F, Fut>(f: F) -> Arc<dyn NotificationHandler>
where
    F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<()>> + Send + 'static,
{
    Arc::new(FnNotificationHandler(f))
}

struct PendingEntry {
    method: String,
    completion: oneshot::Sender<McpResult<Value>>,
    progress: Option<mpsc::UnboundedSender<ProgressNotification>>,
    activity: Arc<Notify>,
    last_progress: f64,
}

/// Observer for transport-level faults that do not end the session, such
/// as replay gaps on a resumed stream. The session stays up; the observer
/// decides what to do about the fault.
pub type TransportErrorHandler = Arc<dyn Fn(&McpError) + Send + Sync>;

struct EngineShared {
    role: SessionRole,
    options: EngineOptions,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    request_handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    notification_handlers: RwLock<HashMap<String, Vec<Arc<dyn NotificationHandler>>>>,
    error_handlers: RwLock<Vec<TransportErrorHandler>>,
    inflight_inbound: Mutex<HashMap<RequestId, CancellationToken>>,
    queued_inbound: Mutex<Vec<JsonRpcRequest>>,
    next_id: AtomicI64,
    state: RwLock<SessionState>,
    peer_capabilities: RwLock<CapabilitySet>,
    own_capabilities: RwLock<CapabilitySet>,
    concurrency: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

/// The protocol engine. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct ProtocolEngine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine").finish_non_exhaustive()
    }
}

/// Non-owning engine handle for handlers stored inside the engine's own
/// registry; a strong clone there would keep the session alive forever.
#[derive(Clone)]
pub struct WeakProtocolEngine {
    shared: std::sync::Weak<EngineShared>,
}

impl WeakProtocolEngine {
    /// Recover the engine, unless the session is already gone.
    pub fn upgrade(&self) -> Option<ProtocolEngine> {
        self.shared.upgrade().map(|shared| ProtocolEngine { shared })
    }
}

impl ProtocolEngine {
    /// Wire an engine to a transport.
    ///
    /// Hooks are registered on the transport and the engine task begins
    /// waiting for inbound messages, but the transport itself is not started
    /// until [`open`](Self::open) — sessions register their handlers in
    /// between so no early inbound request can miss its dispatch target.
    /// The transport must be fresh: one with hooks already registered is
    /// rejected.
    pub async fn new(
        transport: Box<dyn Transport>,
        role: SessionRole,
        options: EngineOptions,
    ) -> McpResult<Self> {
        let concurrency = options
            .max_concurrent_requests
            .map(|n| Arc::new(Semaphore::new(n)));
        let (inbound_tx, inbound_rx) = mpsc::channel::<JsonRpcMessage>(options.inbound_buffer);

        let shared = Arc::new(EngineShared {
            role,
            options,
            transport: tokio::sync::Mutex::new(transport),
            pending: Mutex::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            error_handlers: RwLock::new(Vec::new()),
            inflight_inbound: Mutex::new(HashMap::new()),
            queued_inbound: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(0),
            state: RwLock::new(SessionState::Uninitialized),
            peer_capabilities: RwLock::new(CapabilitySet::default()),
            own_capabilities: RwLock::new(CapabilitySet::default()),
            concurrency,
            shutdown: CancellationToken::new(),
        });
        let engine = Self { shared };

        {
            let transport = engine.shared.transport.lock().await;

            let tx = inbound_tx.clone();
            let shutdown = engine.shared.shutdown.clone();
            let hooks = transport.hooks().clone();
            transport.on_message(Arc::new(move |message| {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message) {
                    tracing::error!("inbound channel overflow, closing session");
                    hooks.dispatch_error(
                        TransportError::Closed {
                            transport_type: "session".to_string(),
                        }
                        .into(),
                    );
                    shutdown.cancel();
                }
            }))?;

            let error_shared = Arc::downgrade(&engine.shared);
            transport.on_error(Arc::new(move |error| {
                tracing::warn!("transport error: {error}");
                if let Some(shared) = error_shared.upgrade() {
                    let handlers = shared
                        .error_handlers
                        .read()
                        .expect("handler lock poisoned")
                        .clone();
                    for handler in handlers {
                        handler(&error);
                    }
                }
            }))?;

            let shutdown = engine.shared.shutdown.clone();
            transport.on_close(Arc::new(move || {
                shutdown.cancel();
            }))?;
        }

        let worker = engine.clone();
        tokio::spawn(async move {
            worker.run(inbound_rx).await;
        });

        Ok(engine)
    }

    /// Start the underlying transport; inbound traffic begins flowing.
    pub async fn open(&self) -> McpResult<()> {
        self.shared.transport.lock().await.start().await
    }

    /// A non-owning handle to this engine.
    pub fn downgrade(&self) -> WeakProtocolEngine {
        WeakProtocolEngine {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.read().expect("state lock poisoned")
    }

    /// Move the session to a new state, draining any requests queued while
    /// the handshake was completing.
    pub fn set_state(&self, state: SessionState) {
        {
            let mut guard = self.shared.state.write().expect("state lock poisoned");
            tracing::debug!("session state {} -> {}", *guard, state);
            *guard = state;
        }
        if state == SessionState::Ready {
            let queued: Vec<JsonRpcRequest> = {
                let mut queue = self
                    .shared
                    .queued_inbound
                    .lock()
                    .expect("queue lock poisoned");
                queue.drain(..).collect()
            };
            for request in queued {
                self.dispatch_request(request);
            }
        }
    }

    /// Record what the peer advertised at handshake time.
    pub fn set_peer_capabilities(&self, capabilities: CapabilitySet) {
        *self
            .shared
            .peer_capabilities
            .write()
            .expect("capability lock poisoned") = capabilities;
    }

    /// Record what this side advertises.
    pub fn set_own_capabilities(&self, capabilities: CapabilitySet) {
        *self
            .shared
            .own_capabilities
            .write()
            .expect("capability lock poisoned") = capabilities;
    }

    /// Register the handler for a request method.
    ///
    /// One handler per method; the previous one is returned so replacement
    /// stays visible at the call site.
    pub fn set_request_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Option<Arc<dyn RequestHandler>> {
        self.shared
            .request_handlers
            .write()
            .expect("handler lock poisoned")
            .insert(method.into(), handler)
    }

    /// Register an additional handler for a notification method.
    ///
    /// Handlers run sequentially in registration order.
    pub fn add_notification_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        self.shared
            .notification_handlers
            .write()
            .expect("handler lock poisoned")
            .entry(method.into())
            .or_default()
            .push(handler);
    }

    /// Register an observer for non-fatal transport faults (stream gaps,
    /// rejected reconnects). Observers run in registration order.
    pub fn add_error_handler(&self, handler: TransportErrorHandler) {
        self.shared
            .error_handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    /// True once the session has shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves when the session shuts down.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Send a request and suspend until its response, error, timeout, or
    /// cancellation.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        if self.is_closed() {
            return Err(closed_error());
        }

        // Capability gate: fail locally before any bytes are written.
        if let Some(capability) = required_capability(method) {
            let advertised = self
                .shared
                .peer_capabilities
                .read()
                .expect("capability lock poisoned")
                .supports(capability);
            if !advertised {
                return Err(ProtocolError::CapabilityNotSupported {
                    method: method.to_string(),
                    capability: capability.to_string(),
                }
                .into());
            }
        }

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (completion_tx, mut completion_rx) = oneshot::channel();
        let activity = Arc::new(Notify::new());

        let mut params = params;
        if options.progress.is_some() {
            let token = ProgressToken::from(&id);
            params = Some(attach_progress_token(params, &token));
        }

        {
            let mut pending = self.shared.pending.lock().expect("pending lock poisoned");
            pending.insert(
                id.clone(),
                PendingEntry {
                    method: method.to_string(),
                    completion: completion_tx,
                    progress: options.progress,
                    activity: activity.clone(),
                    last_progress: f64::NEG_INFINITY,
                },
            );
        }

        let request = JsonRpcRequest {
            jsonrpc: crate::messages::JSONRPC_VERSION.to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        if let Err(e) = self.send_message(JsonRpcMessage::Request(request)).await {
            self.take_pending(&id);
            return Err(e);
        }

        let timeout = options
            .timeout
            .unwrap_or(self.shared.options.default_request_timeout);
        let started = Instant::now();
        let max_deadline = options.max_total_timeout.map(|d| started + d);
        let clamp = |deadline: Instant| match max_deadline {
            Some(max) => deadline.min(max),
            None => deadline,
        };

        let sleep = tokio::time::sleep_until(clamp(started + timeout));
        tokio::pin!(sleep);
        let cancellation = options.cancellation.unwrap_or_default();

        loop {
            tokio::select! {
                result = &mut completion_rx => {
                    return match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(closed_error()),
                    };
                }
                _ = &mut sleep => {
                    self.take_pending(&id);
                    self.send_cancelled(&id, "timeout").await;
                    return Err(ProtocolError::RequestTimeout {
                        method: method.to_string(),
                        timeout,
                    }
                    .into());
                }
                _ = activity.notified(), if options.reset_timeout_on_progress => {
                    sleep.as_mut().reset(clamp(Instant::now() + timeout));
                }
                _ = cancellation.cancelled() => {
                    self.take_pending(&id);
                    self.send_cancelled(&id, "cancelled").await;
                    return Err(ProtocolError::RequestCancelled {
                        reason: "cancelled by caller".to_string(),
                    }
                    .into());
                }
                _ = self.shared.shutdown.cancelled() => {
                    self.take_pending(&id);
                    return Err(closed_error());
                }
            }
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let notification = JsonRpcNotification {
            jsonrpc: crate::messages::JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        };
        self.send_message(JsonRpcMessage::Notification(notification))
            .await
    }

    /// Close the session: the transport shuts down and every pending
    /// request fails with a transport-closed error. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.write().expect("state lock poisoned");
            if *state != SessionState::Closed {
                *state = SessionState::Closing;
            }
        }
        self.shared.shutdown.cancel();

        let mut transport = self.shared.transport.lock().await;
        if let Err(e) = transport.close().await {
            tracing::debug!("transport close reported: {e}");
        }
        drop(transport);

        self.fail_all_pending();
        *self.shared.state.write().expect("state lock poisoned") = SessionState::Closed;
    }

    async fn send_message(&self, message: JsonRpcMessage) -> McpResult<()> {
        let mut transport = self.shared.transport.lock().await;
        transport.send(message).await
    }

    async fn send_cancelled(&self, id: &RequestId, reason: &str) {
        let payload = CancelledNotification::new(id.clone(), Some(reason.to_string()));
        match serde_json::to_value(payload) {
            Ok(params) => {
                if let Err(e) = self.notify(methods::CANCELLED, Some(params)).await {
                    tracing::debug!("failed to send cancellation for {id}: {e}");
                }
            }
            Err(e) => tracing::debug!("failed to encode cancellation for {id}: {e}"),
        }
    }

    fn take_pending(&self, id: &RequestId) -> Option<PendingEntry> {
        self.shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id)
    }

    fn fail_all_pending(&self) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.shared.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            tracing::debug!("failing pending request '{}': transport closed", entry.method);
            let _ = entry.completion.send(Err(closed_error()));
        }
    }

    /// Engine task: drains the inbound channel until shutdown.
    async fn run(self, mut inbound: mpsc::Receiver<JsonRpcMessage>) {
        loop {
            let message = tokio::select! {
                message = inbound.recv() => message,
                _ = self.shared.shutdown.cancelled() => None,
            };
            let Some(message) = message else { break };

            match message {
                JsonRpcMessage::Response(response) => self.complete(response.id, Ok(response.result)),
                JsonRpcMessage::Error(error) => {
                    self.complete(error.id, Err(McpError::Rpc(error.error)))
                }
                JsonRpcMessage::Notification(notification) => {
                    self.handle_notification(notification)
                }
                JsonRpcMessage::Request(request) => self.gate_request(request),
            }
        }

        self.shared.shutdown.cancel();
        self.fail_all_pending();
        let state = self.state();
        if state != SessionState::Closed {
            self.set_state(SessionState::Closed);
        }
        tracing::debug!("engine task finished");
    }

    fn complete(&self, id: RequestId, outcome: McpResult<Value>) {
        match self.take_pending(&id) {
            Some(entry) => {
                let _ = entry.completion.send(outcome);
            }
            None => {
                tracing::warn!("dropping reply for unknown request id {id}");
            }
        }
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            methods::PROGRESS => {
                self.route_progress(&notification);
                // Progress is engine business; user handlers may observe too.
            }
            methods::CANCELLED => {
                self.cancel_inbound(&notification);
                return;
            }
            _ => {}
        }

        let handlers: Vec<Arc<dyn NotificationHandler>> = self
            .shared
            .notification_handlers
            .read()
            .expect("handler lock poisoned")
            .get(&notification.method)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            if notification.method != methods::PROGRESS {
                tracing::debug!("no handler for notification '{}'", notification.method);
            }
            return;
        }

        let method = notification.method.clone();
        let params = notification.params.clone();
        tokio::spawn(async move {
            for handler in handlers {
                if let Err(e) = handler.handle(&method, params.clone()).await {
                    tracing::warn!("notification handler for '{method}' failed: {e}");
                }
            }
        });
    }

    fn route_progress(&self, notification: &JsonRpcNotification) {
        let progress: ProgressNotification = match notification
            .params
            .clone()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(progress)) => progress,
            _ => {
                tracing::warn!("malformed progress notification dropped");
                return;
            }
        };

        let id = match &progress.progress_token {
            ProgressToken::Number(n) => RequestId::Number(*n),
            ProgressToken::String(s) => RequestId::String(s.clone()),
        };

        let mut pending = self.shared.pending.lock().expect("pending lock poisoned");
        let Some(entry) = pending.get_mut(&id) else {
            tracing::debug!(
                "progress for unknown token {} dropped",
                progress.progress_token
            );
            return;
        };

        if progress.progress < entry.last_progress {
            tracing::warn!(
                "non-monotonic progress for '{}': {} after {}",
                entry.method,
                progress.progress,
                entry.last_progress
            );
        }
        entry.last_progress = entry.last_progress.max(progress.progress);
        entry.activity.notify_one();

        if let Some(sink) = &entry.progress {
            if sink.send(progress).is_err() {
                tracing::debug!("progress observer dropped; discarding updates");
            }
        }
    }

    fn cancel_inbound(&self, notification: &JsonRpcNotification) {
        let cancelled: CancelledNotification = match notification
            .params
            .clone()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(cancelled)) => cancelled,
            _ => {
                tracing::warn!("malformed cancellation notification dropped");
                return;
            }
        };

        let token = self
            .shared
            .inflight_inbound
            .lock()
            .expect("inflight lock poisoned")
            .remove(&cancelled.request_id);
        match token {
            Some(token) => {
                tracing::debug!(
                    "cancelling inbound request {} ({})",
                    cancelled.request_id,
                    cancelled.reason.as_deref().unwrap_or("no reason")
                );
                token.cancel();
            }
            // Response already written (or id unknown): drop silently.
            None => tracing::debug!(
                "cancellation for unknown or finished request {} ignored",
                cancelled.request_id
            ),
        }
    }

    /// Session-state gate in front of inbound request dispatch.
    fn gate_request(&self, request: JsonRpcRequest) {
        let state = self.state();
        match state {
            SessionState::Ready => self.dispatch_request(request),
            SessionState::Uninitialized => {
                if self.shared.role == SessionRole::Server && request.method == methods::INITIALIZE
                {
                    self.dispatch_request(request);
                } else {
                    self.reply_error(
                        request.id,
                        JsonRpcError::server_not_initialized(format!(
                            "'{}' before initialize",
                            request.method
                        )),
                    );
                }
            }
            SessionState::Initializing => {
                if request.method == methods::INITIALIZE {
                    self.reply_error(
                        request.id,
                        JsonRpcError::invalid_request("session already initializing"),
                    );
                } else if self.shared.role == SessionRole::Server {
                    // Held until the initialized notification flips the
                    // session to ready, then drained in arrival order.
                    tracing::debug!("queueing '{}' until session is ready", request.method);
                    self.shared
                        .queued_inbound
                        .lock()
                        .expect("queue lock poisoned")
                        .push(request);
                } else {
                    self.reply_error(
                        request.id,
                        JsonRpcError::server_not_initialized(format!(
                            "'{}' during handshake",
                            request.method
                        )),
                    );
                }
            }
            SessionState::Closing | SessionState::Closed => {
                tracing::debug!(
                    "dropping inbound request '{}' in state {state}",
                    request.method
                );
            }
        }
    }

    fn dispatch_request(&self, request: JsonRpcRequest) {
        let handler = self
            .shared
            .request_handlers
            .read()
            .expect("handler lock poisoned")
            .get(&request.method)
            .cloned();
        let Some(handler) = handler else {
            self.reply_error(request.id, JsonRpcError::method_not_found(&request.method));
            return;
        };

        // Serving a method whose capability this side never advertised is
        // indistinguishable from not having the method at all.
        if let Some(capability) = required_capability(&request.method) {
            let advertised = self
                .shared
                .own_capabilities
                .read()
                .expect("capability lock poisoned")
                .supports(capability);
            if !advertised {
                self.reply_error(request.id, JsonRpcError::method_not_found(&request.method));
                return;
            }
        }

        let cancellation = CancellationToken::new();
        self.shared
            .inflight_inbound
            .lock()
            .expect("inflight lock poisoned")
            .insert(request.id.clone(), cancellation.clone());

        let context = RequestContext {
            request_id: request.id.clone(),
            method: request.method.clone(),
            progress_token: extract_progress_token(request.params.as_ref()),
            cancellation: cancellation.clone(),
            engine: self.clone(),
        };

        let engine = self.clone();
        let permit_source = self.shared.concurrency.clone();
        tokio::spawn(async move {
            let _permit = match &permit_source {
                Some(semaphore) => match semaphore.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            let id = request.id.clone();
            let outcome = tokio::select! {
                outcome = handler.handle(context, request.params) => Some(outcome),
                _ = cancellation.cancelled() => None,
            };

            // The inflight entry is the reply permit: cancellation removes
            // it first and thereby suppresses any late reply.
            let may_reply = engine
                .shared
                .inflight_inbound
                .lock()
                .expect("inflight lock poisoned")
                .remove(&id)
                .is_some();

            let Some(outcome) = outcome else { return };
            if !may_reply {
                tracing::debug!("suppressing reply for cancelled request {id}");
                return;
            }

            let reply = match outcome {
                Ok(result) => JsonRpcMessage::Response(JsonRpcResponse::new(id, result)),
                Err(error) => {
                    JsonRpcMessage::Error(JsonRpcErrorResponse::new(id, error.to_jsonrpc_error()))
                }
            };
            if let Err(e) = engine.send_message(reply).await {
                tracing::warn!("failed to send reply: {e}");
            }
        });
    }

    fn reply_error(&self, id: RequestId, error: JsonRpcError) {
        let engine = self.clone();
        tokio::spawn(async move {
            let reply = JsonRpcMessage::Error(JsonRpcErrorResponse::new(id, error));
            if let Err(e) = engine.send_message(reply).await {
                tracing::warn!("failed to send error reply: {e}");
            }
        });
    }
}

fn closed_error() -> McpError {
    TransportError::Closed {
        transport_type: "session".to_string(),
    }
    .into()
}
