//! MCP transport layer abstraction and implementations.
//!
//! This module provides a unified interface for all MCP transport mechanisms:
//! - **stdio**: newline-delimited JSON over byte streams (child processes,
//!   pipes, in-memory duplex pairs)
//! - **SSE**: long-lived `text/event-stream` inbound plus an HTTP POST
//!   back-channel advertised by the stream's first event
//! - **Streamable HTTP**: a single URL handling POST/GET/DELETE with session
//!   resumption
//!
//! A transport is a duplex message carrier and nothing more: it moves
//! [`JsonRpcMessage`] values in both directions and reports its lifecycle
//! through three hooks. Correlation, timeouts and dispatch live a layer up,
//! in the protocol engine.
//!
//! # Contract
//!
//! - `start()` begins reading; calling it twice fails with
//!   [`TransportError::AlreadyStarted`].
//! - `send()` returns once the message is handed to the underlying medium,
//!   not once the peer acknowledges it. After `close()` it deterministically
//!   fails with [`TransportError::Closed`].
//! - `close()` is idempotent: it stops reading, releases the medium and
//!   fires the close hook exactly once.
//! - Each hook accepts at most one handler; a second registration fails with
//!   [`TransportError::HandlerAlreadyRegistered`].
//! - Messages are delivered to the message hook in the order the peer sent
//!   them over this transport instance.

pub mod config;

#[cfg(feature = "stdio")]
pub mod stdio;

#[cfg(feature = "sse")]
pub mod sse;

#[cfg(feature = "streamable-http")]
pub mod streamable;

pub use config::{AuthConfig, SseConfig, StdioConfig, StreamableHttpConfig, TransportConfig};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{McpError, McpResult, TransportError};
use crate::messages::JsonRpcMessage;

/// Callback invoked for every inbound message, in arrival order.
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

/// Callback invoked for transport-level faults that do not end the session.
pub type ErrorHandler = Arc<dyn Fn(McpError) + Send + Sync>;

/// Callback invoked exactly once when the transport shuts down.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Core transport trait for MCP communication.
///
/// Implementations own their network resources (child process, HTTP
/// connections, response streams) and forward inbound traffic from their
/// internal reader task through the registered hooks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in error context and logs ("stdio", "sse", ...).
    fn transport_type(&self) -> &'static str;

    /// Begin reading from the underlying medium.
    ///
    /// Hooks must be registered before `start()`; messages that arrive with
    /// no message handler registered are dropped with a warning.
    async fn start(&mut self) -> McpResult<()>;

    /// Hand one outbound message to the underlying medium.
    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()>;

    /// Stop reading, release the medium and fire the close hook.
    async fn close(&mut self) -> McpResult<()>;

    /// The hook registry shared with this transport's reader task.
    fn hooks(&self) -> &TransportHooks;

    /// Register the inbound message callback. At most one per transport.
    fn on_message(&self, handler: MessageHandler) -> McpResult<()> {
        self.hooks().set_message(handler)
    }

    /// Register the error callback. At most one per transport.
    fn on_error(&self, handler: ErrorHandler) -> McpResult<()> {
        self.hooks().set_error(handler)
    }

    /// Register the close callback. At most one per transport.
    fn on_close(&self, handler: CloseHandler) -> McpResult<()> {
        self.hooks().set_close(handler)
    }
}

#[derive(Default)]
struct HookSlots {
    message: Option<MessageHandler>,
    error: Option<ErrorHandler>,
    close: Option<CloseHandler>,
    close_fired: bool,
    backlog: Vec<JsonRpcMessage>,
}

/// Shared hook registry used by all transport implementations.
///
/// Enforces at-most-once registration per hook and exactly-once close
/// dispatch. Cloning yields another handle to the same registry, which is
/// how reader tasks keep delivering after the transport struct moved.
///
/// Messages that arrive before a message handler is registered are held in
/// a backlog and replayed, in order, on registration. Server-side HTTP
/// transports need this: a client can POST into a freshly minted session
/// before the embedding server has wired the transport up.
#[derive(Clone, Default)]
pub struct TransportHooks {
    slots: Arc<Mutex<HookSlots>>,
}

impl TransportHooks {
    /// Create an empty hook registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the message handler, replaying any backlog in order.
    pub fn set_message(&self, handler: MessageHandler) -> McpResult<()> {
        {
            let mut slots = self.slots.lock().expect("hook registry poisoned");
            if slots.message.is_some() {
                return Err(TransportError::HandlerAlreadyRegistered {
                    hook: "message".to_string(),
                }
                .into());
            }
            slots.message = Some(handler.clone());
        }
        loop {
            let next = {
                let mut slots = self.slots.lock().expect("hook registry poisoned");
                if slots.backlog.is_empty() {
                    break;
                }
                slots.backlog.remove(0)
            };
            handler(next);
        }
        Ok(())
    }

    /// Install the error handler.
    pub fn set_error(&self, handler: ErrorHandler) -> McpResult<()> {
        let mut slots = self.slots.lock().expect("hook registry poisoned");
        if slots.error.is_some() {
            return Err(TransportError::HandlerAlreadyRegistered {
                hook: "error".to_string(),
            }
            .into());
        }
        slots.error = Some(handler);
        Ok(())
    }

    /// Install the close handler.
    ///
    /// When the transport already closed before registration, the handler
    /// fires immediately.
    pub fn set_close(&self, handler: CloseHandler) -> McpResult<()> {
        let fire_now = {
            let mut slots = self.slots.lock().expect("hook registry poisoned");
            if slots.close.is_some() {
                return Err(TransportError::HandlerAlreadyRegistered {
                    hook: "close".to_string(),
                }
                .into());
            }
            slots.close = Some(handler.clone());
            slots.close_fired
        };
        if fire_now {
            handler();
        }
        Ok(())
    }

    /// Deliver one inbound message to the registered handler, or hold it in
    /// the backlog until one is registered.
    pub fn dispatch_message(&self, message: JsonRpcMessage) {
        let handler = {
            let mut slots = self.slots.lock().expect("hook registry poisoned");
            match slots.message.clone() {
                Some(handler) => handler,
                None => {
                    tracing::debug!("inbound message held until a handler is registered");
                    slots.backlog.push(message);
                    return;
                }
            }
        };
        handler(message);
    }

    /// Report a non-fatal transport fault.
    pub fn dispatch_error(&self, error: McpError) {
        let handler = {
            let slots = self.slots.lock().expect("hook registry poisoned");
            slots.error.clone()
        };
        match handler {
            Some(handler) => handler(error),
            None => tracing::warn!("transport error dropped: {error}"),
        }
    }

    /// Fire the close handler. Later calls are no-ops.
    pub fn dispatch_close(&self) {
        let handler = {
            let mut slots = self.slots.lock().expect("hook registry poisoned");
            if slots.close_fired {
                return;
            }
            slots.close_fired = true;
            slots.close.clone()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Whether the close handler has already fired.
    pub fn closed(&self) -> bool {
        self.slots.lock().expect("hook registry poisoned").close_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::JsonRpcNotification;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_register_at_most_once() {
        let hooks = TransportHooks::new();

        assert!(hooks.set_message(Arc::new(|_| {})).is_ok());
        let second = hooks.set_message(Arc::new(|_| {}));
        assert!(matches!(
            second,
            Err(McpError::Transport(
                TransportError::HandlerAlreadyRegistered { .. }
            ))
        ));

        assert!(hooks.set_error(Arc::new(|_| {})).is_ok());
        assert!(hooks.set_error(Arc::new(|_| {})).is_err());

        assert!(hooks.set_close(Arc::new(|| {})).is_ok());
        assert!(hooks.set_close(Arc::new(|| {})).is_err());
    }

    #[test]
    fn test_message_dispatch_in_order() {
        let hooks = TransportHooks::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        hooks
            .set_message(Arc::new(move |message| {
                if let JsonRpcMessage::Notification(n) = message {
                    sink.lock().unwrap().push(n.method);
                }
            }))
            .unwrap();

        for method in ["a", "b", "c"] {
            hooks.dispatch_message(JsonRpcMessage::Notification(
                JsonRpcNotification::without_params(method),
            ));
        }

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_close_fires_exactly_once() {
        let hooks = TransportHooks::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        hooks
            .set_close(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        hooks.dispatch_close();
        hooks.dispatch_close();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(hooks.closed());
    }

    #[test]
    fn test_dispatch_without_handlers_does_not_panic() {
        let hooks = TransportHooks::new();
        hooks.dispatch_message(JsonRpcMessage::Notification(
            JsonRpcNotification::without_params("x"),
        ));
        hooks.dispatch_error(McpError::internal("x"));
        hooks.dispatch_close();
    }

    #[test]
    fn test_backlog_replays_on_registration() {
        let hooks = TransportHooks::new();
        for method in ["early-1", "early-2"] {
            hooks.dispatch_message(JsonRpcMessage::Notification(
                JsonRpcNotification::without_params(method),
            ));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hooks
            .set_message(Arc::new(move |message| {
                if let Some(method) = message.method() {
                    sink.lock().unwrap().push(method.to_string());
                }
            }))
            .unwrap();

        hooks.dispatch_message(JsonRpcMessage::Notification(
            JsonRpcNotification::without_params("live"),
        ));

        assert_eq!(*seen.lock().unwrap(), vec!["early-1", "early-2", "live"]);
    }

    #[test]
    fn test_close_handler_fires_immediately_when_already_closed() {
        let hooks = TransportHooks::new();
        hooks.dispatch_close();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        hooks
            .set_close(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
