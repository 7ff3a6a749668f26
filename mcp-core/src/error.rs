//! Error types for MCP (Model Context Protocol) operations.
//!
//! This module provides comprehensive error handling for the protocol
//! runtime: codec failures, transport failures, protocol-state violations,
//! and errors reported by the remote peer.
//!
//! # Design Philosophy
//!
//! The error system is designed to be:
//! - **Informative**: Provide clear, actionable error messages
//! - **Structured**: Use strongly-typed error variants for programmatic handling
//! - **Transport-aware**: Include transport-specific error context
//! - **Wire-mappable**: Every local fault maps to a JSON-RPC error code when
//!   it has to be reported to the peer

use std::time::Duration;
use thiserror::Error;

use crate::messages::core::{self, JsonRpcError};

/// The main error type for all MCP operations.
///
/// # Examples
///
/// ```rust
/// use mcp_core::error::{McpError, TransportError};
///
/// let error = McpError::Transport(TransportError::Closed {
///     transport_type: "sse".to_string(),
/// });
///
/// println!("Error: {}", error);
/// ```
#[derive(Error, Debug)]
pub enum McpError {
    /// Transport-related errors (connection, communication, lifecycle)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level errors (state violations, version mismatch, timeouts)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Encode/decode failures on the wire format
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error response returned by the remote peer
    #[error("Peer error: {0}")]
    Rpc(#[from] JsonRpcError),

    /// Configuration errors (invalid config files, missing parameters)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors (pipes, sockets, files)
    #[error("IO error: {source}")]
    Io {
        #[from]
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Generic errors for cases not covered by specific variants
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

/// Transport-specific errors shared by all transport implementations.
#[derive(Error, Debug, Clone)]
#[allow(missing_docs)]
pub enum TransportError {
    /// `start()` was called on a transport that is already running
    #[error("Transport already started ({transport_type})")]
    AlreadyStarted { transport_type: String },

    /// An operation needed a running transport
    #[error("Transport not started ({transport_type})")]
    NotStarted { transport_type: String },

    /// The transport was closed; pending and future operations fail
    #[error("Transport closed ({transport_type})")]
    Closed { transport_type: String },

    /// Failed to hand a message to the underlying medium
    #[error("Failed to send message via {transport_type}: {reason}")]
    SendFailed {
        transport_type: String,
        reason: String,
    },

    /// Failed to establish the underlying connection
    #[error("Failed to connect {transport_type} transport: {reason}")]
    ConnectionFailed {
        transport_type: String,
        reason: String,
    },

    /// HTTP round trip completed with a failure status
    #[error("HTTP error {status_code}: {reason}")]
    HttpStatus { status_code: u16, reason: String },

    /// Server-Sent Events stream failure
    #[error("SSE error: {reason}")]
    SseError { reason: String },

    /// A message referenced a session id this side does not know
    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },

    /// A second callback registration was attempted for the same hook
    #[error("Handler already registered for {hook}")]
    HandlerAlreadyRegistered { hook: String },

    /// Resumed stream skipped events that left the replay window
    #[error("Event stream gap: expected sequence {expected}, got {received}")]
    StreamGap { expected: u64, received: u64 },

    /// Transport-specific configuration is invalid
    #[error("Invalid {transport_type} configuration: {reason}")]
    InvalidConfig {
        transport_type: String,
        reason: String,
    },
}

/// Protocol-level errors related to session state and request lifecycle.
#[derive(Error, Debug, Clone)]
#[allow(missing_docs)]
pub enum ProtocolError {
    /// Handshake failed: no mutually supported protocol version
    #[error("Unsupported protocol version: {requested}, supported versions: {supported:?}")]
    VersionMismatch {
        requested: String,
        supported: Vec<String>,
    },

    /// Operation attempted before the handshake completed
    #[error("Session not initialized: {reason}")]
    NotInitialized { reason: String },

    /// The counterparty does not advertise the capability a method needs
    #[error("Capability '{capability}' required by '{method}' is not supported by the peer")]
    CapabilityNotSupported { method: String, capability: String },

    /// Outbound request exceeded its deadline
    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// Outbound request was cancelled locally
    #[error("Request cancelled: {reason}")]
    RequestCancelled { reason: String },

    /// Handshake response was malformed or arrived out of order
    #[error("Initialization failed: {reason}")]
    InitializationFailed { reason: String },
}

/// Encode/decode failures, distinct from protocol errors.
///
/// On the inbound path a codec failure on an envelope that still carries an
/// id is answered with a JSON-RPC parse/invalid-request error; a completely
/// unparseable blob is logged and the stream continues.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum CodecError {
    /// The payload was not valid JSON
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Valid JSON that does not form a JSON-RPC message
    #[error("Invalid JSON-RPC message: {reason}")]
    InvalidMessage { reason: String },

    /// Batch arrays are not supported by current protocol revisions
    #[error("JSON-RPC batch messages are not supported")]
    BatchNotSupported,
}

/// Configuration-related errors.
#[derive(Error, Debug, Clone)]
#[allow(missing_docs)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration file has invalid format
    #[error("Invalid configuration format in {path}: {reason}")]
    InvalidFormat { path: String, reason: String },

    /// Required configuration parameter is missing
    #[error("Missing required configuration parameter: {parameter}")]
    MissingParameter { parameter: String },

    /// Configuration parameter has invalid value
    #[error("Invalid value for parameter '{parameter}': {value} - {reason}")]
    InvalidValue {
        parameter: String,
        value: String,
        reason: String,
    },
}

/// Convenience type alias for Results using McpError.
pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    /// Create a new internal error with a custom message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the transport underneath this session is gone.
    ///
    /// Pending requests failed with such an error will never complete on a
    /// retry over the same session.
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, McpError::Transport(TransportError::Closed { .. }))
    }

    /// Map a handler failure to the JSON-RPC error object reported to the
    /// peer.
    ///
    /// Codec faults map to parse/invalid-request, capability and dispatch
    /// misses to method-not-found, cancellations to the cancelled code, and
    /// anything unrecognized becomes an internal error carrying the message
    /// in `data.message`.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            McpError::Codec(CodecError::Json { source }) => {
                JsonRpcError::new(core::PARSE_ERROR, "Parse error", None).with_detail(source)
            }
            McpError::Codec(err) => JsonRpcError::invalid_request(err.to_string()),
            McpError::Protocol(ProtocolError::CapabilityNotSupported { method, .. }) => {
                JsonRpcError::method_not_found(method.clone())
            }
            McpError::Protocol(ProtocolError::NotInitialized { reason }) => {
                JsonRpcError::server_not_initialized(reason.clone())
            }
            McpError::Protocol(ProtocolError::RequestCancelled { reason }) => {
                JsonRpcError::request_cancelled(reason.clone())
            }
            McpError::Rpc(err) => err.clone(),
            other => JsonRpcError::internal_error(other.to_string()),
        }
    }
}

impl JsonRpcError {
    fn with_detail(mut self, source: &serde_json::Error) -> Self {
        self.data = Some(serde_json::Value::String(source.to_string()));
        self
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Codec(CodecError::Json { source: err })
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            McpError::Transport(TransportError::ConnectionFailed {
                transport_type: "http".to_string(),
                reason: err.to_string(),
            })
        } else if let Some(status) = err.status() {
            McpError::Transport(TransportError::HttpStatus {
                status_code: status.as_u16(),
                reason: err.to_string(),
            })
        } else {
            McpError::Transport(TransportError::SendFailed {
                transport_type: "http".to_string(),
                reason: err.to_string(),
            })
        }
    }
}

impl From<url::ParseError> for McpError {
    fn from(err: url::ParseError) -> Self {
        McpError::Config(ConfigError::InvalidValue {
            parameter: "url".to_string(),
            value: err.to_string(),
            reason: "Invalid URL format".to_string(),
        })
    }
}
