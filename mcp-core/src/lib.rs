//! # MCP Core Library
//!
//! `mcp-core` is the protocol runtime of a Model Context Protocol (MCP)
//! implementation: a bidirectional, session-oriented JSON-RPC 2.0 engine
//! that both clients and servers build on.
//!
//! ## Features
//!
//! - **Message model & codec**: the four JSON-RPC message shapes as a tagged
//!   union with strict wire discrimination and exact request-id round-trips
//! - **Transport abstraction**: one duplex-carrier contract for stdio byte
//!   streams, the SSE pair, and Streamable HTTP
//! - **Protocol engine**: request correlation, progress streaming,
//!   cancellation in both directions, timeout management, capability gates
//! - **Sessions**: the MCP handshake for both roles, with version
//!   negotiation and the initialization state machine
//!
//! Domain payloads (tools, prompts, resources) stay opaque JSON: this crate
//! moves envelopes, correlates replies, and enforces the session rules.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcp_core::{
//!     client::McpClient,
//!     messages::Implementation,
//!     transport::{StdioConfig, stdio::StdioTransport},
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = StdioTransport::new(StdioConfig::new("python").arg("server.py"));
//!     let client = McpClient::connect(
//!         Box::new(transport),
//!         Implementation::new("example-client", "0.1.0"),
//!     )
//!     .await?;
//!
//!     let tools = client.request("tools/list", Some(json!({}))).await?;
//!     println!("{tools}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`error`]: structured error types for every failure mode
//! - [`messages`]: message model, codec, handshake and progress payloads
//! - [`transport`]: the transport contract and the client-side transports
//! - [`protocol`]: the session-agnostic engine
//! - [`client`] / [`server`]: the two session roles

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]

pub mod client;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types for convenience
pub use client::{ClientConfig, McpClient, McpClientBuilder, ServerInfo};
pub use error::{CodecError, McpError, McpResult, ProtocolError, TransportError};
pub use messages::{
    ClientCapabilities, Implementation, InitializeRequest, InitializeResult, JsonRpcError,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ProgressToken,
    ProtocolVersion, RequestId, ServerCapabilities,
};
pub use protocol::{
    notification_handler, request_handler, EngineOptions, NotificationHandler, ProtocolEngine,
    RequestContext, RequestHandler, RequestOptions, SessionRole, SessionState,
    TransportErrorHandler,
};
pub use server::{ClientInfo, McpServer, ServerConfig, ServerSession};
pub use transport::{Transport, TransportConfig, TransportHooks};

/// Current version of the mcp-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
