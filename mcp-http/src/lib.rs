//! # MCP HTTP server transports
//!
//! Server-side counterparts of the HTTP transports in `mcp-core`:
//!
//! - [`sse::SseServer`]: the SSE transport pair. Each `GET` on the stream
//!   route mints a session, advertises the POST back-channel through an
//!   `endpoint` event, and then carries every outbound JSON-RPC message as
//!   a `message` event. The POST route forwards client messages into the
//!   matching session.
//! - [`streamable::StreamableHttpServer`]: the Streamable HTTP transport.
//!   One URL serves POST (submit), GET (resumable standalone stream with
//!   `Last-Event-ID` replay), and DELETE (terminate). Sessions ride the
//!   `Mcp-Session-Id` header.
//!
//! Both servers hand each new connection to the embedding code as a
//! transport ready for `McpServer::create_session`:
//!
//! ```rust,no_run
//! use mcp_core::{messages::Implementation, McpServer, ServerCapabilities};
//! use mcp_http::streamable::{StreamableHttpServer, StreamableHttpServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mcp = McpServer::new(
//!     Implementation::new("example-server", "0.1.0"),
//!     ServerCapabilities::default(),
//! );
//!
//! let (server, mut connections) = StreamableHttpServer::new(StreamableHttpServerConfig::default());
//! let handle = server.serve("127.0.0.1:3000").await?;
//! println!("listening on {}", handle.local_addr());
//!
//! while let Some(transport) = connections.recv().await {
//!     let session = mcp.create_session(Box::new(transport)).await?;
//!     tokio::spawn(async move { session.closed().await });
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod sse;
pub mod streamable;

pub use sse::{SseServer, SseServerConfig, SseServerTransport};
pub use streamable::{StreamableHttpServer, StreamableHttpServerConfig, StreamableServerTransport};
