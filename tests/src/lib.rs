//! Shared helpers for the integration test suite.

use std::sync::Once;

use serde_json::{json, Value};

use mcp_core::messages::{Implementation, ServerCapabilities};
use mcp_core::transport::stdio::StdioTransport;
use mcp_core::{request_handler, McpServer};

static INIT_LOGGING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
pub fn setup_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// An in-memory wire: two connected byte-stream transports.
pub fn transport_pair() -> (StdioTransport, StdioTransport) {
    let (client_end, server_end) = tokio::io::duplex(16 * 1024);
    let (client_read, client_write) = tokio::io::split(client_end);
    let (server_read, server_write) = tokio::io::split(server_end);
    (
        StdioTransport::from_streams(client_read, client_write),
        StdioTransport::from_streams(server_read, server_write),
    )
}

/// A server blueprint exposing one tool-shaped method.
///
/// `tools/call` dispatches on the opaque `name` parameter: `"slow"` emits
/// progress 10/50/100 before finishing, `"hang"` waits for cancellation,
/// anything else echoes its arguments back.
pub fn demo_server() -> McpServer {
    let capabilities = ServerCapabilities {
        tools: Some(Default::default()),
        ..Default::default()
    };

    McpServer::new(Implementation::new("demo-server", "0.1.0"), capabilities).request_handler(
        "tools/call",
        request_handler(|ctx, params: Option<Value>| async move {
            let params = params.unwrap_or(Value::Null);
            match params.get("name").and_then(Value::as_str) {
                Some("slow") => {
                    for step in [10.0, 50.0, 100.0] {
                        ctx.send_progress(step, Some(100.0), None).await?;
                    }
                    Ok(json!({ "content": "finished" }))
                }
                Some("hang") => {
                    ctx.cancelled().await;
                    Ok(Value::Null)
                }
                _ => Ok(json!({ "echoed": params.get("arguments").cloned() })),
            }
        }),
    )
}
