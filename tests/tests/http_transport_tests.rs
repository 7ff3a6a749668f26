//! End-to-end scenarios over real HTTP: the SSE pair and the Streamable
//! HTTP transport, each bound to an ephemeral port, with the full handshake
//! and tool traffic riding on top. The resumption test drives the wire
//! directly to observe event sequences and replay.

use std::net::SocketAddr;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mcp_core::messages::{methods, Implementation};
use mcp_core::transport::sse::SseTransport;
use mcp_core::transport::streamable::StreamableHttpTransport;
use mcp_core::transport::{SseConfig, StreamableHttpConfig};
use mcp_core::{McpClientBuilder, RequestOptions, ServerSession};
use mcp_http::sse::{SseServer, SseServerConfig};
use mcp_http::streamable::{StreamableHttpServer, StreamableHttpServerConfig};
use mcp_integration_tests::{demo_server, setup_test_logging};

/// Bind a streamable HTTP server and feed every new transport into a demo
/// MCP server, handing the sessions back to the test.
async fn spawn_streamable_server() -> (SocketAddr, mpsc::UnboundedReceiver<ServerSession>) {
    let (server, mut connections) = StreamableHttpServer::new(StreamableHttpServerConfig::default());
    let handle = server.serve("127.0.0.1:0").await.unwrap();
    let addr = handle.local_addr();

    let mcp = demo_server();
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        // Keep the server alive for the lifetime of the test process.
        let _handle = handle;
        while let Some(transport) = connections.recv().await {
            let session = mcp.create_session(Box::new(transport)).await.unwrap();
            let _ = session_tx.send(session);
        }
    });

    (addr, session_rx)
}

async fn spawn_sse_server() -> (SocketAddr, mpsc::UnboundedReceiver<ServerSession>) {
    let (server, mut connections) = SseServer::new(SseServerConfig::default());
    let handle = server.serve("127.0.0.1:0").await.unwrap();
    let addr = handle.local_addr();

    let mcp = demo_server();
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _handle = handle;
        while let Some(transport) = connections.recv().await {
            let session = mcp.create_session(Box::new(transport)).await.unwrap();
            let _ = session_tx.send(session);
        }
    });

    (addr, session_rx)
}

#[tokio::test]
async fn streamable_http_handshake_and_tool_call() {
    setup_test_logging();
    let (addr, mut sessions) = spawn_streamable_server().await;

    let config = StreamableHttpConfig::new(format!("http://{addr}/mcp").parse().unwrap());
    let transport = StreamableHttpTransport::new(config).unwrap();

    let client = McpClientBuilder::new(Implementation::new("http-client", "1.0"))
        .connect(Box::new(transport))
        .await
        .unwrap();

    let session = sessions.recv().await.unwrap();
    session.ready().await.unwrap();

    let result = client
        .request("tools/call", Some(json!({"name": "echo", "arguments": {"x": 1}})))
        .await
        .unwrap();
    assert_eq!(result["echoed"]["x"], 1);

    client.close().await;
}

#[tokio::test]
async fn streamable_http_progress_rides_the_request_stream() {
    setup_test_logging();
    let (addr, mut sessions) = spawn_streamable_server().await;

    let config = StreamableHttpConfig::new(format!("http://{addr}/mcp").parse().unwrap());
    let transport = StreamableHttpTransport::new(config).unwrap();
    let client = McpClientBuilder::new(Implementation::new("http-client", "1.0"))
        .connect(Box::new(transport))
        .await
        .unwrap();
    let session = sessions.recv().await.unwrap();
    session.ready().await.unwrap();

    let (options, mut progress) = RequestOptions::default().with_progress();
    let result = client
        .request_with_options("tools/call", Some(json!({"name": "slow"})), options)
        .await
        .unwrap();
    assert_eq!(result["content"], "finished");

    // All three updates arrived before the response completed the request.
    let mut observed = Vec::new();
    while let Ok(update) = progress.try_recv() {
        observed.push(update.progress);
    }
    assert_eq!(observed, vec![10.0, 50.0, 100.0]);

    client.close().await;
}

#[tokio::test]
async fn sse_pair_handshake_and_tool_call() {
    setup_test_logging();
    let (addr, mut sessions) = spawn_sse_server().await;

    let config = SseConfig::new(format!("http://{addr}/sse").parse().unwrap());
    let transport = SseTransport::new(config).unwrap();

    let client = McpClientBuilder::new(Implementation::new("sse-client", "1.0"))
        .connect(Box::new(transport))
        .await
        .unwrap();

    let session = sessions.recv().await.unwrap();
    session.ready().await.unwrap();

    let result = client
        .request("tools/call", Some(json!({"name": "echo", "arguments": {"y": 2}})))
        .await
        .unwrap();
    assert_eq!(result["echoed"]["y"], 2);

    client.close().await;
}

#[tokio::test]
async fn streamable_http_resume_replays_missed_events() {
    setup_test_logging();
    let (addr, mut sessions) = spawn_streamable_server().await;
    let url = format!("http://{addr}/mcp");
    let http = reqwest::Client::new();

    // Handshake by hand: the test needs raw control of the GET stream.
    let init = json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "raw-client", "version": "1.0"}
        }
    });
    let response = http
        .post(&url)
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .body(init.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let accepted = http
        .post(&url)
        .header("content-type", "application/json")
        .header("mcp-session-id", &session_id)
        .body(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);

    let session = sessions.recv().await.unwrap();
    session.ready().await.unwrap();

    // Seven server-initiated notifications land in the replay store while
    // no stream is connected.
    for n in 1..=7 {
        session
            .notify("notifications/message", Some(json!({"n": n})))
            .await
            .unwrap();
    }

    // Reconnect claiming to have seen events up to 5: the server must
    // replay 6 and 7, then continue live with 8.
    let stream = http
        .get(&url)
        .header("accept", "text/event-stream")
        .header("mcp-session-id", &session_id)
        .header("last-event-id", "5")
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);
    let mut events = stream.bytes_stream().eventsource();

    let sixth = events.next().await.unwrap().unwrap();
    assert_eq!(sixth.id, "6");
    let payload: Value = serde_json::from_str(&sixth.data).unwrap();
    assert_eq!(payload["params"]["n"], 6);

    let seventh = events.next().await.unwrap().unwrap();
    assert_eq!(seventh.id, "7");

    session
        .notify("notifications/message", Some(json!({"n": 8})))
        .await
        .unwrap();
    let eighth = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(eighth.id, "8");
    let payload: Value = serde_json::from_str(&eighth.data).unwrap();
    assert_eq!(payload["params"]["n"], 8);
}

#[tokio::test]
async fn streamable_http_rejects_unknown_and_missing_sessions() {
    setup_test_logging();
    let (addr, _sessions) = spawn_streamable_server().await;
    let url = format!("http://{addr}/mcp");
    let http = reqwest::Client::new();

    // Non-initialize POST without a session header.
    let response = http
        .post(&url)
        .header("content-type", "application/json")
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // POST for a session nobody created.
    let response = http
        .post(&url)
        .header("content-type", "application/json")
        .header("mcp-session-id", "no-such-session")
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Malformed body.
    let response = http
        .post(&url)
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn sse_post_failures_leave_the_stream_alive() {
    setup_test_logging();
    let (addr, mut sessions) = spawn_sse_server().await;

    let config = SseConfig::new(format!("http://{addr}/sse").parse().unwrap());
    let transport = SseTransport::new(config).unwrap();
    let client = McpClientBuilder::new(Implementation::new("sse-client", "1.0"))
        .connect(Box::new(transport))
        .await
        .unwrap();
    let session = sessions.recv().await.unwrap();
    session.ready().await.unwrap();

    // A POST for a session id the server does not know returns 404 and
    // must not affect the live session.
    let http = reqwest::Client::new();
    let response = http
        .post(format!("http://{addr}/messages?sessionId=bogus"))
        .header("content-type", "application/json")
        .body(json!({"jsonrpc": "2.0", "method": "noop"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    client.request(methods::PING, None).await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn streamable_http_delete_terminates_the_session() {
    setup_test_logging();
    let (addr, mut sessions) = spawn_streamable_server().await;
    let url = format!("http://{addr}/mcp");

    let config = StreamableHttpConfig::new(url.parse().unwrap());
    let transport = StreamableHttpTransport::new(config).unwrap();
    let client = McpClientBuilder::new(Implementation::new("http-client", "1.0"))
        .connect(Box::new(transport))
        .await
        .unwrap();
    let session = sessions.recv().await.unwrap();
    session.ready().await.unwrap();

    // close() issues the DELETE; the server-side session ends with it.
    client.close().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), mcp_core::SessionState::Closed);
}
