//! End-to-end session scenarios over in-memory transports: the handshake in
//! both directions, version negotiation, progress, cancellation, capability
//! gates, and shutdown semantics.

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use mcp_core::error::{McpError, ProtocolError};
use mcp_core::messages::core::METHOD_NOT_FOUND;
use mcp_core::messages::{methods, Implementation, ProtocolVersion, ServerCapabilities};
use mcp_core::protocol::{EngineOptions, ProtocolEngine, SessionRole};
use mcp_core::{
    request_handler, InitializeResult, McpClientBuilder, RequestOptions, SessionState,
};
use mcp_integration_tests::{demo_server, setup_test_logging, transport_pair};

#[tokio::test]
async fn handshake_happy_path() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();

    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();

    session.ready().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(client.is_ready());

    let info = client.server_info();
    assert_eq!(info.implementation.name, "demo-server");
    assert_eq!(info.protocol_version, ProtocolVersion::latest());
    assert!(info.capabilities.tools.is_some());

    let recorded = session.client_info().unwrap();
    assert_eq!(recorded.implementation.name, "demo-client");
}

#[tokio::test]
async fn server_counters_unknown_protocol_version() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();

    // Drive the handshake by hand so we can propose a version the server
    // has never heard of.
    let engine = ProtocolEngine::new(
        Box::new(client_transport),
        SessionRole::Client,
        EngineOptions::default(),
    )
    .await
    .unwrap();
    engine.open().await.unwrap();

    let result = engine
        .request(
            methods::INITIALIZE,
            Some(json!({
                "protocolVersion": "9999-99-99",
                "capabilities": {},
                "clientInfo": {"name": "time-traveler", "version": "1.0"}
            })),
            RequestOptions::default(),
        )
        .await
        .unwrap();

    let init: InitializeResult = serde_json::from_value(result).unwrap();
    assert_eq!(init.protocol_version, ProtocolVersion::latest());

    // The server keeps waiting for the client's decision.
    assert_eq!(session.state(), SessionState::Initializing);

    engine.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn client_rejects_unsupported_server_version() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    // A server that answers the handshake with a version from the future.
    let engine = ProtocolEngine::new(
        Box::new(server_transport),
        SessionRole::Server,
        EngineOptions::default(),
    )
    .await
    .unwrap();
    engine.set_request_handler(
        methods::INITIALIZE,
        request_handler(|_ctx, _params| async move {
            Ok(json!({
                "protocolVersion": "3000-01-01",
                "capabilities": {},
                "serverInfo": {"name": "future-server", "version": "1.0"}
            }))
        }),
    );
    engine.open().await.unwrap();

    let error = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap_err();
    assert_matches!(
        error,
        McpError::Protocol(ProtocolError::VersionMismatch { .. })
    );
}

#[tokio::test]
async fn requests_queued_during_handshake_are_served_after_ready() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();

    let engine = ProtocolEngine::new(
        Box::new(client_transport),
        SessionRole::Client,
        EngineOptions::default(),
    )
    .await
    .unwrap();
    engine.open().await.unwrap();

    engine
        .request(
            methods::INITIALIZE,
            Some(json!({
                "protocolVersion": ProtocolVersion::latest().as_str(),
                "capabilities": {},
                "clientInfo": {"name": "eager-client", "version": "1.0"}
            })),
            RequestOptions::default(),
        )
        .await
        .unwrap();

    // Fire a request before the initialized notification: the server must
    // hold it rather than reject it.
    let early = engine.clone();
    let pending =
        tokio::spawn(async move { early.request(methods::PING, None, RequestOptions::default()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert_eq!(session.state(), SessionState::Initializing);

    engine
        .notify(methods::INITIALIZED, Some(json!({})))
        .await
        .unwrap();

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply, json!({}));
    session.ready().await.unwrap();
}

#[tokio::test]
async fn progress_stream_arrives_in_order_before_completion() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let _session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();
    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();

    let (options, mut progress) = RequestOptions::default().with_progress();
    let result = client
        .request_with_options("tools/call", Some(json!({"name": "slow"})), options)
        .await
        .unwrap();
    assert_eq!(result["content"], "finished");

    let mut observed = Vec::new();
    while let Ok(update) = progress.try_recv() {
        observed.push((update.progress, update.total));
    }
    assert_eq!(
        observed,
        vec![
            (10.0, Some(100.0)),
            (50.0, Some(100.0)),
            (100.0, Some(100.0))
        ]
    );
}

#[tokio::test]
async fn cancellation_reaches_the_handler_and_fails_the_caller() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let _session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();
    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let error = client
        .request_with_options(
            "tools/call",
            Some(json!({"name": "hang"})),
            RequestOptions::default().with_cancellation(token),
        )
        .await
        .unwrap_err();
    assert_matches!(
        error,
        McpError::Protocol(ProtocolError::RequestCancelled { .. })
    );

    // The session survives the cancellation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.is_ready());
    client.request(methods::PING, None).await.unwrap();
}

#[tokio::test]
async fn unknown_method_yields_method_not_found_and_session_survives() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let _session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();
    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();

    let error = client.request("frobnicate", None).await.unwrap_err();
    match error {
        McpError::Rpc(rpc) => assert_eq!(rpc.code, METHOD_NOT_FOUND),
        other => panic!("expected rpc error, got {other}"),
    }

    assert!(client.is_ready());
    client.request(methods::PING, None).await.unwrap();
}

#[tokio::test]
async fn capability_gate_rejects_locally_before_send() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    // A server that advertises no capabilities at all.
    let bare = mcp_core::McpServer::new(
        Implementation::new("bare-server", "1.0"),
        ServerCapabilities::default(),
    );
    let _session = bare.create_session(Box::new(server_transport)).await.unwrap();

    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();

    let error = client
        .request("tools/call", Some(json!({"name": "anything"})))
        .await
        .unwrap_err();
    assert_matches!(
        error,
        McpError::Protocol(ProtocolError::CapabilityNotSupported { .. })
    );
}

#[tokio::test]
async fn closing_the_client_fails_pending_requests_and_ends_both_sides() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();
    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();
    session.ready().await.unwrap();

    let requester = client.request_with_options(
        "tools/call",
        Some(json!({"name": "hang"})),
        RequestOptions::default(),
    );
    let pending = tokio::spawn(async move { requester.await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await;

    let error = pending.await.unwrap().unwrap_err();
    assert!(error.is_transport_closed());
    assert_eq!(client.state(), SessionState::Closed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn request_timeout_produces_timeout_error() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let _session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();
    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();

    let error = client
        .request_with_options(
            "tools/call",
            Some(json!({"name": "hang"})),
            RequestOptions::with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_matches!(error, McpError::Protocol(ProtocolError::RequestTimeout { .. }));

    // The session remains usable afterwards.
    client.request(methods::PING, None).await.unwrap();
}

#[tokio::test]
async fn server_initiated_request_is_gated_by_client_capabilities() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    let session = demo_server()
        .create_session(Box::new(server_transport))
        .await
        .unwrap();
    // Client advertises nothing, so sampling must fail on the server side
    // without touching the wire.
    let _client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();
    session.ready().await.unwrap();

    let error = session
        .request("sampling/createMessage", Some(json!({})))
        .await
        .unwrap_err();
    assert_matches!(
        error,
        McpError::Protocol(ProtocolError::CapabilityNotSupported { .. })
    );
}

#[tokio::test]
async fn late_reply_after_timeout_is_dropped_without_side_effects() {
    setup_test_logging();
    let (client_transport, server_transport) = transport_pair();

    // A server whose handler ignores cancellation and replies anyway.
    let stubborn = mcp_core::McpServer::new(
        Implementation::new("stubborn-server", "1.0"),
        ServerCapabilities {
            tools: Some(Default::default()),
            ..Default::default()
        },
    )
    .request_handler(
        "tools/call",
        request_handler(|_ctx, _params| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(Value::String("late".to_string()))
        }),
    );
    let _session = stubborn
        .create_session(Box::new(server_transport))
        .await
        .unwrap();

    let client = McpClientBuilder::new(Implementation::new("demo-client", "1.0"))
        .connect(Box::new(client_transport))
        .await
        .unwrap();

    let error = client
        .request_with_options(
            "tools/call",
            Some(json!({})),
            RequestOptions::with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_matches!(error, McpError::Protocol(ProtocolError::RequestTimeout { .. }));

    // Give the late reply time to arrive; it must be discarded quietly.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.is_ready());
    client.request(methods::PING, None).await.unwrap();
}
