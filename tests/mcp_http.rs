//! Integration tests for the streamable-HTTP MCP endpoint at `/mcp`.

mod common;

use std::time::Duration;

use common::{SseReader, TestServer};
use serde_json::{json, Value};
use webcam_mcp::config::LivenessConfig;
use webcam_mcp::transport::Transport;

#[tokio::test]
async fn initialize_mints_session_and_lists_tools() {
    let server = TestServer::start().await;
    let id = server.open_session("http-test", false).await;
    assert!(!id.is_empty());
    assert_eq!(server.session_count(), 1);

    let resp = server
        .mcp(Some(&id), json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let mut names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["capture", "screenshot"]);
}

#[tokio::test]
async fn capture_without_browser_points_at_ui() {
    let server = TestServer::start().await;
    let id = server.open_session("http-test", false).await;

    let resp = server
        .mcp(
            Some(&id),
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "capture", "arguments": {}}
            }),
        )
        .await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 3);
    assert_eq!(body["result"]["isError"], true);
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    assert!(
        text.contains(&server.addr.to_string()),
        "expected the UI address in: {text}"
    );
}

#[tokio::test]
async fn delete_removes_session() {
    let server = TestServer::start().await;
    let id = server.open_session("http-test", false).await;

    let resp = server
        .client
        .delete(server.url("/mcp"))
        .header("Mcp-Session-Id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(server.session_count(), 0);

    let resp = server
        .mcp(Some(&id), json!({"jsonrpc": "2.0", "id": 4, "method": "tools/list"}))
        .await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32001);
    assert!(body["id"].is_null());
}

#[tokio::test]
async fn request_without_session_is_rejected() {
    let server = TestServer::start().await;
    let resp = server
        .mcp(None, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32000);
}

#[tokio::test]
async fn session_cap_is_enforced() {
    let server = TestServer::start_with(LivenessConfig::default(), 1).await;
    server.open_session("first", false).await;

    let resp = server
        .mcp(
            None,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "second", "version": "1.0.0"}
                }
            }),
        )
        .await;
    assert_eq!(resp.status(), 503);
    assert_eq!(server.session_count(), 1);
}

#[tokio::test]
async fn closing_event_stream_removes_session() {
    let liveness = LivenessConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..LivenessConfig::default()
    };
    let server = TestServer::start_with(liveness, 8).await;
    let id = server.open_session("sse-test", false).await;

    let resp = server
        .client
        .get(server.url("/mcp"))
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    drop(resp);

    assert!(
        server.eventually(|s| s.session_count() == 0).await,
        "session should be torn down once its event stream closes"
    );
}

#[tokio::test]
async fn replaced_event_stream_keeps_session() {
    let liveness = LivenessConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..LivenessConfig::default()
    };
    let server = TestServer::start_with(liveness, 8).await;
    let id = server.open_session("sse-test", false).await;

    let open = || {
        server
            .client
            .get(server.url("/mcp"))
            .header("Accept", "text/event-stream")
            .header("Mcp-Session-Id", &id)
            .send()
    };
    let first = open().await.unwrap();
    let second = open().await.unwrap();
    drop(first);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.session_count(), 1);

    drop(second);
    assert!(server.eventually(|s| s.session_count() == 0).await);
}

#[tokio::test]
async fn ping_travels_over_event_stream() {
    let liveness = LivenessConfig {
        ping_interval: Duration::from_millis(100),
        ping_timeout: Duration::from_secs(1),
        ..LivenessConfig::default()
    };
    let server = TestServer::start_with(liveness, 8).await;
    let id = server.open_session("pinged", false).await;

    let resp = server
        .client
        .get(server.url("/mcp"))
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut events = SseReader::new(resp);

    let ping = loop {
        let msg = events.next_json().await;
        if msg["method"] == "ping" {
            break msg;
        }
    };
    let resp = server
        .mcp(
            Some(&id),
            json!({"jsonrpc": "2.0", "id": ping["id"].clone(), "result": {}}),
        )
        .await;
    assert_eq!(resp.status(), 202);

    let session = server.transport.registry().get(&id).unwrap();
    assert!(
        server.eventually(|_| session.ping_failures() == 0).await,
        "answered ping should clear the failure count"
    );
    assert!(session.last_ping_attempt().is_some());
}

#[tokio::test]
async fn shutdown_serves_existing_sessions_only() {
    let server = TestServer::start().await;
    let id = server.open_session("before-shutdown", false).await;
    server.transport.shutdown();

    let resp = server
        .mcp(Some(&id), json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    assert_eq!(resp.status(), 200);

    let resp = server
        .mcp(
            None,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "late", "version": "1.0.0"}
                }
            }),
        )
        .await;
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(server.session_count(), 1);
}
