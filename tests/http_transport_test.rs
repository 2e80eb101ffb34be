//! Integration tests for the plain HTTP transport against a mock server.

use std::time::Duration;

use serde_json::json;
use unity_mcp_bridge::transport::{HttpConfig, HttpTransport, ToolDefinition};
use unity_mcp_bridge::{TransportClient, TransportError};
use wiremock::matchers::{body_json, body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn tool(name: &str) -> ToolDefinition {
    serde_json::from_value(json!({
        "name": name,
        "description": "Bake lighting",
        "parameters": [{"name": "scene", "type": "string", "required": true}],
    }))
    .unwrap()
}

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::new(HttpConfig {
        base_url: server.uri(),
        project_id: "abc123".into(),
        tools: vec![tool("bake_lighting")],
        request_timeout: Duration::from_secs(2),
    })
    .unwrap()
}

async fn mount_registration(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/register-tools"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_start_registers_tools() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register-tools"))
        .and(body_json(json!({
            "project_id": "abc123",
            "tools": [{
                "name": "bake_lighting",
                "description": "Bake lighting",
                "parameters": [{"name": "scene", "type": "string", "required": true}],
            }],
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(transport.start().await);
    assert!(transport.start().await, "second start is a no-op");

    let state = transport.state();
    assert!(state.is_connected());
    assert_eq!(state.transport_name(), "http");
    assert!(state.session_id().is_some());
    assert_eq!(state.details(), Some(server.uri().as_str()));
}

#[tokio::test]
async fn test_registration_failure_fails_start() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register-tools"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(!transport.start().await);

    let state = transport.state();
    assert!(!state.is_connected());
    assert!(state.error().unwrap().contains("500"));
}

#[tokio::test]
async fn test_unreachable_server_fails_start() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = HttpTransport::new(HttpConfig {
        base_url: format!("http://127.0.0.1:{port}"),
        project_id: "abc123".into(),
        tools: Vec::new(),
        request_timeout: Duration::from_millis(500),
    })
    .unwrap();

    assert!(!transport.start().await);
    assert!(transport.state().error().is_some());
}

#[tokio::test]
async fn test_verify_lists_tools() {
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("GET"))
        .and(path("/tools"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tools": []})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(!transport.verify().await, "not started");
    assert!(transport.start().await);
    assert!(transport.verify().await);
}

#[tokio::test]
async fn test_verify_fails_on_server_error() {
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("GET"))
        .and(path("/tools"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(transport.start().await);
    assert!(!transport.verify().await);
}

#[tokio::test]
async fn test_send_command_posts_raw_json() {
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("POST"))
        .and(path("/command"))
        .and(body_string(r#"{"type":"bake_lighting","params":{}}"#))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"success","result":{}}"#))
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(transport.start().await);

    let response = transport
        .send_command(r#"{"type":"bake_lighting","params":{}}"#)
        .await
        .unwrap();
    assert_eq!(response, r#"{"status":"success","result":{}}"#);
}

#[tokio::test]
async fn test_send_command_maps_errors() {
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("POST"))
        .and(path("/command"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(transport.start().await);
    match transport.send_command("{}").await {
        Err(TransportError::SendFailed(msg)) => assert!(msg.contains("502"), "{msg}"),
        other => panic!("expected SendFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_command_timeout() {
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("POST"))
        .and(path("/command"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(transport.start().await);
    assert!(matches!(
        transport.send_command("{}").await,
        Err(TransportError::Timeout)
    ));
}

#[tokio::test]
async fn test_stop_unregisters_tools() {
    let server = MockServer::start().await;
    mount_registration(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/tools/abc123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server);
    assert!(transport.start().await);
    transport.stop().await;
    transport.stop().await;

    assert!(!transport.state().is_connected());
    assert!(matches!(
        transport.send_command("{}").await,
        Err(TransportError::InvalidOperation(_))
    ));
}
