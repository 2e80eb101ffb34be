//! Integration tests for the loopback bridge host.
//!
//! These drive `StdioBridgeHost` over real sockets: handshake, framed
//! request/response, protocol violations and single-client replacement.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use unity_mcp_bridge::constants::HANDSHAKE_LINE;
use unity_mcp_bridge::dispatch::is_pong;
use unity_mcp_bridge::transport::framing::{read_frame, write_frame};
use unity_mcp_bridge::transport::StdioBridgeHost;
use unity_mcp_bridge::{BridgeClient, CommandRouter};

const IO_TIMEOUT: Duration = Duration::from_secs(2);

fn router() -> Arc<CommandRouter> {
    let mut router = CommandRouter::new();
    router.register("echo", |params: Value| async move { Ok::<_, String>(params) });
    Arc::new(router)
}

/// Connect a raw socket and consume the handshake line.
async fn connect_raw(port: u16) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    tokio::time::timeout(IO_TIMEOUT, reader.read_line(&mut line))
        .await
        .expect("handshake timed out")
        .unwrap();
    assert_eq!(line, HANDSHAKE_LINE);
    reader
}

/// Wait until the host reports a client other than `previous`.
async fn wait_for_new_client(host: &StdioBridgeHost, previous: Option<&str>) -> String {
    for _ in 0..100 {
        if let Some(id) = host.current_client() {
            if Some(id.as_str()) != previous {
                return id;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("host never registered a new client");
}

/// Read until EOF or error; true if the peer closed the connection.
async fn closed_by_peer(reader: &mut BufReader<TcpStream>) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(IO_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0) | Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

#[tokio::test]
async fn test_handshake_precedes_frames_and_ping_answers_pong() {
    let host = StdioBridgeHost::start(0, router()).unwrap();

    let mut client = BridgeClient::connect(host.port(), IO_TIMEOUT).await.unwrap();
    assert!(client.handshake().contains("FRAMING=1"));
    assert!(client.ping().await.unwrap());

    // Bare "ping" and the JSON form answer the same way.
    let response = client.request(r#"{"type":"ping"}"#).await.unwrap();
    assert!(is_pong(&response));
}

#[tokio::test]
async fn test_commands_are_dispatched_with_params() {
    let host = StdioBridgeHost::start(0, router()).unwrap();
    let mut client = BridgeClient::connect(host.port(), IO_TIMEOUT).await.unwrap();

    let response = client.send_command("echo", json!({"scene": "Main"})).await.unwrap();
    assert_eq!(response["status"], "success");
    assert_eq!(response["result"]["scene"], "Main");

    let response = client.send_command("bake", json!({})).await.unwrap();
    assert_eq!(response["status"], "error");
    assert!(response["error"].as_str().unwrap().contains("bake"));
}

#[tokio::test]
async fn test_responses_follow_request_order() {
    let host = StdioBridgeHost::start(0, router()).unwrap();
    let mut reader = connect_raw(host.port()).await;

    for i in 0..5 {
        let command = json!({"type": "echo", "params": {"n": i}}).to_string();
        write_frame(reader.get_mut(), command.as_bytes()).await.unwrap();
    }
    for i in 0..5 {
        let frame = tokio::time::timeout(IO_TIMEOUT, read_frame(&mut reader))
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["result"]["n"], i);
    }
}

#[tokio::test]
async fn test_reconnect_after_abrupt_close() {
    let host = StdioBridgeHost::start(0, router()).unwrap();

    let mut first = BridgeClient::connect(host.port(), IO_TIMEOUT).await.unwrap();
    assert!(first.ping().await.unwrap());
    let first_id = wait_for_new_client(&host, None).await;
    drop(first);

    let mut second = BridgeClient::connect(host.port(), IO_TIMEOUT).await.unwrap();
    let second_id = wait_for_new_client(&host, Some(first_id.as_str())).await;
    assert_ne!(first_id, second_id);
    assert!(second.ping().await.unwrap());
}

#[tokio::test]
#[allow(deprecated, reason = "SO_LINGER 0 is the only way to force a reset close")]
async fn test_reconnect_after_reset_close() {
    let host = StdioBridgeHost::start(0, router()).unwrap();

    let first = connect_raw(host.port()).await;
    let first_id = wait_for_new_client(&host, None).await;

    // Linger of zero closes with RST instead of FIN.
    first.get_ref().set_linger(Some(Duration::ZERO)).unwrap();
    drop(first);

    let mut second = BridgeClient::connect(host.port(), IO_TIMEOUT).await.unwrap();
    assert!(second.handshake().contains("FRAMING=1"));
    let second_id = wait_for_new_client(&host, Some(first_id.as_str())).await;
    assert_ne!(first_id, second_id);
    assert!(second.ping().await.unwrap());
}

#[tokio::test]
async fn test_new_client_replaces_open_client() {
    let host = StdioBridgeHost::start(0, router()).unwrap();

    let mut first = connect_raw(host.port()).await;
    let first_id = wait_for_new_client(&host, None).await;

    let mut second = BridgeClient::connect(host.port(), IO_TIMEOUT).await.unwrap();
    let second_id = wait_for_new_client(&host, Some(first_id.as_str())).await;
    assert_ne!(first_id, second_id);

    // The evicted connection is closed from the host side.
    assert!(closed_by_peer(&mut first).await);

    assert!(second.ping().await.unwrap());
    assert_eq!(host.current_client().as_deref(), Some(second_id.as_str()));
}

#[tokio::test]
async fn test_zero_length_frame_drops_connection() {
    let host = StdioBridgeHost::start(0, router()).unwrap();
    let mut reader = connect_raw(host.port()).await;

    reader.get_mut().write_all(&0u64.to_be_bytes()).await.unwrap();
    assert!(closed_by_peer(&mut reader).await);

    // The host keeps serving new clients.
    let mut client = BridgeClient::connect(host.port(), IO_TIMEOUT).await.unwrap();
    assert!(client.ping().await.unwrap());
}

#[tokio::test]
async fn test_oversized_frame_drops_connection() {
    let host = StdioBridgeHost::start(0, router()).unwrap();
    let mut reader = connect_raw(host.port()).await;

    let oversized = 64u64 * 1024 * 1024;
    reader.get_mut().write_all(&oversized.to_be_bytes()).await.unwrap();
    assert!(closed_by_peer(&mut reader).await);
}

#[tokio::test]
async fn test_non_utf8_payload_gets_error_envelope() {
    let host = StdioBridgeHost::start(0, router()).unwrap();
    let mut reader = connect_raw(host.port()).await;

    write_frame(reader.get_mut(), &[0xff, 0xfe, 0xfd]).await.unwrap();
    let frame = tokio::time::timeout(IO_TIMEOUT, read_frame(&mut reader))
        .await
        .unwrap()
        .unwrap();
    let value: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value["status"], "error");
}

#[tokio::test]
async fn test_shutdown_closes_client_and_stops_accepting() {
    let host = StdioBridgeHost::start(0, router()).unwrap();
    let port = host.port();
    let mut reader = connect_raw(port).await;
    wait_for_new_client(&host, None).await;

    host.shutdown();
    assert!(closed_by_peer(&mut reader).await);
    assert!(host.current_client().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!host.is_running());
    assert!(BridgeClient::connect(port, Duration::from_millis(300)).await.is_err());
}
